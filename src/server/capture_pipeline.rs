//! Capture -> scale -> encode -> wire pipeline (spec §4.2, §5 server threads
//! 3-5, SPEC_FULL.md §D.1 "ServerPerfReport").
//!
//! `configure`/`start`/`stop`/`on_output` are the only public operations;
//! everything else runs on blocking worker threads (`spawn_blocking`) driven
//! by a [`crate::rate_timer::RateTimer`], mirroring the "OS-thread
//! equivalents" the concurrency model calls for (SPEC_FULL.md §B).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::arena::FrameArena;
use crate::capture::{CapturedImage, FrameSource, Scaler};
use crate::clock::LocalClock;
use crate::codec::{AudioEncoder, Bitstream, PcmPayload, PixelPayload, PullResult, PushResult, VideoCodec, VideoEncoder};
use crate::error::ConfigError;
use crate::frame::Frame;
use crate::rate_timer::RateTimer;
use crate::rational::Rational;

/// Validated, not-yet-running stream parameters (spec §4.2 `configure`).
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: Rational,
    pub codec: VideoCodec,
}

/// One unit handed to the pipeline's output sink: either an encoded video
/// frame, an encoded audio frame, or a periodic performance sample (spec
/// §4.2 "sink for Frame<Bitstream>"; the perf variant is a supplemented
/// ambient feature, see SPEC_FULL.md §D.1).
pub enum EncodedOutput {
    Video(Frame<Bitstream>),
    Audio(Frame<Bitstream>),
    PerfReport(PerfSample),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PerfSample {
    pub capture_min: i64,
    pub capture_avg: i64,
    pub capture_max: i64,
    pub encoder_min: i64,
    pub encoder_avg: i64,
    pub encoder_max: i64,
}

struct RunningStats {
    min: i64,
    max: i64,
    sum: i64,
    count: i64,
}

impl RunningStats {
    fn new() -> Self {
        RunningStats { min: i64::MAX, max: i64::MIN, sum: 0, count: 0 }
    }

    fn record(&mut self, value: i64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    fn snapshot_and_reset(&mut self) -> (i64, i64, i64) {
        let result = if self.count == 0 { (0, 0, 0) } else { (self.min, self.sum / self.count, self.max) };
        *self = RunningStats::new();
        result
    }
}

struct PerfAccumulator {
    capture: Mutex<RunningStats>,
    encode: Mutex<RunningStats>,
    last_report: Mutex<Instant>,
}

impl PerfAccumulator {
    fn new() -> Arc<Self> {
        Arc::new(PerfAccumulator {
            capture: Mutex::new(RunningStats::new()),
            encode: Mutex::new(RunningStats::new()),
            last_report: Mutex::new(Instant::now()),
        })
    }

    fn record_capture(&self, micros: i64) {
        self.capture.lock().unwrap().record(micros);
    }

    fn record_encode(&self, micros: i64) {
        self.encode.lock().unwrap().record(micros);
    }

    /// Returns a sample and resets, but only once per second; otherwise
    /// `None` so callers can cheaply poll every tick.
    fn maybe_sample(&self) -> Option<PerfSample> {
        let mut last = self.last_report.lock().unwrap();
        if last.elapsed() < Duration::from_secs(1) {
            return None;
        }
        *last = Instant::now();
        drop(last);

        let (capture_min, capture_avg, capture_max) = self.capture.lock().unwrap().snapshot_and_reset();
        let (encoder_min, encoder_avg, encoder_max) = self.encode.lock().unwrap().snapshot_and_reset();
        Some(PerfSample { capture_min, capture_avg, capture_max, encoder_min, encoder_avg, encoder_max })
    }
}

/// Depth-1 back-pressure slot between the capture loop and the encode loop
/// (spec §4.2 "bounded input queue of depth 1"; §8 property 8).
struct PendingSlot {
    slot: Mutex<Option<Frame<PixelPayload>>>,
    cv: Condvar,
}

impl PendingSlot {
    fn new() -> Arc<Self> {
        Arc::new(PendingSlot { slot: Mutex::new(None), cv: Condvar::new() })
    }

    /// Replaces any pending frame; never stacks (spec §4.2).
    fn replace(&self, frame: Frame<PixelPayload>) {
        let mut guard = self.slot.lock().unwrap();
        *guard = Some(frame);
        self.cv.notify_one();
    }

    /// Blocks until a frame is available or `running` flips false, waking
    /// periodically to re-check the flag (spec §5 "threads check the flag
    /// on every loop iteration, including after wait-wakeups").
    fn wait_take(&self, running: &AtomicBool) -> Option<Frame<PixelPayload>> {
        let mut guard = self.slot.lock().unwrap();
        loop {
            if let Some(frame) = guard.take() {
                return Some(frame);
            }
            if !running.load(Ordering::Acquire) {
                return None;
            }
            let (g, _timeout) = self.cv.wait_timeout(guard, Duration::from_millis(100)).unwrap();
            guard = g;
        }
    }
}

struct Handles {
    capture: Option<JoinHandle<()>>,
    encode: Option<JoinHandle<()>>,
    audio: Option<JoinHandle<()>>,
}

/// Orchestrates one capture->encode->wire cycle per configured tick (spec
/// §4.2).
pub struct CapturePipeline {
    config: Mutex<Option<StreamConfig>>,
    running: Arc<AtomicBool>,
    handles: Mutex<Option<Handles>>,
    clock: Arc<LocalClock>,
}

impl CapturePipeline {
    pub fn new(clock: Arc<LocalClock>) -> Self {
        CapturePipeline {
            config: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(None),
            clock,
        }
    }

    /// Idempotent before `start`; rejected while streaming (spec §4.2).
    pub fn configure(&self, width: u32, height: u32, framerate: Rational, codec: VideoCodec) -> Result<(), ConfigError> {
        if self.running.load(Ordering::Acquire) {
            return Err(ConfigError::AlreadyStreaming);
        }
        crate::config::validate_stream_dimensions(width, height)?;
        *self.config.lock().unwrap() = Some(StreamConfig { width, height, framerate, codec });
        Ok(())
    }

    pub fn current_config(&self) -> Option<StreamConfig> {
        *self.config.lock().unwrap()
    }

    pub fn is_streaming(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Binds collaborators and spawns the capture/encode/audio loops (spec
    /// §4.2 `start`).
    pub fn start(
        &self,
        arena: FrameArena,
        mut source: Box<dyn FrameSource>,
        mut scaler: Box<dyn Scaler>,
        mut video_encoder: Box<dyn VideoEncoder>,
        mut audio_encoder: Box<dyn AudioEncoder>,
        on_output: Arc<dyn Fn(EncodedOutput) + Send + Sync>,
    ) -> Result<(), ConfigError> {
        let stream_config = self.config.lock().unwrap().ok_or(ConfigError::InvalidDimensions { width: 0, height: 0 })?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ConfigError::AlreadyStreaming);
        }

        let pending = PendingSlot::new();
        let delivered_first = Arc::new(AtomicBool::new(false));
        let perf = PerfAccumulator::new();
        let running = self.running.clone();
        let clock = self.clock.clone();
        // Shared between the video capture loop and the audio capture loop
        // (spec §5 server threads 3 and 5 both draw from one `FrameSource`).
        let source = Arc::new(Mutex::new(source));

        let capture_handle = {
            let running = running.clone();
            let pending = pending.clone();
            let delivered_first = delivered_first.clone();
            let perf = perf.clone();
            let clock = clock.clone();
            let arena = arena.clone();
            let source = source.clone();
            tokio::task::spawn_blocking(move || {
                capture_loop(stream_config, &running, &pending, &delivered_first, &perf, &clock, &arena, source.as_ref(), scaler.as_mut());
            })
        };

        let encode_handle = {
            let running = running.clone();
            let pending = pending.clone();
            let delivered_first = delivered_first.clone();
            let perf = perf.clone();
            let clock = clock.clone();
            let on_output = on_output.clone();
            tokio::task::spawn_blocking(move || {
                encode_loop(&running, &pending, &delivered_first, &perf, &clock, video_encoder.as_mut(), on_output.as_ref());
            })
        };

        let audio_handle = {
            let running = running.clone();
            let on_output = on_output.clone();
            let source = source.clone();
            tokio::task::spawn_blocking(move || {
                audio_loop(&running, source.as_ref(), audio_encoder.as_mut(), on_output.as_ref());
            })
        };

        *self.handles.lock().unwrap() = Some(Handles { capture: Some(capture_handle), encode: Some(encode_handle), audio: Some(audio_handle) });
        Ok(())
    }

    /// Signals both loops, waits for them to drain, releases arena buffers
    /// implicitly (dropping the last `Frame<PixelPayload>` references) (spec
    /// §4.2 `stop`).
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handles = self.handles.lock().unwrap().take();
        if let Some(mut handles) = handles {
            if let Some(h) = handles.capture.take() {
                let _ = h.await;
            }
            if let Some(h) = handles.encode.take() {
                let _ = h.await;
            }
            if let Some(h) = handles.audio.take() {
                let _ = h.await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_loop(
    stream_config: StreamConfig,
    running: &AtomicBool,
    pending: &PendingSlot,
    delivered_first: &AtomicBool,
    perf: &PerfAccumulator,
    clock: &LocalClock,
    arena: &FrameArena,
    source: &Mutex<Box<dyn FrameSource>>,
    scaler: &mut dyn Scaler,
) {
    let mut timer = RateTimer::new(stream_config.framerate);
    let mut last_image: Option<(Vec<u8>, u32, u32, crate::frame::PixelFormat)> = None;

    while running.load(Ordering::Acquire) {
        timer.wait_for_next_frame();
        if !running.load(Ordering::Acquire) {
            break;
        }

        let capture_start = Instant::now();
        let captured = source.lock().unwrap().capture_image();
        perf.record_capture(capture_start.elapsed().as_micros() as i64);

        let pix_frame = match captured {
            Ok(Some(src_frame)) => {
                let CapturedImage { buffer, width, height, format } = src_frame.payload;
                last_image = Some((buffer.as_slice().to_vec(), width, height, format));
                Some(Frame {
                    payload: buffer,
                    cursor_pos: src_frame.cursor_pos,
                    cursor_shape: src_frame.cursor_shape,
                    time_captured: clock.time(),
                    time_encoded: src_frame.time_encoded,
                    time_received: src_frame.time_received,
                    time_decoded: src_frame.time_decoded,
                    time_presented: src_frame.time_presented,
                    is_key_frame: src_frame.is_key_frame,
                })
            }
            Ok(None) => {
                // No new image: only resubmit while we haven't produced a
                // keyframe yet, to guarantee an initial frame (spec §4.2).
                if delivered_first.load(Ordering::Acquire) {
                    None
                } else {
                    last_image.as_ref().map(|(bytes, _, _, _)| {
                        let mut buf = arena.alloc();
                        buf.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
                        let mut frame = Frame::new(buf);
                        frame.time_captured = clock.time();
                        frame
                    })
                }
            }
            Err(e) => {
                error!(error = %e, "frame source failed; ending capture");
                running.store(false, Ordering::Release);
                break;
            }
        };

        if let Some(frame) = pix_frame {
            let scaled = scaler.scale(frame, arena);
            pending.replace(scaled);
        }
    }
}

fn encode_loop(
    running: &AtomicBool,
    pending: &PendingSlot,
    delivered_first: &AtomicBool,
    perf: &PerfAccumulator,
    clock: &LocalClock,
    encoder: &mut dyn VideoEncoder,
    on_output: &dyn Fn(EncodedOutput),
) {
    encoder.request_keyframe();

    while running.load(Ordering::Acquire) {
        let Some(frame) = pending.wait_take(running) else { break };

        if !delivered_first.load(Ordering::Acquire) {
            encoder.request_keyframe();
        }

        let encode_start = Instant::now();
        match encoder.push(frame) {
            PushResult::Accepted => {}
            PushResult::QueueFull => {
                // Transient (spec §7): a fresher frame will replace this one
                // on the next tick regardless.
                continue;
            }
        }

        loop {
            let (status, output) = encoder.try_pull();
            match status {
                PullResult::Ready => {
                    if let Some(mut bitstream_frame) = output {
                        bitstream_frame.time_encoded = clock.time();
                        if bitstream_frame.is_key_frame {
                            delivered_first.store(true, Ordering::Release);
                        }
                        on_output(EncodedOutput::Video(bitstream_frame));
                    }
                }
                PullResult::NeedMore | PullResult::End => break,
            }
        }
        perf.record_encode(encode_start.elapsed().as_micros() as i64);

        if let Some(sample) = perf.maybe_sample() {
            on_output(EncodedOutput::PerfReport(sample));
        }
    }

    encoder.flush();
}

/// Audio capture + encode, paired on one thread with a bounded FIFO to the
/// encoder (spec §5 server thread 5, §4.2 "Audio uses a bounded FIFO of PCM
/// chunks"). Polls the same `FrameSource` the video capture loop uses, under
/// its own short lock acquisition per chunk so the two loops never block
/// each other for longer than one `capture_audio`/`capture_image` call.
fn audio_loop(
    running: &AtomicBool,
    source: &Mutex<Box<dyn FrameSource>>,
    encoder: &mut dyn AudioEncoder,
    on_output: &dyn Fn(EncodedOutput),
) {
    while running.load(Ordering::Acquire) {
        let captured = source.lock().unwrap().capture_audio();
        match captured {
            Ok(Some(chunk)) => {
                let _ = push_audio_chunk(encoder, chunk);
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "audio source failed; ending audio capture");
                break;
            }
        }

        loop {
            match encoder.try_pull() {
                (PullResult::Ready, Some(frame)) => on_output(EncodedOutput::Audio(frame)),
                (PullResult::Ready, None) | (PullResult::NeedMore, _) => break,
                (PullResult::End, _) => return,
            }
        }

        std::thread::sleep(Duration::from_millis(5));
    }
    encoder.flush();
}

/// Feeds one captured PCM chunk into the audio encoder, applying the same
/// depth-bounded back-pressure rule as video (spec §4.2 "Audio uses a
/// bounded FIFO of PCM chunks").
pub fn push_audio_chunk(encoder: &mut dyn AudioEncoder, chunk: Frame<PcmPayload>) -> PushResult {
    match encoder.push(chunk) {
        PushResult::QueueFull => {
            warn!("audio encoder queue full; dropping chunk");
            PushResult::QueueFull
        }
        ok => ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_stats_reports_min_avg_max() {
        let mut stats = RunningStats::new();
        for v in [10, 20, 30] {
            stats.record(v);
        }
        let (min, avg, max) = stats.snapshot_and_reset();
        assert_eq!((min, avg, max), (10, 20, 30));
        let (min2, avg2, max2) = stats.snapshot_and_reset();
        assert_eq!((min2, avg2, max2), (0, 0, 0));
    }

    #[test]
    fn configure_rejects_zero_dimensions() {
        let pipeline = CapturePipeline::new(Arc::new(LocalClock::new()));
        let err = pipeline.configure(0, 720, Rational::new(60, 1), VideoCodec::H264).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDimensions { .. }));
    }

    #[test]
    fn configure_rejects_while_streaming() {
        let pipeline = CapturePipeline::new(Arc::new(LocalClock::new()));
        pipeline.configure(1920, 1080, Rational::new(60, 1), VideoCodec::H264).unwrap();
        pipeline.running.store(true, Ordering::Release);
        let err = pipeline.configure(1280, 720, Rational::new(30, 1), VideoCodec::H264).unwrap_err();
        assert!(matches!(err, ConfigError::AlreadyStreaming));
    }

    #[test]
    fn pending_slot_replaces_rather_than_stacks() {
        let arena = FrameArena::open(2, 2, crate::frame::PixelFormat::Bgra8);
        let slot = PendingSlot::new();
        slot.replace(Frame::new(arena.alloc()));
        slot.replace(Frame::new(arena.alloc()));
        let running = AtomicBool::new(true);
        let first = slot.wait_take(&running);
        assert!(first.is_some());
        // Only one frame was queued despite two replace() calls.
        let (live, _) = arena.stats();
        assert_eq!(live, 1);
    }
}
