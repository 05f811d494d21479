//! Decode-side mirror of [`crate::server::capture_pipeline`] (spec §4.3).
//!
//! Consumes the [`super::session::ClientEvent`] stream a [`super::session::ClientSession`]
//! produces and drives two independent decode loops: video (with keyframe
//! coalescing ahead of the decoder) and audio (decoder output landing in a
//! PCM ring buffer a real-time output callback drains).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::arena::FrameArena;
use crate::capture::Scaler;
use crate::clock::NetworkClock;
use crate::codec::{AudioDecoder, Bitstream, PixelPayload, PullResult, PushResult, VideoDecoder};
use crate::frame::{CursorPos, CursorShape, Frame};
use crate::rational::Rational;

use super::session::{ClientEvent, ServerPerfSample};

/// Builds the decoder/scaler collaborators a [`DecodePipeline`] drives,
/// mirroring [`crate::server::connection::StreamFactory`] on the capture
/// side (spec §4.3, §9 "Codec back-ends as capabilities").
pub trait DecodeFactory: Send + Sync {
    fn build_video_decoder(&self, arena: &FrameArena) -> anyhow::Result<Box<dyn VideoDecoder>>;
    fn build_scaler(&self, native_width: u32, native_height: u32) -> anyhow::Result<Box<dyn Scaler>>;
    fn build_audio_decoder(&self) -> anyhow::Result<Box<dyn AudioDecoder>>;
}

/// How many whole decoded video frames the presentation history holds
/// before the oldest is dropped to make room (spec §4.3 "bounded history").
const HISTORY_CAPACITY: usize = 32;

/// Target presentation depth: the renderer is expected to keep up within
/// one frame of this. Consistently running deeper than `min_depth + 1`
/// triggers a catch-up drop (spec §4.3 "depth-based eviction").
const MIN_PRESENT_DEPTH: usize = 1;

/// Consecutive over-depth pops before the history catches up by dropping
/// everything but the newest `MIN_PRESENT_DEPTH + 1` frames.
const OVER_DEPTH_STREAK_THRESHOLD: u32 = 8;

/// One 960-sample stereo Opus frame's worth of interleaved PCM (spec
/// GLOSSARY "Opus frame"); the ring buffer holds four of these (spec §4.3
/// "PCM ring buffer sized around four 960-sample stereo frames").
const PCM_FRAME_SAMPLES: usize = 960 * 2;
const PCM_RING_CAPACITY: usize = PCM_FRAME_SAMPLES * 4;

/// Coalescing queue of encoded video frames awaiting decode (spec §4.3,
/// §8 property 5 "Keyframe coalescing").
struct VideoQueue {
    queue: Mutex<VecDeque<Frame<Bitstream>>>,
    cv: Condvar,
}

impl VideoQueue {
    fn new() -> Arc<Self> {
        Arc::new(VideoQueue { queue: Mutex::new(VecDeque::new()), cv: Condvar::new() })
    }

    /// Appends `frame`, then coalesces: whenever two keyframes are queued,
    /// every frame up to (but not including) the later one is dropped, and
    /// its cursor snapshots are merged forward into the surviving keyframe
    /// before being discarded (spec §8 property 5).
    fn push(&self, frame: Frame<Bitstream>) {
        let mut guard = self.queue.lock().unwrap();
        guard.push_back(frame);
        coalesce(&mut guard);
        self.cv.notify_one();
    }

    fn wait_pop(&self, running: &AtomicBool) -> Option<Frame<Bitstream>> {
        let mut guard = self.queue.lock().unwrap();
        loop {
            if let Some(frame) = guard.pop_front() {
                return Some(frame);
            }
            if !running.load(Ordering::Acquire) {
                return None;
            }
            let (g, _timeout) = self.cv.wait_timeout(guard, std::time::Duration::from_millis(100)).unwrap();
            guard = g;
        }
    }
}

/// Drops every frame older than the latest of two queued keyframes,
/// repeating until at most one keyframe remains queued. Cursor metadata
/// from dropped frames survives by merging forward onto the keyframe that
/// replaces them (spec §8 scenario S6 "Late keyframe burst").
fn coalesce(queue: &mut VecDeque<Frame<Bitstream>>) {
    loop {
        let Some(first_kf) = queue.iter().position(|f| f.is_key_frame) else { return };
        let Some(second_kf) = queue.iter().skip(first_kf + 1).position(|f| f.is_key_frame).map(|i| i + first_kf + 1) else {
            return;
        };

        let mut merged_pos = None;
        let mut merged_shape = None;
        for dropped in queue.iter().take(second_kf) {
            if dropped.cursor_pos.is_some() {
                merged_pos = dropped.cursor_pos.clone();
            }
            if dropped.cursor_shape.is_some() {
                merged_shape = dropped.cursor_shape.clone();
            }
        }
        for _ in 0..second_kf {
            queue.pop_front();
        }
        if let Some(kept) = queue.front_mut() {
            if kept.cursor_pos.is_none() {
                kept.cursor_pos = merged_pos;
            }
            if kept.cursor_shape.is_none() {
                kept.cursor_shape = merged_shape;
            }
        }
    }
}

/// Bounded history of decoded video frames awaiting presentation (spec
/// §4.3 "Renderer... snapshots the latest decoded frame"). The renderer
/// pops in order; if it consistently falls behind, old frames are dropped
/// to catch back up rather than growing latency without bound.
struct FrameHistory {
    queue: Mutex<VecDeque<Frame<PixelPayload>>>,
    over_depth_streak: Mutex<u32>,
}

impl FrameHistory {
    fn new() -> Arc<Self> {
        Arc::new(FrameHistory { queue: Mutex::new(VecDeque::new()), over_depth_streak: Mutex::new(0) })
    }

    fn push(&self, frame: Frame<PixelPayload>) {
        let mut guard = self.queue.lock().unwrap();
        if guard.len() >= HISTORY_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(frame);
    }

    /// Non-blocking: the renderer calls this once per paint tick and keeps
    /// showing the previous frame if `None` comes back.
    fn try_pop(&self) -> Option<Frame<PixelPayload>> {
        let mut guard = self.queue.lock().unwrap();
        let depth = guard.len();

        let mut streak = self.over_depth_streak.lock().unwrap();
        if depth > MIN_PRESENT_DEPTH + 1 {
            *streak += 1;
        } else {
            *streak = 0;
        }
        if *streak > OVER_DEPTH_STREAK_THRESHOLD {
            while guard.len() > MIN_PRESENT_DEPTH + 1 {
                guard.pop_front();
            }
            *streak = 0;
        }
        drop(streak);

        guard.pop_front()
    }
}

/// Fixed-capacity PCM ring a real-time output callback drains (spec §4.3
/// "PCM ring buffer"). Never blocks: a decoder that outruns playback
/// overwrites the oldest unplayed samples; a reader that outruns decode
/// gets zero-fill and an underrun flag (spec §9 "Audio underrun").
struct PcmRing {
    samples: Mutex<VecDeque<i16>>,
    underrun: AtomicBool,
}

impl PcmRing {
    fn new() -> Arc<Self> {
        Arc::new(PcmRing { samples: Mutex::new(VecDeque::with_capacity(PCM_RING_CAPACITY)), underrun: AtomicBool::new(false) })
    }

    fn push(&self, pcm: &[i16]) {
        let mut guard = self.samples.lock().unwrap();
        for &s in pcm {
            if guard.len() >= PCM_RING_CAPACITY {
                guard.pop_front();
            }
            guard.push_back(s);
        }
    }

    /// Fills `out` from the ring, zero-filling and flagging an underrun for
    /// whatever portion isn't available yet.
    fn read_into(&self, out: &mut [i16]) -> bool {
        let mut guard = self.samples.lock().unwrap();
        let mut underran = false;
        for slot in out.iter_mut() {
            *slot = guard.pop_front().unwrap_or_else(|| {
                underran = true;
                0
            });
        }
        if underran {
            self.underrun.store(true, Ordering::Release);
        }
        underran
    }

    fn take_underrun_flag(&self) -> bool {
        self.underrun.swap(false, Ordering::AcqRel)
    }
}

struct Handles {
    demux: Option<JoinHandle<()>>,
    video: Option<JoinHandle<()>>,
    audio: Option<JoinHandle<()>>,
}

/// Orchestrates the decode->present path symmetric to
/// [`crate::server::capture_pipeline::CapturePipeline`] on the other end of
/// the wire (spec §4.3).
pub struct DecodePipeline {
    running: Arc<AtomicBool>,
    history: Arc<FrameHistory>,
    pcm: Arc<PcmRing>,
    handles: Mutex<Option<Handles>>,
}

impl DecodePipeline {
    pub fn new() -> Self {
        DecodePipeline {
            running: Arc::new(AtomicBool::new(false)),
            history: FrameHistory::new(),
            pcm: PcmRing::new(),
            handles: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Binds collaborators and spawns the demux/video/audio loops. `events`
    /// is the channel [`super::session::ClientSession::dial`] hands back;
    /// `on_cursor_shape` and `on_perf` let the UI layer react to the
    /// sideband events the video/audio loops don't carry on their own.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        arena: FrameArena,
        factory: Arc<dyn DecodeFactory>,
        clock: Arc<NetworkClock>,
        native_width: u32,
        native_height: u32,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
        on_cursor_shape: Arc<dyn Fn(Arc<CursorShape>) + Send + Sync>,
        on_perf: Arc<dyn Fn(ServerPerfSample) + Send + Sync>,
    ) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            anyhow::bail!("decode pipeline already running");
        }

        let mut video_decoder = factory.build_video_decoder(&arena)?;
        let mut scaler = factory.build_scaler(native_width, native_height)?;
        let mut audio_decoder = factory.build_audio_decoder()?;

        let video_queue = VideoQueue::new();
        let audio_queue: Arc<Mutex<VecDeque<Frame<Bitstream>>>> = Arc::new(Mutex::new(VecDeque::new()));
        let audio_cv = Arc::new(Condvar::new());

        let running = self.running.clone();
        let demux_handle = {
            let running = running.clone();
            let video_queue = video_queue.clone();
            let audio_queue = audio_queue.clone();
            let audio_cv = audio_cv.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        ClientEvent::Video { mut frame, cursor_visible, cursor_x, cursor_y } => {
                            frame.cursor_pos = Some(Arc::new(CursorPos {
                                visible: cursor_visible,
                                x: cursor_x,
                                y: cursor_y,
                                x_scale: Rational::new(1, 1),
                                y_scale: Rational::new(1, 1),
                            }));
                            video_queue.push(frame);
                        }
                        ClientEvent::CursorShape(shape) => on_cursor_shape(shape),
                        ClientEvent::Audio(frame) => {
                            let mut guard = audio_queue.lock().unwrap();
                            guard.push_back(frame);
                            audio_cv.notify_one();
                        }
                        ClientEvent::PerfReport(sample) => on_perf(sample),
                    }
                }
                running.store(false, Ordering::Release);
            })
        };

        let video_handle = {
            let running = running.clone();
            let video_queue = video_queue.clone();
            let history = self.history.clone();
            let clock = clock.clone();
            tokio::task::spawn_blocking(move || {
                video_loop(&running, video_queue.as_ref(), video_decoder.as_mut(), scaler.as_mut(), &arena, &clock, history.as_ref());
            })
        };

        let audio_handle = {
            let running = running.clone();
            let pcm = self.pcm.clone();
            tokio::task::spawn_blocking(move || {
                audio_loop(&running, audio_queue.as_ref(), &audio_cv, audio_decoder.as_mut(), pcm.as_ref());
            })
        };

        *self.handles.lock().unwrap() =
            Some(Handles { demux: Some(demux_handle), video: Some(video_handle), audio: Some(audio_handle) });
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handles = self.handles.lock().unwrap().take();
        if let Some(mut handles) = handles {
            if let Some(h) = handles.demux.take() {
                h.abort();
            }
            if let Some(h) = handles.video.take() {
                let _ = h.await;
            }
            if let Some(h) = handles.audio.take() {
                let _ = h.await;
            }
        }
    }

    /// Non-blocking; the UI paint tick calls this and keeps the previously
    /// presented frame on screen when it returns `None`.
    pub fn try_present_frame(&self) -> Option<Frame<PixelPayload>> {
        self.history.try_pop()
    }

    /// Fills `out` with the next PCM samples for an output callback,
    /// returning whether an underrun occurred during this read.
    pub fn read_audio(&self, out: &mut [i16]) -> bool {
        self.pcm.read_into(out)
    }

    pub fn take_underrun_flag(&self) -> bool {
        self.pcm.take_underrun_flag()
    }
}

impl Default for DecodePipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn video_loop(
    running: &AtomicBool,
    queue: &VideoQueue,
    decoder: &mut dyn VideoDecoder,
    scaler: &mut dyn Scaler,
    arena: &FrameArena,
    clock: &NetworkClock,
    history: &FrameHistory,
) {
    while running.load(Ordering::Acquire) {
        let Some(frame) = queue.wait_pop(running) else { break };

        match decoder.push(frame) {
            PushResult::Accepted => {}
            PushResult::QueueFull => {
                warn!("video decoder queue full; dropping frame");
                continue;
            }
        }

        loop {
            let (status, output) = decoder.try_pull();
            match status {
                PullResult::Ready => {
                    if let Some(decoded) = output {
                        let mut decoded = decoded;
                        decoded.time_decoded = clock.time();
                        let (x_ratio, y_ratio) = scaler.ratio();
                        if let Some(pos) = &decoded.cursor_pos {
                            decoded.cursor_pos = Some(Arc::new(pos.rescaled(x_ratio, y_ratio)));
                        }
                        let scaled = scaler.scale(decoded, arena);
                        history.push(scaled);
                    }
                }
                PullResult::NeedMore | PullResult::End => break,
            }
        }
    }
    decoder.flush();
}

fn audio_loop(
    running: &AtomicBool,
    queue: &Mutex<VecDeque<Frame<Bitstream>>>,
    cv: &Condvar,
    decoder: &mut dyn AudioDecoder,
    pcm: &PcmRing,
) {
    while running.load(Ordering::Acquire) {
        let frame = {
            let mut guard = queue.lock().unwrap();
            loop {
                if let Some(frame) = guard.pop_front() {
                    break Some(frame);
                }
                if !running.load(Ordering::Acquire) {
                    break None;
                }
                let (g, _timeout) = cv.wait_timeout(guard, std::time::Duration::from_millis(100)).unwrap();
                guard = g;
            }
        };
        let Some(frame) = frame else { break };

        match decoder.push(frame) {
            PushResult::Accepted => {}
            PushResult::QueueFull => {
                warn!("audio decoder queue full; dropping frame");
                continue;
            }
        }

        loop {
            match decoder.try_pull() {
                (PullResult::Ready, Some(frame)) => pcm.push(&frame.payload),
                (PullResult::Ready, None) | (PullResult::NeedMore, _) => break,
                (PullResult::End, _) => return,
            }
        }
    }
    decoder.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitstream_frame(is_key_frame: bool) -> Frame<Bitstream> {
        let mut f = Frame::new(vec![0u8]);
        f.is_key_frame = is_key_frame;
        f
    }

    #[test]
    fn coalesce_keeps_single_keyframe_untouched() {
        let mut q = VecDeque::new();
        q.push_back(bitstream_frame(true));
        q.push_back(bitstream_frame(false));
        coalesce(&mut q);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn coalesce_drops_through_earlier_keyframe_and_merges_cursor() {
        let k1 = bitstream_frame(true);
        let mut p1 = bitstream_frame(false);
        p1.cursor_pos = Some(Arc::new(CursorPos { visible: true, x: 1, y: 1, x_scale: Rational::new(1, 1), y_scale: Rational::new(1, 1) }));
        let p2 = bitstream_frame(false);
        let k2 = bitstream_frame(true);
        let p3 = bitstream_frame(false);

        let mut q = VecDeque::new();
        q.push_back(k1);
        q.push_back(p1);
        q.push_back(p2);
        q.push_back(k2);
        q.push_back(p3);
        coalesce(&mut q);

        assert_eq!(q.len(), 2);
        assert!(q[0].is_key_frame);
        assert_eq!(q[0].cursor_pos.as_ref().unwrap().x, 1);
        assert!(!q[1].is_key_frame);
    }

    #[test]
    fn coalesce_is_noop_with_no_keyframes() {
        let mut q = VecDeque::new();
        q.push_back(bitstream_frame(false));
        q.push_back(bitstream_frame(false));
        coalesce(&mut q);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn pcm_ring_zero_fills_and_flags_underrun_when_empty() {
        let ring = PcmRing::new();
        ring.push(&[1, 2, 3]);
        let mut out = [0i16; 5];
        let underran = ring.read_into(&mut out);
        assert!(underran);
        assert_eq!(out, [1, 2, 3, 0, 0]);
        assert!(ring.take_underrun_flag());
        assert!(!ring.take_underrun_flag());
    }

    #[test]
    fn pcm_ring_no_underrun_when_fully_supplied() {
        let ring = PcmRing::new();
        ring.push(&[1, 2, 3, 4]);
        let mut out = [0i16; 4];
        let underran = ring.read_into(&mut out);
        assert!(!underran);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn frame_history_drops_oldest_past_capacity() {
        let arena = FrameArena::open(2, 2, crate::frame::PixelFormat::Bgra8);
        let history = FrameHistory::new();
        for _ in 0..(HISTORY_CAPACITY + 5) {
            history.push(Frame::new(arena.alloc()));
        }
        assert_eq!(history.queue.lock().unwrap().len(), HISTORY_CAPACITY);
    }
}
