//! Capture-side external collaborator contracts (spec §1, §4.2).
//!
//! Concrete desktop-duplication/audio-loopback back-ends and color
//! conversion live outside this crate; `FrameSource` and `Scaler` are the
//! seams the capture pipeline drives them through.

use crate::codec::PcmPayload;
use crate::frame::{Frame, PixelFormat};

/// One sample of captured screen content plus whatever cursor metadata
/// changed since the previous capture.
pub struct CapturedImage {
    pub buffer: crate::arena::Buffer,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// OS-specific desktop/audio capture, injected into `CapturePipeline`.
///
/// `capture_image` may return `None` if no new image is available since the
/// last call; the pipeline decides whether to resubmit the previous frame
/// (spec §4.2 "initial keyframe" rule).
pub trait FrameSource: Send {
    fn capture_image(&mut self) -> std::io::Result<Option<Frame<CapturedImage>>>;
    fn capture_audio(&mut self) -> std::io::Result<Option<Frame<PcmPayload>>>;
    fn native_width(&self) -> u32;
    fn native_height(&self) -> u32;
}

/// Resolution/colorspace conversion, injected between capture and encode
/// (and symmetrically between decode and present).
pub trait Scaler: Send {
    /// `(in_width, in_height) -> (out_width, out_height)` ratio, used to
    /// rescale cursor coordinates alongside the pixel data (spec §4.3).
    fn ratio(&self) -> (crate::rational::Rational, crate::rational::Rational);

    fn scale(
        &mut self,
        input: Frame<crate::arena::Buffer>,
        arena: &crate::arena::FrameArena,
    ) -> Frame<crate::arena::Buffer>;
}
