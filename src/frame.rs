//! `Frame<T>` and its cursor side-channels (spec §3).
//!
//! The same generic threads through every pipeline stage: a pixel buffer
//! pre-encode, a compressed bitstream on the wire, and a pixel buffer again
//! post-decode. Only the payload type changes between stages; timing and
//! cursor fields are filled in by exactly one stage each (spec §5
//! "Ordering guarantees").

use std::sync::Arc;

/// Microsecond timestamp. `NOT_MEASURED` is the sentinel for an unfilled
/// stage timestamp (spec §3).
pub type Micros = i64;

/// Sentinel for a `Frame` timing field that hasn't been stamped yet.
pub const NOT_MEASURED: Micros = -1;

/// Pixel formats the arena and scaler deal in. Kept intentionally small:
/// concrete color conversion is an external collaborator's job (spec §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra8,
    Rgba8,
    Nv12,
    I420,
}

impl PixelFormat {
    /// Bytes per plane-packed pixel buffer of `width x height`, used to size
    /// arena blocks (spec §4.1).
    pub fn plane_size_bytes(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => pixels * 4,
            // 4:2:0 subsampled chroma: one luma byte per pixel plus 2 chroma
            // bytes per 2x2 block.
            PixelFormat::Nv12 | PixelFormat::I420 => pixels + pixels / 2,
        }
    }
}

/// Cursor shape encodings (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorShapeFormat {
    Rgba,
    RgbaXor,
    Monochrome,
}

/// Immutable snapshot of a pointer position, shared (never copied) across
/// frames that don't carry a fresh update (spec §9 "cursor metadata
/// propagation across drops").
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPos {
    pub visible: bool,
    pub x: i32,
    pub y: i32,
    pub x_scale: crate::rational::Rational,
    pub y_scale: crate::rational::Rational,
}

impl CursorPos {
    /// Rescale a cursor position after it passes through a scaler stage,
    /// composing the stage's in/out ratio onto the running scale factor
    /// (spec §4.3).
    pub fn rescaled(&self, stage_x: crate::rational::Rational, stage_y: crate::rational::Rational) -> CursorPos {
        CursorPos {
            visible: self.visible,
            x: self.x,
            y: self.y,
            x_scale: self.x_scale.mul(stage_x),
            y_scale: self.y_scale.mul(stage_y),
        }
    }
}

/// Immutable cursor bitmap, sent only when the shape actually changes.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorShape {
    pub w: u32,
    pub h: u32,
    pub hotspot_x: i32,
    pub hotspot_y: i32,
    pub format: CursorShapeFormat,
    pub image: Arc<[u8]>,
}

/// A carrier for pixel or bitstream data plus timing/cursor side-channels.
///
/// `payload` is generic so the exact same struct threads through
/// capture -> scale -> encode -> wire -> decode -> scale -> present without a
/// language-specific sum type (spec §9).
#[derive(Debug, Clone)]
pub struct Frame<T> {
    pub payload: T,
    pub cursor_pos: Option<Arc<CursorPos>>,
    pub cursor_shape: Option<Arc<CursorShape>>,
    pub time_captured: Micros,
    pub time_encoded: Micros,
    pub time_received: Micros,
    pub time_decoded: Micros,
    pub time_presented: Micros,
    pub is_key_frame: bool,
}

impl<T> Frame<T> {
    /// A fresh frame with all timestamps unset.
    pub fn new(payload: T) -> Self {
        Frame {
            payload,
            cursor_pos: None,
            cursor_shape: None,
            time_captured: NOT_MEASURED,
            time_encoded: NOT_MEASURED,
            time_received: NOT_MEASURED,
            time_decoded: NOT_MEASURED,
            time_presented: NOT_MEASURED,
            is_key_frame: false,
        }
    }

    /// Replace the payload, carrying every other field across unchanged.
    /// Used by stages (scale, encode, decode) that transform the payload
    /// type but must not disturb timestamps set by earlier stages or
    /// cursor snapshots.
    pub fn map_payload<U>(self, payload: U) -> Frame<U> {
        Frame {
            payload,
            cursor_pos: self.cursor_pos,
            cursor_shape: self.cursor_shape,
            time_captured: self.time_captured,
            time_encoded: self.time_encoded,
            time_received: self.time_received,
            time_decoded: self.time_decoded,
            time_presented: self.time_presented,
            is_key_frame: self.is_key_frame,
        }
    }

    /// Merge-forward rule (spec §4.3, §8 property 5): take the latest
    /// non-null cursor snapshot from `newer` over `self`, used when
    /// coalescing discards intermediate frames but must not lose cursor
    /// state.
    pub fn merge_cursor_forward(&mut self, newer: &Frame<T>) {
        if newer.cursor_pos.is_some() {
            self.cursor_pos = newer.cursor_pos.clone();
        }
        if newer.cursor_shape.is_some() {
            self.cursor_shape = newer.cursor_shape.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rational::Rational;

    #[test]
    fn new_frame_has_sentinel_timestamps() {
        let f = Frame::new(vec![0u8; 4]);
        assert_eq!(f.time_captured, NOT_MEASURED);
        assert_eq!(f.time_presented, NOT_MEASURED);
        assert!(f.cursor_pos.is_none());
    }

    #[test]
    fn map_payload_preserves_timing_and_cursor() {
        let mut f = Frame::new(vec![1u8, 2, 3]);
        f.time_captured = 100;
        f.cursor_pos = Some(Arc::new(CursorPos {
            visible: true,
            x: 1,
            y: 2,
            x_scale: Rational::new(1, 1),
            y_scale: Rational::new(1, 1),
        }));
        let mapped = f.map_payload(42u32);
        assert_eq!(mapped.payload, 42);
        assert_eq!(mapped.time_captured, 100);
        assert!(mapped.cursor_pos.is_some());
    }

    #[test]
    fn merge_cursor_forward_prefers_newer_non_null() {
        let mut base = Frame::new(());
        let mut newer = Frame::new(());
        newer.cursor_pos = Some(Arc::new(CursorPos {
            visible: true,
            x: 5,
            y: 6,
            x_scale: Rational::new(1, 1),
            y_scale: Rational::new(1, 1),
        }));
        base.merge_cursor_forward(&newer);
        assert_eq!(base.cursor_pos.as_ref().unwrap().x, 5);

        let mut stale = Frame::new(());
        stale.cursor_pos = None;
        base.merge_cursor_forward(&stale);
        // stale carries no update; base keeps the prior merge
        assert_eq!(base.cursor_pos.as_ref().unwrap().x, 5);
    }
}
