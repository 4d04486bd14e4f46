//! Face presence detection boundary.

use crate::frame::{is_dark_frame, Frame};

/// Answers whether a frame currently shows a face.
///
/// Implementations must be side-effect free and return quickly; the
/// verification loop calls this once per new frame.
pub trait PresenceDetector: Send + Sync {
    fn has_face(&self, frame: &Frame) -> bool;
}

impl<F> PresenceDetector for F
where
    F: Fn(&Frame) -> bool + Send + Sync,
{
    fn has_face(&self, frame: &Frame) -> bool {
        self(frame)
    }
}

/// Treats any adequately exposed frame as showing a subject.
///
/// Meant for inputs that are already face crops (enrollment photos, test
/// fixtures) where no detection model is loaded. Underexposed frames are
/// reported as empty so the loop skips them.
#[derive(Debug, Clone, Copy)]
pub struct ExposureGate {
    pub dark_pct: f32,
}

impl Default for ExposureGate {
    fn default() -> Self {
        Self {
            dark_pct: crate::frame::DARK_FRAME_PCT,
        }
    }
}

impl PresenceDetector for ExposureGate {
    fn has_face(&self, frame: &Frame) -> bool {
        let dark = is_dark_frame(&frame.luma(), self.dark_pct);
        if dark {
            tracing::debug!(seq = frame.sequence, "skipping dark frame");
        }
        !dark
    }
}
