//! Frame type, content-derived frame keys and exposure checks.

use image::RgbImage;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Default fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_PCT: f32 = 0.95;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("failed to load image {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// Identity of a frame's pixel content: SHA-256 over dimensions and RGB bytes.
///
/// Two frames with the same pixels share a key regardless of where they
/// were captured or stored, and the key is stable across processes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey([u8; 32]);

impl FrameKey {
    pub fn of(image: &RgbImage) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(image.width().to_le_bytes());
        hasher.update(image.height().to_le_bytes());
        hasher.update(image.as_raw());
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameKey(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    /// Monotonic sequence number assigned by the capture pipeline.
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image: Arc::new(image),
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Load an image file as a frame.
    pub fn open(path: impl AsRef<Path>, sequence: u64) -> Result<Self, FrameError> {
        let path = path.as_ref();
        let image = image::open(path)
            .map_err(|source| FrameError::Load {
                path: path.display().to_string(),
                source,
            })?
            .to_rgb8();
        Ok(Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Content key for the embedding cache.
    pub fn key(&self) -> FrameKey {
        FrameKey::of(&self.image)
    }

    /// Luma plane (BT.601 integer weights).
    pub fn luma(&self) -> Vec<u8> {
        self.image
            .pixels()
            .map(|p| {
                let [r, g, b] = p.0;
                ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
            })
            .collect()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Check if a frame is dark using an 8-bucket histogram.
///
/// Returns true if more than `threshold_pct` of pixels fall in the darkest
/// bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}
