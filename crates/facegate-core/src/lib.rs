//! facegate-core — Face verification engine.
//!
//! Scores a live probe embedding against enrolled gallery embeddings with a
//! blended cosine/L2 similarity, memoizes extraction per frame content, and
//! drives the verification loop that turns a stream of camera frames into a
//! single pass/stop decision.

pub mod cache;
pub mod config;
mod controller;
pub mod detector;
pub mod frame;
pub mod matcher;
pub mod recognizer;
pub mod session;
pub mod similarity;
pub mod types;

pub use cache::{CacheStats, EmbeddingCache};
pub use config::{ConfigError, VerifierConfig};
pub use detector::{ExposureGate, PresenceDetector};
pub use frame::{Frame, FrameKey};
pub use matcher::{Aggregation, GalleryMatcher, Matcher};
pub use recognizer::{EmbeddingExtractor, ExtractionError, MobileFaceNet};
pub use session::{SessionBuilder, SessionError, SessionHandle, SessionState, StopReason};
pub use similarity::{DimensionMismatch, Scorer};
pub use types::{Embedding, GalleryRecord, IdentityScore, MatchResult};
