//! The verification loop that runs on the session thread.
//!
//! Waits for the next frame, checks presence, extracts (or recalls) the
//! probe embedding and matches it against the gallery snapshot, until a
//! match passes, the extractor fails or the session is stopped.

use crate::cache::EmbeddingCache;
use crate::detector::PresenceDetector;
use crate::frame::Frame;
use crate::matcher::{GalleryMatcher, Matcher};
use crate::recognizer::{EmbeddingExtractor, ExtractionError};
use crate::session::{SessionState, Shared, StopReason};
use crate::types::{GalleryRecord, MatchResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Why an attempt ended without a verdict.
enum Interrupt {
    Cancelled,
    Failed(ExtractionError),
}

pub(crate) struct Controller {
    pub(crate) shared: Arc<Shared>,
    pub(crate) gallery: Arc<[GalleryRecord]>,
    pub(crate) threshold: f32,
    pub(crate) matcher: GalleryMatcher,
    pub(crate) cache: Arc<EmbeddingCache>,
    pub(crate) extractor: Arc<dyn EmbeddingExtractor>,
    pub(crate) detector: Arc<dyn PresenceDetector>,
    pub(crate) poll_interval: Duration,
}

impl Controller {
    pub(crate) fn run(self) {
        tracing::info!(
            gallery = self.gallery.len(),
            threshold = self.threshold,
            aggregation = %self.matcher.aggregation(),
            workers = self.matcher.workers(),
            "verification session started"
        );
        self.shared.transition(SessionState::AwaitingFace);

        // `examined` is whether the outcome came from a frame.
        let (outcome, examined) = loop {
            let Some(frame) = self.next_frame() else {
                break (SessionState::Stopped(StopReason::Cancelled), false);
            };
            match self.attempt(&frame) {
                Ok(Some(result)) => break (SessionState::Passed(result), true),
                Ok(None) => {
                    self.shared.processed.fetch_add(1, Ordering::SeqCst);
                }
                Err(Interrupt::Cancelled) => {
                    break (SessionState::Stopped(StopReason::Cancelled), true)
                }
                Err(Interrupt::Failed(err)) => {
                    tracing::error!(seq = frame.sequence, error = %err, "embedding extraction failed");
                    *self.shared.error.lock() = Some(Arc::new(err));
                    break (SessionState::Stopped(StopReason::ExtractorFailed), true);
                }
            }
        };

        // A frame that ends the session counts as processed only once its
        // outcome is published.
        let final_state = self.shared.publish(outcome);
        if examined {
            self.shared.processed.fetch_add(1, Ordering::SeqCst);
        }
        self.extractor.release();

        let stats = self.cache.stats();
        match &final_state {
            SessionState::Passed(result) => tracing::info!(
                id = result.id,
                name = %result.name,
                similarity = result.similarity,
                cache_hits = stats.hits,
                cache_misses = stats.misses,
                "verification passed"
            ),
            state => tracing::info!(
                state = ?state,
                cache_hits = stats.hits,
                cache_misses = stats.misses,
                "verification session stopped"
            ),
        }
    }

    /// Block until a frame is available or the session is stopped.
    ///
    /// Only the most recent frame is kept; frames that arrive while an
    /// attempt is running replace each other.
    fn next_frame(&self) -> Option<Frame> {
        let mut slot = self.shared.frames.lock();
        loop {
            if self.stopped() {
                return None;
            }
            if let Some(frame) = slot.take() {
                return Some(frame);
            }
            self.shared.frame_ready.wait_for(&mut slot, self.poll_interval);
        }
    }

    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    fn check_stop(&self) -> Result<(), Interrupt> {
        if self.stopped() {
            return Err(Interrupt::Cancelled);
        }
        Ok(())
    }

    /// One pass over one frame. `Ok(Some(_))` is a passing match.
    fn attempt(&self, frame: &Frame) -> Result<Option<MatchResult>, Interrupt> {
        let present = self.detector.has_face(frame);
        self.shared.face_present.store(present, Ordering::SeqCst);
        if !present {
            self.shared.transition(SessionState::AwaitingFace);
            return Ok(None);
        }

        self.check_stop()?;
        self.shared.transition(SessionState::Extracting);
        let key = frame.key();
        let probe = self
            .cache
            .get_or_compute(key, || self.extractor.extract(&frame.image))
            .map_err(Interrupt::Failed)?;

        // Anything computed after a stop request is discarded.
        self.check_stop()?;
        self.shared.transition(SessionState::Matching);
        let best = self.matcher.best_match(&probe, &self.gallery);
        self.check_stop()?;

        match best {
            Some(result) if result.passes(self.threshold) => Ok(Some(result)),
            best => {
                tracing::debug!(
                    seq = frame.sequence,
                    best = ?best.as_ref().map(|m| (&m.name, m.similarity)),
                    threshold = self.threshold,
                    "no match above threshold"
                );
                self.shared.transition(SessionState::AwaitingFace);
                Ok(None)
            }
        }
    }
}
