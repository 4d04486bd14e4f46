//! Verification sessions: start one against a gallery snapshot, feed it
//! frames, read its state, stop it.
//!
//! Each session runs its loop on a dedicated OS thread. Frames are handed
//! over through a single-slot mailbox (newest frame wins) and state changes
//! are broadcast on a `tokio::sync::watch` channel, so synchronous callers
//! can poll [`SessionHandle::state`] while async callers await
//! [`SessionHandle::finished`].

use crate::cache::{CacheStats, EmbeddingCache};
use crate::config::{ConfigError, VerifierConfig};
use crate::controller::Controller;
use crate::detector::PresenceDetector;
use crate::frame::Frame;
use crate::matcher::{GalleryMatcher, MatcherError};
use crate::recognizer::{EmbeddingExtractor, ExtractionError};
use crate::types::{GalleryRecord, MatchResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("matcher setup failed: {0}")]
    Matcher(#[from] MatcherError),
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Why a session stopped without passing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop` was called or the handle was dropped.
    Cancelled,
    /// The extractor returned an error; see [`SessionHandle::error`].
    ExtractorFailed,
}

/// Verification state machine.
///
/// `Idle → AwaitingFace → Extracting → Matching → (AwaitingFace | Passed)`;
/// `Stopped` is reachable from any non-terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    AwaitingFace,
    Extracting,
    Matching,
    Passed(MatchResult),
    Stopped(StopReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed(_) | Self::Stopped(_))
    }
}

/// State shared between the handle and the session thread.
pub(crate) struct Shared {
    pub(crate) frames: Mutex<Option<Frame>>,
    pub(crate) frame_ready: Condvar,
    pub(crate) stop: AtomicBool,
    pub(crate) passed: AtomicBool,
    pub(crate) face_present: AtomicBool,
    pub(crate) processed: AtomicU64,
    pub(crate) result: Mutex<Option<MatchResult>>,
    pub(crate) error: Mutex<Option<Arc<ExtractionError>>>,
    state_tx: watch::Sender<SessionState>,
}

impl Shared {
    fn new() -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let shared = Self {
            frames: Mutex::new(None),
            frame_ready: Condvar::new(),
            stop: AtomicBool::new(false),
            passed: AtomicBool::new(false),
            face_present: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            result: Mutex::new(None),
            error: Mutex::new(None),
            state_tx,
        };
        (shared, state_rx)
    }

    /// Move to `next` unless the session already reached a terminal state.
    pub(crate) fn transition(&self, next: SessionState) {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            tracing::debug!(from = ?state, to = ?next, "session state");
            *state = next;
            true
        });
    }

    /// Record the loop's final state and return what was actually published.
    ///
    /// A pass is only published if no stop was requested first; the check
    /// and the store happen under the result lock that `request_stop` also
    /// takes, so a stopped session never exposes a result.
    pub(crate) fn publish(&self, outcome: SessionState) -> SessionState {
        let outcome = match outcome {
            SessionState::Passed(result) => {
                let mut slot = self.result.lock();
                if self.stop.load(Ordering::SeqCst) {
                    tracing::debug!(name = %result.name, "discarding match found after stop");
                    SessionState::Stopped(StopReason::Cancelled)
                } else {
                    *slot = Some(result.clone());
                    self.passed.store(true, Ordering::SeqCst);
                    SessionState::Passed(result)
                }
            }
            other => other,
        };
        self.transition(outcome.clone());
        outcome
    }

    fn request_stop(&self) {
        {
            let _result = self.result.lock();
            self.stop.store(true, Ordering::SeqCst);
        }
        // Take the frame lock so a waiter can't miss the wakeup between
        // checking the flag and parking.
        drop(self.frames.lock());
        self.frame_ready.notify_all();
    }
}

/// Configures and starts one verification session.
///
/// The extractor is released when the session ends, so a builder starts
/// exactly one session.
pub struct SessionBuilder {
    extractor: Arc<dyn EmbeddingExtractor>,
    detector: Arc<dyn PresenceDetector>,
    config: VerifierConfig,
}

impl SessionBuilder {
    pub fn new(
        extractor: Arc<dyn EmbeddingExtractor>,
        detector: Arc<dyn PresenceDetector>,
    ) -> Self {
        Self {
            extractor,
            detector,
            config: VerifierConfig::default(),
        }
    }

    pub fn config(mut self, config: VerifierConfig) -> Self {
        self.config = config;
        self
    }

    /// Start verifying against `gallery` with the configured threshold.
    pub fn start(self, gallery: impl Into<Arc<[GalleryRecord]>>) -> Result<SessionHandle, SessionError> {
        let threshold = self.config.threshold;
        self.start_session(gallery, threshold)
    }

    /// Start verifying against `gallery`; a match passes when its similarity
    /// is strictly above `threshold`.
    ///
    /// Validates the configuration and builds the scoring pool before the
    /// session thread starts, failing fast if either is unusable.
    pub fn start_session(
        self,
        gallery: impl Into<Arc<[GalleryRecord]>>,
        threshold: f32,
    ) -> Result<SessionHandle, SessionError> {
        let config = VerifierConfig {
            threshold,
            ..self.config
        };
        config.validate()?;

        let matcher = GalleryMatcher::new(config.scorer(), config.aggregation)
            .with_workers(config.worker_count)?;
        let cache = Arc::new(EmbeddingCache::new(config.cache_capacity));

        let gallery: Arc<[GalleryRecord]> = gallery.into();
        let dimension = self.extractor.dimension();
        let mismatched = gallery
            .iter()
            .filter(|r| r.embedding.len() != dimension)
            .count();
        if mismatched > 0 {
            tracing::warn!(
                mismatched,
                dimension,
                "gallery records do not match the extractor dimension and will never match"
            );
        }

        let (shared, state_rx) = Shared::new();
        let shared = Arc::new(shared);

        let controller = Controller {
            shared: Arc::clone(&shared),
            gallery,
            threshold,
            matcher,
            cache: Arc::clone(&cache),
            extractor: self.extractor,
            detector: self.detector,
            poll_interval: config.poll_interval(),
        };

        let thread = std::thread::Builder::new()
            .name("facegate-session".into())
            .spawn(move || controller.run())
            .map_err(SessionError::Spawn)?;

        Ok(SessionHandle {
            shared,
            state_rx,
            cache,
            thread: Some(thread),
        })
    }
}

/// Caller's side of a running session. Dropping it stops the session.
pub struct SessionHandle {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SessionState>,
    cache: Arc<EmbeddingCache>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SessionHandle {
    /// Submit the latest frame. Never blocks on the loop; a frame that has
    /// not been picked up yet is replaced. Ignored once the session ended.
    pub fn feed_frame(&self, frame: Frame) {
        if self.is_finished() {
            return;
        }
        *self.shared.frames.lock() = Some(frame);
        self.shared.frame_ready.notify_one();
    }

    /// Request cancellation. Idempotent; a no-op after the session ended.
    ///
    /// Work already in flight may finish, but its result is discarded.
    pub fn stop(&self) {
        if !self.shared.stop.load(Ordering::SeqCst) {
            tracing::debug!("session stop requested");
        }
        self.shared.request_stop();
    }

    /// The passing match, once the session is `Passed`.
    pub fn current_result(&self) -> Option<MatchResult> {
        self.shared.result.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state_rx.borrow().is_terminal()
    }

    pub fn is_passed(&self) -> bool {
        self.shared.passed.load(Ordering::SeqCst)
    }

    /// Whether the presence detector saw a face in the last examined frame.
    pub fn face_present(&self) -> bool {
        self.shared.face_present.load(Ordering::SeqCst)
    }

    /// Frames the loop has finished examining, including ones without a face.
    ///
    /// A frame that ends the session is counted after the final state is
    /// published.
    pub fn processed_frames(&self) -> u64 {
        self.shared.processed.load(Ordering::SeqCst)
    }

    /// The extraction error that stopped the session, if any.
    pub fn error(&self) -> Option<Arc<ExtractionError>> {
        self.shared.error.lock().clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Receiver that sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait for `Passed` or `Stopped` and return it.
    pub async fn finished(&self) -> SessionState {
        let mut rx = self.state_rx.clone();
        let state = match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    /// Stop the session and wait for its thread to exit.
    pub fn shutdown(mut self) -> SessionState {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("session thread panicked");
            }
        }
        self.state()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ExposureGate;
    use crate::types::Embedding;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    /// Embeds a frame as its top-left pixel's RGB values.
    #[derive(Default)]
    struct PixelExtractor {
        calls: AtomicUsize,
        released: AtomicBool,
        fail: bool,
        delay: Option<Duration>,
    }

    impl EmbeddingExtractor for PixelExtractor {
        fn extract(&self, image: &RgbImage) -> Result<Embedding, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if self.fail {
                return Err(ExtractionError::InferenceFailed("model unavailable".into()));
            }
            let [r, g, b] = image.get_pixel(0, 0).0;
            Ok(Embedding::new(vec![r as f32, g as f32, b as f32]))
        }

        fn dimension(&self) -> usize {
            3
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn frame(rgb: [u8; 3], seq: u64) -> Frame {
        Frame::new(RgbImage::from_pixel(8, 8, Rgb(rgb)), seq)
    }

    const RED: [u8; 3] = [200, 40, 40];
    const GREEN: [u8; 3] = [40, 200, 40];
    const BLUE: [u8; 3] = [40, 40, 200];
    const BLACK: [u8; 3] = [0, 0, 0];

    fn gallery() -> Vec<GalleryRecord> {
        vec![
            GalleryRecord {
                id: 1,
                name: "alice".into(),
                path: "/faces/alice.jpg".into(),
                embedding: Embedding::new(vec![200.0, 40.0, 40.0]),
            },
            GalleryRecord {
                id: 2,
                name: "bob".into(),
                path: "/faces/bob.jpg".into(),
                embedding: Embedding::new(vec![40.0, 200.0, 40.0]),
            },
        ]
    }

    fn start(extractor: Arc<PixelExtractor>) -> SessionHandle {
        let config = VerifierConfig {
            worker_count: 2,
            poll_interval_ms: 10,
            ..VerifierConfig::default()
        };
        SessionBuilder::new(extractor, Arc::new(ExposureGate::default()))
            .config(config)
            .start(gallery())
            .unwrap()
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn finished(handle: &SessionHandle) -> SessionState {
        tokio::time::timeout(WAIT, handle.finished())
            .await
            .expect("session did not finish")
    }

    #[tokio::test]
    async fn test_matching_face_passes() {
        let extractor = Arc::new(PixelExtractor::default());
        let handle = start(Arc::clone(&extractor));
        handle.feed_frame(frame(RED, 1));

        let state = finished(&handle).await;
        let SessionState::Passed(result) = state else {
            panic!("expected pass, got {state:?}");
        };
        assert_eq!(result.name, "alice");
        assert_eq!(result.id, 1);
        assert!((result.similarity - 1.0).abs() < 1e-5);
        assert_eq!(handle.current_result(), Some(result));
        assert!(handle.is_passed());
        assert!(handle.face_present());

        wait_until(|| extractor.released.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_no_face_skips_extraction() {
        let extractor = Arc::new(PixelExtractor::default());
        let handle = start(Arc::clone(&extractor));
        let mut rx = handle.subscribe();

        handle.feed_frame(frame(BLACK, 1));
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == SessionState::AwaitingFace))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        wait_until(|| handle.processed_frames() == 1).await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert!(!handle.face_present());
        assert_eq!(handle.state(), SessionState::AwaitingFace);

        handle.stop();
        assert_eq!(
            finished(&handle).await,
            SessionState::Stopped(StopReason::Cancelled)
        );
        assert!(handle.current_result().is_none());
    }

    #[tokio::test]
    async fn test_non_match_keeps_polling_then_passes() {
        let extractor = Arc::new(PixelExtractor::default());
        let handle = start(Arc::clone(&extractor));

        handle.feed_frame(frame(BLUE, 1));
        wait_until(|| {
            extractor.calls.load(Ordering::SeqCst) == 1
                && handle.state() == SessionState::AwaitingFace
        })
        .await;
        assert!(handle.current_result().is_none());

        handle.feed_frame(frame(GREEN, 2));
        let state = finished(&handle).await;
        assert!(matches!(&state, SessionState::Passed(m) if m.name == "bob"), "{state:?}");
    }

    #[tokio::test]
    async fn test_wrong_dimension_records_are_ignored() {
        let mut records = gallery();
        records.insert(
            0,
            GalleryRecord {
                id: 9,
                name: "legacy".into(),
                path: "/faces/legacy.jpg".into(),
                embedding: Embedding::new(vec![200.0, 40.0]),
            },
        );
        let handle = SessionBuilder::new(
            Arc::new(PixelExtractor::default()),
            Arc::new(ExposureGate::default()),
        )
        .start(records)
        .unwrap();

        handle.feed_frame(frame(RED, 1));
        let state = finished(&handle).await;
        assert!(matches!(&state, SessionState::Passed(m) if m.id == 1), "{state:?}");
    }

    #[test]
    fn test_stop_once_processed_keeps_pass() {
        for round in 0..50 {
            let handle = start(Arc::new(PixelExtractor::default()));
            handle.feed_frame(frame(RED, round));

            let deadline = std::time::Instant::now() + WAIT;
            while handle.processed_frames() < 1 {
                assert!(std::time::Instant::now() < deadline, "frame never processed");
                std::hint::spin_loop();
            }
            handle.stop();

            let state = handle.shutdown();
            assert!(
                matches!(&state, SessionState::Passed(m) if m.name == "alice"),
                "round {round}: {state:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_repeated_frame_content_uses_cache() {
        let extractor = Arc::new(PixelExtractor::default());
        let handle = start(Arc::clone(&extractor));

        handle.feed_frame(frame(BLUE, 1));
        wait_until(|| handle.cache_stats().misses == 1 && handle.state() == SessionState::AwaitingFace)
            .await;
        handle.feed_frame(frame(BLUE, 2));
        wait_until(|| handle.cache_stats().hits == 1).await;

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        handle.stop();
        finished(&handle).await;
    }

    #[tokio::test]
    async fn test_extractor_failure_stops_session() {
        let extractor = Arc::new(PixelExtractor {
            fail: true,
            ..Default::default()
        });
        let handle = start(Arc::clone(&extractor));
        handle.feed_frame(frame(RED, 1));

        assert_eq!(
            finished(&handle).await,
            SessionState::Stopped(StopReason::ExtractorFailed)
        );
        assert!(matches!(
            handle.error().as_deref(),
            Some(ExtractionError::InferenceFailed(_))
        ));
        assert!(handle.current_result().is_none());
        assert_eq!(handle.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn test_stop_mid_attempt_discards_result() {
        let extractor = Arc::new(PixelExtractor {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let handle = start(Arc::clone(&extractor));
        handle.feed_frame(frame(RED, 1));

        wait_until(|| extractor.calls.load(Ordering::SeqCst) == 1).await;
        handle.stop();

        assert_eq!(
            finished(&handle).await,
            SessionState::Stopped(StopReason::Cancelled)
        );
        // let the in-flight extraction run out
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.current_result().is_none());
        assert!(!handle.is_passed());
        assert_eq!(handle.state(), SessionState::Stopped(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let extractor = Arc::new(PixelExtractor::default());
        let handle = start(Arc::clone(&extractor));
        handle.stop();
        handle.stop();
        assert_eq!(
            finished(&handle).await,
            SessionState::Stopped(StopReason::Cancelled)
        );

        handle.feed_frame(frame(RED, 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert!(handle.current_result().is_none());
        wait_until(|| extractor.released.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_empty_gallery_never_passes() {
        let extractor = Arc::new(PixelExtractor::default());
        let handle = SessionBuilder::new(
            Arc::clone(&extractor) as Arc<dyn EmbeddingExtractor>,
            Arc::new(ExposureGate::default()),
        )
        .start_session(Vec::<GalleryRecord>::new(), 0.5)
        .unwrap();

        handle.feed_frame(frame(RED, 1));
        wait_until(|| extractor.calls.load(Ordering::SeqCst) == 1).await;
        wait_until(|| handle.state() == SessionState::AwaitingFace).await;
        assert_eq!(handle.shutdown(), SessionState::Stopped(StopReason::Cancelled));
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let config = VerifierConfig {
            worker_count: 0,
            ..VerifierConfig::default()
        };
        let result = SessionBuilder::new(
            Arc::new(PixelExtractor::default()),
            Arc::new(ExposureGate::default()),
        )
        .config(config)
        .start(gallery());
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[test]
    fn test_drop_handle_releases_extractor() {
        let extractor = Arc::new(PixelExtractor::default());
        let handle = start(Arc::clone(&extractor));
        drop(handle);

        let deadline = std::time::Instant::now() + WAIT;
        while !extractor.released.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "extractor never released");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Matching.is_terminal());
        assert!(SessionState::Stopped(StopReason::Cancelled).is_terminal());
    }
}
