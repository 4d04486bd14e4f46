mod paths;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{
    Aggregation, EmbeddingExtractor, ExposureGate, Frame, GalleryMatcher, GalleryRecord,
    MobileFaceNet, SessionBuilder, SessionState, VerifierConfig,
};
use facegate_store::FaceStore;
use paths::Paths;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "facegate", about = "On-device face verification CLI")]
struct Cli {
    /// TOML verifier settings; replaces FACEGATE_* environment settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Gallery database (default: $FACEGATE_DB_PATH or the XDG data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// MobileFaceNet ONNX model (default: $FACEGATE_MODEL_PATH)
    #[arg(long, global = true)]
    model: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll one or more face images
    Enroll {
        /// Identity name; defaults to each image's file name
        #[arg(short, long)]
        name: Option<String>,
        /// Face crops to enroll
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List enrolled faces
    List,
    /// Remove an enrolled face
    Remove {
        /// Record id to remove
        id: i64,
    },
    /// Remove every enrolled face
    Clear,
    /// Run a verification session over a sequence of frames
    Verify {
        /// Aggregation policy: single-best or grouped-average
        #[arg(long)]
        policy: Option<Aggregation>,
        /// Similarity a match must exceed
        #[arg(long)]
        threshold: Option<f32>,
        /// Pause between frames, in milliseconds
        #[arg(long, default_value_t = 0)]
        frame_interval_ms: u64,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
        /// Frames in capture order
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Score one image against every enrolled identity
    Rank {
        /// Aggregation policy: single-best or grouped-average
        #[arg(long)]
        policy: Option<Aggregation>,
        image: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = Paths::from_env();
    let db_path = cli.db.clone().unwrap_or(paths.db_path);
    let model_path = cli.model.clone().unwrap_or(paths.model_path);
    let mut config = match &cli.config {
        Some(path) => VerifierConfig::load(path)?,
        None => VerifierConfig::from_env(),
    };

    match cli.command {
        Commands::Enroll { name, images } => {
            let store = FaceStore::open(&db_path)?;
            let model = load_model(&model_path)?;
            for path in &images {
                let frame = Frame::open(path, 0)?;
                let embedding = model
                    .extract(&frame.image)
                    .with_context(|| format!("extracting {}", path.display()))?;
                let label = match &name {
                    Some(n) => n.clone(),
                    None => file_name(path),
                };
                let id = store.insert(&label, &path.display().to_string(), &embedding)?;
                println!("Enrolled {} as {label} (id {id})", path.display());
            }
        }
        Commands::List => {
            let store = FaceStore::open(&db_path)?;
            let faces = store.list()?;
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Remove { id } => {
            let store = FaceStore::open(&db_path)?;
            let Some(record) = store.get(id)? else {
                bail!("no enrolled face with id {id}");
            };
            store.delete_one(id)?;
            println!("Removed {} (id {id}, {})", record.name, record.path);
        }
        Commands::Clear => {
            let store = FaceStore::open(&db_path)?;
            let n = store.delete_all()?;
            println!("Removed {n} faces");
        }
        Commands::Verify {
            policy,
            threshold,
            frame_interval_ms,
            timeout_secs,
            frames,
        } => {
            if let Some(policy) = policy {
                config.aggregation = policy;
            }
            if let Some(threshold) = threshold {
                config.threshold = threshold;
            }
            let gallery = FaceStore::open(&db_path)?.load_all()?;
            if gallery.is_empty() {
                tracing::warn!("gallery is empty; no frame can pass");
            }
            let model = Arc::new(load_model(&model_path)?);
            let passed = verify(
                model,
                config,
                gallery,
                &frames,
                Duration::from_millis(frame_interval_ms),
                Duration::from_secs(timeout_secs),
            )
            .await?;
            return Ok(if passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Commands::Rank { policy, image } => {
            if let Some(policy) = policy {
                config.aggregation = policy;
            }
            config.validate()?;
            let gallery = FaceStore::open(&db_path)?.load_all()?;
            let model = load_model(&model_path)?;
            let frame = Frame::open(&image, 0)?;
            let probe = model.extract(&frame.image)?;
            let matcher = GalleryMatcher::new(config.scorer(), config.aggregation)
                .with_workers(config.worker_count)?;
            let ranking = matcher.rank(&probe, &gallery);
            println!("{}", serde_json::to_string_pretty(&ranking)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_model(path: &Path) -> Result<MobileFaceNet> {
    let path = path.to_str().context("model path is not valid UTF-8")?;
    Ok(MobileFaceNet::load(path)?)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Feed `frames` one at a time, waiting for each to be processed, and
/// report the outcome. Returns whether a match passed.
async fn verify(
    model: Arc<MobileFaceNet>,
    config: VerifierConfig,
    gallery: Vec<GalleryRecord>,
    frames: &[PathBuf],
    interval: Duration,
    timeout: Duration,
) -> Result<bool> {
    let handle = SessionBuilder::new(model, Arc::new(ExposureGate::default()))
        .config(config)
        .start(gallery)?;
    let deadline = Instant::now() + timeout;

    for (seq, path) in frames.iter().enumerate() {
        if handle.is_finished() || Instant::now() >= deadline {
            break;
        }
        handle.feed_frame(Frame::open(path, seq as u64)?);

        let fed = seq as u64 + 1;
        while handle.processed_frames() < fed && !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("verification timed out");
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    handle.stop();
    if tokio::time::timeout(SHUTDOWN_GRACE, handle.finished()).await.is_err() {
        tracing::warn!("session did not settle after stop");
    }
    let stats = handle.cache_stats();
    let error = handle.error();
    let state = tokio::task::spawn_blocking(move || handle.shutdown()).await?;

    let report = match &state {
        SessionState::Passed(result) => serde_json::json!({
            "passed": true,
            "display_name": result.display_name(),
            "result": result,
            "cache": { "hits": stats.hits, "misses": stats.misses },
        }),
        state => serde_json::json!({
            "passed": false,
            "state": format!("{state:?}"),
            "error": error.map(|e| e.to_string()),
            "cache": { "hits": stats.hits, "misses": stats.misses },
        }),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(matches!(state, SessionState::Passed(_)))
}
