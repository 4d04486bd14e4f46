use std::path::PathBuf;

const MODEL_FILE: &str = "mobile_face_net.onnx";

/// On-disk locations, loaded from environment variables.
pub struct Paths {
    /// Path to the SQLite gallery database.
    pub db_path: PathBuf,
    /// Path to the MobileFaceNet ONNX model.
    pub model_path: PathBuf,
}

impl Paths {
    /// Load paths from `FACEGATE_*` environment variables with defaults
    /// under `$XDG_DATA_HOME/facegate`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        Self {
            db_path: lookup("FACEGATE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("faces.db")),
            model_path: lookup("FACEGATE_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models").join(MODEL_FILE)),
        }
    }
}
