use serde::{Deserialize, Serialize};

use crate::similarity;

/// Face embedding vector (192-dimensional for MobileFaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "mobile_face_net").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Unit-length copy of this embedding. Zero vectors come back unchanged.
    pub fn normalized(&self) -> Embedding {
        Embedding {
            values: similarity::normalize(&self.values),
            model_version: self.model_version.clone(),
        }
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// An enrolled face: one embedding for one subject.
///
/// A subject may be enrolled several times; records sharing a `name`
/// form one identity group for grouped-average matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryRecord {
    /// Unique, stable record id assigned by the gallery store.
    pub id: i64,
    /// Subject name. Also the grouping key across records.
    pub name: String,
    /// Where the enrolled image lives (file path or other storage reference).
    pub path: String,
    pub embedding: Embedding,
}

/// Best gallery match for one probe embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Id of the winning record (first record of the group under grouped-average).
    pub id: i64,
    pub name: String,
    pub path: String,
    /// Combined similarity of the winner; a group mean under grouped-average.
    pub similarity: f32,
}

impl MatchResult {
    /// Verification pass test. Strict: a score equal to the threshold fails.
    pub fn passes(&self, threshold: f32) -> bool {
        self.similarity > threshold
    }

    /// Subject name with any file extension removed ("alice.jpg" → "alice").
    pub fn display_name(&self) -> &str {
        match self.name.split_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }
}

/// Aggregated score for one identity, as reported by ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityScore {
    pub id: i64,
    pub name: String,
    pub score: f32,
    /// Number of gallery records that contributed to `score`.
    pub samples: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, similarity: f32) -> MatchResult {
        MatchResult {
            id: 1,
            name: name.into(),
            path: String::new(),
            similarity,
        }
    }

    #[test]
    fn test_passes_is_strict() {
        let threshold = 0.85f32;
        assert!(!result("a", threshold).passes(threshold));
        assert!(result("a", threshold + 1e-4).passes(threshold));
        assert!(!result("a", threshold - 1e-4).passes(threshold));
    }

    #[test]
    fn test_display_name_strips_extension() {
        assert_eq!(result("alice.jpg", 0.0).display_name(), "alice");
        assert_eq!(result("bob", 0.0).display_name(), "bob");
        assert_eq!(result(".hidden", 0.0).display_name(), ".hidden");
    }

    #[test]
    fn test_normalized_keeps_model_version() {
        let e = Embedding::new(vec![3.0, 4.0]).with_model_version("m1");
        let n = e.normalized();
        assert_eq!(n.model_version.as_deref(), Some("m1"));
        assert!((n.values[0] - 0.6).abs() < 1e-6);
        assert!((n.values[1] - 0.8).abs() < 1e-6);
    }
}
