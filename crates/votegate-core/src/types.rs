use crate::gallery::GallerySnapshot;
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "w600k_r50").
    pub model_id: String,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_id: impl Into<String>) -> Self {
        Self {
            values,
            model_id: model_id.into(),
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero-norm
    /// vector has similarity 0 with everything.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance `1 - similarity`, in [0, 2]. 0 = identical direction.
    pub fn distance(&self, other: &Embedding) -> f32 {
        (1.0 - self.similarity(other)).clamp(0.0, 2.0)
    }
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Identity key of the accepted match, `None` when nothing was within threshold.
    pub identity: Option<String>,
    /// Cosine distance of the nearest entry; `f32::INFINITY` for an empty gallery.
    pub distance: f32,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &GallerySnapshot, threshold: f32) -> MatchResult;
}

/// Cosine distance matcher.
///
/// Scans every gallery entry and keeps the nearest. Ties keep the first
/// entry encountered.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, query: &Embedding, gallery: &GallerySnapshot, threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            if entry.embedding.dim() != query.dim() {
                tracing::warn!(
                    identity = %entry.identity,
                    expected = query.dim(),
                    found = entry.embedding.dim(),
                    "skipping gallery entry with mismatched dimension"
                );
                continue;
            }
            let dist = query.distance(&entry.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        let identity = match best_idx {
            Some(idx) if best_dist < threshold => Some(gallery.entries()[idx].identity.clone()),
            _ => None,
        };

        MatchResult {
            identity,
            distance: best_dist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryEntry;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec(), "test")
    }

    fn gallery(entries: &[(&str, &[f32])]) -> GallerySnapshot {
        GallerySnapshot::from_entries(
            entries
                .iter()
                .map(|(id, v)| GalleryEntry {
                    identity: id.to_string(),
                    embedding: emb(v),
                })
                .collect(),
        )
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a.clone()) - 1.0).abs() < 1e-6);
        assert!(a.distance(&a.clone()).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!((a.distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.distance(&b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
        assert_eq!(a.distance(&b), 1.0);
    }

    #[test]
    fn test_matcher_scans_whole_gallery() {
        // Best match is the last entry
        let query = emb(&[1.0, 0.0, 0.0]);
        let g = gallery(&[
            ("decoy1", &[0.0, 1.0, 0.0]),
            ("decoy2", &[0.0, 0.0, 1.0]),
            ("alice", &[1.0, 0.0, 0.0]),
        ]);

        let result = CosineMatcher.compare(&query, &g, 0.4);
        assert_eq!(result.identity.as_deref(), Some("alice"));
        assert!(result.distance.abs() < 1e-6);
    }

    #[test]
    fn test_matcher_tie_keeps_first_entry() {
        let query = emb(&[0.6, 0.8]);
        let g = gallery(&[("first", &[0.8, 0.6]), ("second", &[0.8, 0.6])]);
        let result = CosineMatcher.compare(&query, &g, 0.4);
        assert_eq!(result.identity.as_deref(), Some("first"));
    }

    #[test]
    fn test_matcher_threshold_is_strict() {
        // distance exactly equals threshold → rejected
        let query = emb(&[1.0, 0.0]);
        let g = gallery(&[("bob", &[0.0, 1.0])]);
        let result = CosineMatcher.compare(&query, &g, 1.0);
        assert!(!result.is_match());
        assert!((result.distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_no_match_still_reports_distance() {
        let query = emb(&[1.0, 0.0, 0.0]);
        let g = gallery(&[("other", &[0.0, 1.0, 0.0])]);
        let result = CosineMatcher.compare(&query, &g, 0.4);
        assert!(result.identity.is_none());
        assert!((result.distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let query = emb(&[1.0, 0.0]);
        let result = CosineMatcher.compare(&query, &GallerySnapshot::default(), 0.4);
        assert!(result.identity.is_none());
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_matcher_is_deterministic() {
        let query = emb(&[0.3, 0.7, 0.1]);
        let g = gallery(&[
            ("a", &[0.2, 0.8, 0.0]),
            ("b", &[0.3, 0.6, 0.2]),
            ("c", &[0.9, 0.1, 0.0]),
        ]);
        let first = CosineMatcher.compare(&query, &g, 0.4);
        for _ in 0..10 {
            assert_eq!(CosineMatcher.compare(&query, &g, 0.4), first);
        }
    }

    #[test]
    fn test_matcher_skips_mismatched_dimension() {
        let query = emb(&[1.0, 0.0]);
        let g = gallery(&[("short", &[1.0]), ("ok", &[0.9, 0.1])]);
        let result = CosineMatcher.compare(&query, &g, 0.4);
        assert_eq!(result.identity.as_deref(), Some("ok"));
    }
}
