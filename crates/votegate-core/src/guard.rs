//! Biometric deduplication at enrollment time.

use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::frame::Frame;
use crate::gallery::GallerySnapshot;
use crate::types::{CosineMatcher, Embedding, Matcher};

/// Rejects an enrollment whose face is already in the gallery under any
/// identity key.
///
/// Uses the verification threshold; there is no separate, stricter
/// dedup threshold.
#[derive(Debug, Clone, Copy)]
pub struct EnrollmentGuard {
    matcher: CosineMatcher,
    threshold: f32,
}

impl EnrollmentGuard {
    pub fn new(threshold: f32) -> Self {
        Self {
            matcher: CosineMatcher,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Identity key already holding this face, if any.
    pub fn check_embedding(&self, query: &Embedding, gallery: &GallerySnapshot) -> Option<String> {
        let result = self.matcher.compare(query, gallery, self.threshold);
        if let Some(existing) = &result.identity {
            tracing::debug!(
                existing = %existing,
                distance = result.distance,
                "enrollment face matches an existing identity"
            );
        }
        result.identity
    }

    /// Extract the face embedding from `frame` and check it against `gallery`.
    ///
    /// Extraction failures propagate; they are never reported as "not a duplicate".
    pub fn check_duplicate<E: EmbeddingExtractor>(
        &self,
        extractor: &mut E,
        frame: &Frame,
        gallery: &GallerySnapshot,
    ) -> Result<Option<String>, ExtractError> {
        let query = extractor.extract(frame)?;
        Ok(self.check_embedding(&query, gallery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryEntry;

    fn entry(id: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry {
            identity: id.into(),
            embedding: Embedding::new(values.to_vec(), "test"),
        }
    }

    #[test]
    fn test_same_face_is_duplicate() {
        let gallery = GallerySnapshot::from_entries(vec![entry("alice", &[1.0, 0.1, 0.0])]);
        let guard = EnrollmentGuard::new(0.4);
        let query = Embedding::new(vec![1.0, 0.12, 0.01], "test");
        assert_eq!(guard.check_embedding(&query, &gallery).as_deref(), Some("alice"));
    }

    #[test]
    fn test_distinct_face_is_accepted() {
        let gallery = GallerySnapshot::from_entries(vec![entry("alice", &[1.0, 0.0, 0.0])]);
        let guard = EnrollmentGuard::new(0.4);
        let query = Embedding::new(vec![0.0, 1.0, 0.0], "test");
        assert!(guard.check_embedding(&query, &gallery).is_none());
    }

    #[test]
    fn test_empty_gallery_never_duplicate() {
        let guard = EnrollmentGuard::new(0.4);
        let query = Embedding::new(vec![1.0], "test");
        assert!(guard
            .check_embedding(&query, &GallerySnapshot::default())
            .is_none());
    }
}
