//! Gallery snapshots rebuilt from storage for a single request.

use crate::codec;
use crate::types::Embedding;

/// One enrolled identity.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity: String,
    pub embedding: Embedding,
}

/// Immutable view of every enrolled embedding at the moment it was built.
///
/// Iteration order is the order the records were supplied in.
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    entries: Vec<GalleryEntry>,
}

impl GallerySnapshot {
    /// Build a snapshot from already decoded entries.
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    /// Decode stored `(identity, blob)` records into a snapshot.
    ///
    /// Each record is decoded independently. Records that fail to decode
    /// or that were produced by a model other than `expected_model` are
    /// skipped. Length is not checked here; the matcher skips entries whose
    /// length differs from the query, so one odd row never hides the rest.
    pub fn rehydrate<I, K, B>(records: I, expected_model: &str) -> Self
    where
        I: IntoIterator<Item = (K, B)>,
        K: Into<String>,
        B: AsRef<[u8]>,
    {
        let mut entries: Vec<GalleryEntry> = Vec::new();
        let mut skipped = 0usize;

        for (identity, blob) in records {
            let identity = identity.into();
            let embedding = match codec::decode(blob.as_ref()) {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(%identity, error = %err, "skipping corrupt stored embedding");
                    skipped += 1;
                    continue;
                }
            };

            if embedding.model_id != expected_model {
                tracing::warn!(
                    %identity,
                    found = %embedding.model_id,
                    expected = expected_model,
                    "skipping embedding from another model"
                );
                skipped += 1;
                continue;
            }

            entries.push(GalleryEntry {
                identity,
                embedding,
            });
        }

        tracing::debug!(entries = entries.len(), skipped, "gallery rehydrated");
        Self { entries }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::EnrollmentGuard;
    use crate::types::{CosineMatcher, Matcher};

    const MODEL: &str = "w600k_r50";

    fn blob(values: &[f32], model: &str) -> Vec<u8> {
        codec::encode(&Embedding::new(values.to_vec(), model)).unwrap()
    }

    #[test]
    fn test_rehydrate_keeps_order() {
        let records = vec![
            ("carol", blob(&[1.0, 0.0], MODEL)),
            ("alice", blob(&[0.0, 1.0], MODEL)),
        ];
        let g = GallerySnapshot::rehydrate(records, MODEL);
        let ids: Vec<&str> = g.entries().iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(ids, ["carol", "alice"]);
    }

    #[test]
    fn test_rehydrate_skips_corrupt_entries() {
        let records = vec![
            ("alice", blob(&[1.0, 0.0], MODEL)),
            ("mallory", vec![0xde, 0xad]),
            ("bob", blob(&[0.0, 1.0], MODEL)),
        ];
        let g = GallerySnapshot::rehydrate(records, MODEL);
        assert_eq!(g.len(), 2);
        assert!(g.entries().iter().all(|e| e.identity != "mallory"));
    }

    #[test]
    fn test_rehydrate_skips_foreign_model() {
        let records = vec![
            ("alice", blob(&[1.0, 0.0], MODEL)),
            ("legacy", blob(&[1.0, 0.0], "vgg_face")),
        ];
        let g = GallerySnapshot::rehydrate(records, MODEL);
        assert_eq!(g.len(), 1);
        assert_eq!(g.entries()[0].identity, "alice");
    }

    #[test]
    fn test_odd_length_row_does_not_hide_later_rows() {
        let records = vec![
            ("odd", blob(&[1.0, 0.0, 0.0], MODEL)),
            ("alice", blob(&[1.0, 0.0], MODEL)),
            ("bob", blob(&[0.0, 1.0], MODEL)),
        ];
        let g = GallerySnapshot::rehydrate(records, MODEL);
        assert_eq!(g.len(), 3);

        let guard = EnrollmentGuard::new(0.4);
        let face = Embedding::new(vec![1.0, 0.0], MODEL);
        assert_eq!(guard.check_embedding(&face, &g).as_deref(), Some("alice"));

        let result = CosineMatcher.compare(&Embedding::new(vec![0.0, 1.0], MODEL), &g, 0.4);
        assert_eq!(result.identity.as_deref(), Some("bob"));
    }

    #[test]
    fn test_rehydrate_all_corrupt_is_empty() {
        let records: Vec<(String, Vec<u8>)> = vec![("x".into(), vec![]), ("y".into(), vec![1])];
        let g = GallerySnapshot::rehydrate(records, MODEL);
        assert!(g.is_empty());
    }
}
