//! The identity-verification operations exposed to the voting workflow.

use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::frame::Frame;
use crate::gallery::GallerySnapshot;
use crate::guard::EnrollmentGuard;
use crate::types::{CosineMatcher, Embedding, Matcher};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    /// The face is already enrolled. `existing` is for operator logs only.
    #[error("face is already enrolled")]
    DuplicateFace { existing: String },
}

/// Outcome of checking a face against a claimed identity.
///
/// Rejections carry no distance and no matched identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Accepted,
    /// A different enrolled member matched.
    Mismatch,
    /// Nobody in the gallery matched.
    NoMatch,
}

impl VerifyOutcome {
    pub fn is_accepted(self) -> bool {
        self == VerifyOutcome::Accepted
    }
}

/// Extractor plus matching policy.
pub struct Gate<E> {
    extractor: E,
    matcher: CosineMatcher,
    guard: EnrollmentGuard,
    threshold: f32,
}

impl<E: EmbeddingExtractor> Gate<E> {
    /// Use the extractor's own default threshold.
    pub fn new(extractor: E) -> Self {
        let threshold = extractor.default_threshold();
        Self::with_threshold(extractor, threshold)
    }

    pub fn with_threshold(extractor: E, threshold: f32) -> Self {
        Self {
            extractor,
            matcher: CosineMatcher,
            guard: EnrollmentGuard::new(threshold),
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn model_id(&self) -> &str {
        self.extractor.model_id()
    }

    pub fn guard(&self) -> &EnrollmentGuard {
        &self.guard
    }

    pub fn extractor_mut(&mut self) -> &mut E {
        &mut self.extractor
    }

    /// Extract the embedding to enroll for `frame`.
    pub fn register_face(&mut self, frame: &Frame) -> Result<Embedding, ExtractError> {
        self.extractor.extract(frame)
    }

    /// Identity whose enrolled face matches `frame`, or `None`.
    ///
    /// The extractor runs exactly once, also for an empty gallery.
    pub fn verify_face(
        &mut self,
        frame: &Frame,
        gallery: &GallerySnapshot,
    ) -> Result<Option<String>, ExtractError> {
        let face = self.extractor.extract(frame)?;
        if gallery.is_empty() {
            tracing::debug!("verify against empty gallery");
            return Ok(None);
        }
        let result = self.matcher.compare(&face, gallery, self.threshold);
        tracing::debug!(
            matched = result.is_match(),
            distance = result.distance,
            threshold = self.threshold,
            "verify compared face against gallery"
        );
        Ok(result.identity)
    }

    /// Check `frame` against the identity the member claims to be.
    pub fn verify_identity(
        &mut self,
        frame: &Frame,
        gallery: &GallerySnapshot,
        claimed: &str,
    ) -> Result<VerifyOutcome, ExtractError> {
        let outcome = match self.verify_face(frame, gallery)? {
            Some(identity) if identity == claimed => VerifyOutcome::Accepted,
            Some(_) => VerifyOutcome::Mismatch,
            None => VerifyOutcome::NoMatch,
        };
        tracing::info!(claimed, ?outcome, "identity verification finished");
        Ok(outcome)
    }

    /// Identity already holding the face in `frame`, or `None`.
    pub fn is_duplicate(
        &mut self,
        frame: &Frame,
        gallery: &GallerySnapshot,
    ) -> Result<Option<String>, ExtractError> {
        self.guard.check_duplicate(&mut self.extractor, frame, gallery)
    }

    /// Extract an embedding for enrollment, refusing faces already enrolled.
    pub fn enroll(&mut self, frame: &Frame, gallery: &GallerySnapshot) -> Result<Embedding, GateError> {
        let embedding = self.extractor.extract(frame)?;
        if let Some(existing) = self.guard.check_embedding(&embedding, gallery) {
            return Err(GateError::DuplicateFace { existing });
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryEntry;
    use crate::testing::{solid_frame, StubExtractor};

    fn enrolled(gate: &mut Gate<StubExtractor>, entries: &[(&str, [u8; 3])]) -> GallerySnapshot {
        GallerySnapshot::from_entries(
            entries
                .iter()
                .map(|(id, rgb)| GalleryEntry {
                    identity: id.to_string(),
                    embedding: gate.register_face(&solid_frame(*rgb)).unwrap(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_threshold_comes_from_extractor() {
        let gate = Gate::new(StubExtractor::default());
        assert_eq!(gate.threshold(), StubExtractor::THRESHOLD);
    }

    #[test]
    fn test_enroll_then_verify_same_face() {
        let mut gate = Gate::new(StubExtractor::default());
        let gallery = enrolled(&mut gate, &[("alice", [200, 40, 40]), ("bob", [40, 200, 40])]);

        // Same face, different lighting
        let face = solid_frame([150, 30, 30]);
        assert_eq!(gate.verify_face(&face, &gallery).unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn test_distinct_faces_do_not_cross_match() {
        let mut gate = Gate::new(StubExtractor::default());
        let gallery = enrolled(&mut gate, &[("alice", [200, 40, 40])]);
        let stranger = solid_frame([40, 40, 200]);
        assert_eq!(gate.verify_face(&stranger, &gallery).unwrap(), None);
    }

    #[test]
    fn test_empty_gallery_still_extracts_once() {
        let mut gate = Gate::new(StubExtractor::default());
        let result = gate.verify_face(&solid_frame([90, 90, 200]), &GallerySnapshot::default());
        assert_eq!(result.unwrap(), None);
        assert_eq!(gate.extractor_mut().calls, 1);
    }

    #[test]
    fn test_no_face_is_error_not_no_match() {
        let mut gate = Gate::new(StubExtractor::default());
        let gallery = enrolled(&mut gate, &[("alice", [200, 40, 40])]);
        let result = gate.verify_face(&solid_frame([0, 0, 0]), &gallery);
        assert!(matches!(result, Err(ExtractError::NoFaceDetected)));
    }

    #[test]
    fn test_verify_identity_outcomes() {
        let mut gate = Gate::new(StubExtractor::default());
        let gallery = enrolled(&mut gate, &[("alice", [200, 40, 40]), ("bob", [40, 200, 40])]);

        let alice = solid_frame([200, 40, 40]);
        assert_eq!(
            gate.verify_identity(&alice, &gallery, "alice").unwrap(),
            VerifyOutcome::Accepted
        );
        assert_eq!(
            gate.verify_identity(&alice, &gallery, "bob").unwrap(),
            VerifyOutcome::Mismatch
        );
        assert_eq!(
            gate.verify_identity(&solid_frame([40, 40, 200]), &gallery, "bob").unwrap(),
            VerifyOutcome::NoMatch
        );
    }

    #[test]
    fn test_is_duplicate_detects_enrolled_face() {
        let mut gate = Gate::new(StubExtractor::default());
        let gallery = enrolled(&mut gate, &[("alice", [200, 40, 40])]);
        let again = solid_frame([200, 40, 40]);
        assert_eq!(gate.is_duplicate(&again, &gallery).unwrap().as_deref(), Some("alice"));
        assert_eq!(gate.is_duplicate(&solid_frame([40, 200, 40]), &gallery).unwrap(), None);
    }

    #[test]
    fn test_enroll_rejects_second_identity_for_same_face() {
        let mut gate = Gate::new(StubExtractor::default());
        let gallery = enrolled(&mut gate, &[("alice", [200, 40, 40])]);

        let result = gate.enroll(&solid_frame([200, 40, 40]), &gallery);
        assert!(matches!(result, Err(GateError::DuplicateFace { existing }) if existing == "alice"));

        let fresh = gate.enroll(&solid_frame([40, 200, 40]), &gallery);
        assert!(fresh.is_ok());
    }

    #[test]
    fn test_enroll_no_face_propagates() {
        let mut gate = Gate::new(StubExtractor::default());
        let result = gate.enroll(&solid_frame([0, 0, 0]), &GallerySnapshot::default());
        assert!(matches!(
            result,
            Err(GateError::Extract(ExtractError::NoFaceDetected))
        ));
    }
}
