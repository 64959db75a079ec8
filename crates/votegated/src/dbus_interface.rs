use crate::engine::{EngineError, EngineHandle};
use crate::sessions::{ClaimError, SessionRegistry};
use std::time::{Duration, SystemTime};
use rusqlite::Connection;
use votegate_core::{EnrollmentGuard, ExtractError, GallerySnapshot};
use votegate_store::{BallotOutcome, EnrollOutcome, StoreError};
use zbus::{interface, DBusError};

/// Errors returned to D-Bus callers.
///
/// `NoFaceDetected` and `ExtractionError` mean "retake the photo";
/// a face that matched nobody is a `false` result, never an error.
#[derive(Debug, DBusError)]
#[zbus(prefix = "org.votegate.Gate1.Error")]
pub enum ServiceError {
    #[zbus(error)]
    ZBus(zbus::Error),
    NoFaceDetected(String),
    ExtractionError(String),
    DuplicateFace(String),
    UnknownSession(String),
    LivenessRequired(String),
    AlreadyVoted(String),
    InvalidArgument(String),
    Storage(String),
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Extract(ExtractError::NoFaceDetected) => {
                ServiceError::NoFaceDetected("no face detected in image".into())
            }
            EngineError::Extract(ExtractError::Extraction(msg)) => ServiceError::ExtractionError(msg),
            EngineError::Timeout(_) => ServiceError::ExtractionError("face extraction timed out".into()),
            other => ServiceError::ExtractionError(other.to_string()),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::FingerprintTaken => ServiceError::DuplicateFace("face is already enrolled".into()),
            StoreError::IdentityTaken(_) => ServiceError::InvalidArgument(err.to_string()),
            other => ServiceError::Storage(other.to_string()),
        }
    }
}

/// D-Bus interface for the votegate daemon.
///
/// Bus name: org.votegate.Gate1
/// Object path: /org/votegate/Gate1
///
/// Methods taking a `session` argument accept an empty string for "no
/// liveness session".
pub struct GateService {
    engine: EngineHandle,
    db: tokio_rusqlite::Connection,
    sessions: SessionRegistry,
    guard: EnrollmentGuard,
    /// `Some(window)` when a recent blink is required before accepting a face.
    liveness_window: Option<Duration>,
}

impl GateService {
    pub fn new(
        engine: EngineHandle,
        db: tokio_rusqlite::Connection,
        sessions: SessionRegistry,
        liveness_window: Option<Duration>,
    ) -> Self {
        let guard = EnrollmentGuard::new(engine.threshold());
        Self {
            engine,
            db,
            sessions,
            guard,
            liveness_window,
        }
    }

    /// Run a store function on the database thread.
    async fn with_db<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let result = self
            .db
            .call(move |conn| Ok(f(conn)))
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))?;
        Ok(result?)
    }

    async fn gallery(&self) -> Result<GallerySnapshot, ServiceError> {
        let model_id = self.engine.model_id().to_string();
        self.with_db(move |conn| votegate_store::load_gallery(conn, &model_id))
            .await
    }

    /// Enforce the blink requirement for `identity`. A session vouches for
    /// the first identity it is presented with and no other.
    fn check_liveness(&self, session: &str, identity: &str) -> Result<(), ServiceError> {
        if session.is_empty() {
            return match self.liveness_window {
                Some(_) => Err(ServiceError::LivenessRequired(
                    "a liveness session is required".into(),
                )),
                None => Ok(()),
            };
        }
        let state = self.sessions.claim(session, identity).map_err(|e| match e {
            ClaimError::Unknown => ServiceError::UnknownSession(session.to_string()),
            ClaimError::OtherIdentity => {
                ServiceError::LivenessRequired("session belongs to another identity".into())
            }
        })?;
        if let Some(window) = self.liveness_window {
            if !state.blinked_within(window, SystemTime::now()) {
                tracing::info!(session, "rejected: no recent blink");
                return Err(ServiceError::LivenessRequired(format!(
                    "no blink observed in the last {}s",
                    window.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// A blink authorizes one face check.
    fn spend_liveness(&self, session: &str) {
        if !session.is_empty() {
            self.sessions.consume_blink(session);
        }
    }
}

#[interface(name = "org.votegate.Gate1")]
impl GateService {
    /// Enroll a member's face. Returns a JSON summary.
    async fn enroll(&self, identity: &str, image: Vec<u8>) -> Result<String, ServiceError> {
        if identity.is_empty() {
            return Err(ServiceError::InvalidArgument("identity must not be empty".into()));
        }
        tracing::info!(identity, bytes = image.len(), "enroll requested");

        let embedding = self.engine.extract(image).await?;
        let dimension = embedding.dim();
        let model = embedding.model_id.clone();

        let key = identity.to_string();
        let guard = self.guard;
        let outcome = self
            .with_db(move |conn| votegate_store::enroll_unique(conn, &key, &embedding, &guard))
            .await?;

        match outcome {
            EnrollOutcome::Enrolled => {
                tracing::info!(identity, model = %model, "member enrolled");
                Ok(serde_json::json!({
                    "identity": identity,
                    "model": model,
                    "dimension": dimension,
                })
                .to_string())
            }
            EnrollOutcome::Duplicate(existing) => {
                tracing::warn!(identity, existing = %existing, "enrollment refused: duplicate face");
                Err(ServiceError::DuplicateFace("face is already enrolled".into()))
            }
        }
    }

    /// Identify the face in `image`. Returns `(matched, identity)`.
    async fn verify_face(&self, image: Vec<u8>) -> Result<(bool, String), ServiceError> {
        let gallery = self.gallery().await?;
        let found = self.engine.verify(image, gallery).await?;
        tracing::info!(matched = found.is_some(), "verify_face finished");
        Ok(match found {
            Some(identity) => (true, identity),
            None => (false, String::new()),
        })
    }

    /// Check the face in `image` against `identity`.
    async fn verify(&self, identity: &str, image: Vec<u8>, session: &str) -> Result<bool, ServiceError> {
        self.check_liveness(session, identity)?;
        let gallery = self.gallery().await?;
        let outcome = self
            .engine
            .verify_identity(image, gallery, identity.to_string())
            .await?;
        self.spend_liveness(session);
        Ok(outcome.is_accepted())
    }

    /// Whether the face in `image` is already enrolled.
    /// Returns `(duplicate, existing identity)`.
    async fn is_duplicate(&self, image: Vec<u8>) -> Result<(bool, String), ServiceError> {
        let gallery = self.gallery().await?;
        let existing = self.engine.is_duplicate(image, gallery).await?;
        Ok(match existing {
            Some(identity) => (true, identity),
            None => (false, String::new()),
        })
    }

    /// Open a liveness session and return its id.
    async fn begin_liveness(&self) -> String {
        let id = self.sessions.begin();
        tracing::info!(session = %id, "liveness session started");
        id
    }

    /// Feed one frame to a session. Returns `(blink_detected, blink_count)`.
    ///
    /// A frame that fails extraction leaves the session untouched.
    async fn liveness_step(&self, session: &str, frame: Vec<u8>) -> Result<(bool, u32), ServiceError> {
        if self.sessions.state(session).is_none() {
            return Err(ServiceError::UnknownSession(session.to_string()));
        }
        let eyes = self.engine.eyes(frame).await?;
        self.sessions
            .step(session, eyes)
            .ok_or_else(|| ServiceError::UnknownSession(session.to_string()))
    }

    /// Zero a session's blink counter. Returns the count that was cleared.
    async fn reset_liveness(&self, session: &str) -> Result<u32, ServiceError> {
        self.sessions
            .reset(session)
            .ok_or_else(|| ServiceError::UnknownSession(session.to_string()))
    }

    /// Close a session.
    async fn end_liveness(&self, session: &str) -> bool {
        self.sessions.end(session)
    }

    /// Verify the voter's face and record one ballot.
    ///
    /// Returns `false` when the face does not belong to `identity`.
    async fn cast_vote(
        &self,
        identity: &str,
        election: &str,
        candidate: &str,
        image: Vec<u8>,
        session: &str,
    ) -> Result<bool, ServiceError> {
        if identity.is_empty() || election.is_empty() || candidate.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "identity, election and candidate are required".into(),
            ));
        }
        self.check_liveness(session, identity)?;

        let gallery = self.gallery().await?;
        let outcome = self
            .engine
            .verify_identity(image, gallery, identity.to_string())
            .await?;
        self.spend_liveness(session);
        if !outcome.is_accepted() {
            tracing::info!(identity, election, "vote refused: face not verified");
            return Ok(false);
        }

        let (key, election_id, candidate_id) = (identity.to_string(), election.to_string(), candidate.to_string());
        let recorded = self
            .with_db(move |conn| votegate_store::record_ballot(conn, &key, &election_id, &candidate_id))
            .await?;
        match recorded {
            BallotOutcome::Recorded => Ok(true),
            BallotOutcome::AlreadyVoted => Err(ServiceError::AlreadyVoted(format!(
                "{identity} has already voted in {election}"
            ))),
        }
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, ServiceError> {
        let members = self.with_db(|conn| votegate_store::member_count(conn)).await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model": self.engine.model_id(),
            "threshold": self.engine.threshold(),
            "members": members,
            "require_blink": self.liveness_window.is_some(),
            "liveness_window_secs": self.liveness_window.map(|w| w.as_secs()),
            "active_sessions": self.sessions.len(),
        })
        .to_string())
    }
}
