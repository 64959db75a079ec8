//! votegate-store: SQLite persistence for enrolled faces and ballots.
//!
//! Functions take a plain `rusqlite::Connection` so callers decide where
//! blocking I/O runs (the daemon drives them through `tokio-rusqlite`).

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use thiserror::Error;
use votegate_core::codec::{self, CodecError};
use votegate_core::{Embedding, EnrollmentGuard, GallerySnapshot};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS members (
    identity_key TEXT PRIMARY KEY,
    embedding    BLOB NOT NULL,
    model_id     TEXT NOT NULL,
    fingerprint  TEXT NOT NULL UNIQUE,
    created_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ballots (
    identity_key TEXT NOT NULL,
    election_id  TEXT NOT NULL,
    candidate_id TEXT NOT NULL,
    cast_at      TEXT NOT NULL,
    PRIMARY KEY (identity_key, election_id)
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot encode embedding: {0}")]
    Codec(#[from] CodecError),
    #[error("identity {0} is already enrolled")]
    IdentityTaken(String),
    #[error("an identical embedding is already enrolled")]
    FingerprintTaken,
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A raw enrolled row; the blob is decoded by the gallery.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub identity_key: String,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollOutcome {
    Enrolled,
    /// The face already belongs to this identity key.
    Duplicate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotOutcome {
    Recorded,
    AlreadyVoted,
}

/// Create the directory that will hold the database file at `path`.
pub fn prepare_dir(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
            tracing::debug!(dir = %parent.display(), "database directory ready");
        }
    }
    Ok(())
}

/// Create tables if they do not exist.
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Every enrolled `(identity, blob)` in enrollment order.
pub fn fetch_enrolled_embeddings(conn: &Connection) -> Result<Vec<StoredEmbedding>, StoreError> {
    let mut stmt = conn.prepare("SELECT identity_key, embedding FROM members ORDER BY rowid")?;
    let rows = stmt.query_map([], |row| {
        Ok(StoredEmbedding {
            identity_key: row.get(0)?,
            blob: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Rebuild a gallery snapshot for `model_id` from the current rows.
pub fn load_gallery(conn: &Connection, model_id: &str) -> Result<GallerySnapshot, StoreError> {
    let rows = fetch_enrolled_embeddings(conn)?;
    Ok(GallerySnapshot::rehydrate(
        rows.into_iter().map(|r| (r.identity_key, r.blob)),
        model_id,
    ))
}

/// Insert one enrolled embedding.
pub fn store_embedding(conn: &Connection, identity_key: &str, embedding: &Embedding) -> Result<(), StoreError> {
    let blob = codec::encode(embedding)?;
    let fingerprint = codec::fingerprint(embedding)?;

    conn.execute(
        "INSERT INTO members (identity_key, embedding, model_id, fingerprint, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![identity_key, blob, embedding.model_id, fingerprint, Utc::now().to_rfc3339()],
    )
    .map_err(|err| classify_insert_error(err, identity_key))?;

    tracing::info!(identity = identity_key, model = %embedding.model_id, "embedding stored");
    Ok(())
}

fn classify_insert_error(err: rusqlite::Error, identity_key: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, Some(msg)) = &err {
        if code.code == ErrorCode::ConstraintViolation {
            if msg.contains("members.fingerprint") {
                return StoreError::FingerprintTaken;
            }
            if msg.contains("members.identity_key") {
                return StoreError::IdentityTaken(identity_key.to_string());
            }
        }
    }
    StoreError::Sqlite(err)
}

/// Check the gallery for the face and insert it, atomically.
///
/// The gallery read, duplicate check and insert run in one
/// `BEGIN IMMEDIATE` transaction, so two concurrent enrollments of the same
/// face cannot both pass the check.
pub fn enroll_unique(
    conn: &mut Connection,
    identity_key: &str,
    embedding: &Embedding,
    guard: &EnrollmentGuard,
) -> Result<EnrollOutcome, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let gallery = load_gallery(&tx, &embedding.model_id)?;
    if let Some(existing) = guard.check_embedding(embedding, &gallery) {
        tracing::info!(identity = identity_key, "enrollment rejected: face already enrolled");
        // Dropping the transaction rolls it back.
        return Ok(EnrollOutcome::Duplicate(existing));
    }

    store_embedding(&tx, identity_key, embedding)?;
    tx.commit()?;
    Ok(EnrollOutcome::Enrolled)
}

pub fn member_count(conn: &Connection) -> Result<usize, StoreError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM members", [], |row| row.get(0))?;
    Ok(n as usize)
}

/// Record a member's vote; at most one per election.
pub fn record_ballot(
    conn: &Connection,
    identity_key: &str,
    election_id: &str,
    candidate_id: &str,
) -> Result<BallotOutcome, StoreError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO ballots (identity_key, election_id, candidate_id, cast_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![identity_key, election_id, candidate_id, Utc::now().to_rfc3339()],
    )?;

    if inserted == 0 {
        tracing::info!(identity = identity_key, election = election_id, "ballot rejected: already voted");
        return Ok(BallotOutcome::AlreadyVoted);
    }
    tracing::info!(identity = identity_key, election = election_id, "ballot recorded");
    Ok(BallotOutcome::Recorded)
}

pub fn has_voted(conn: &Connection, identity_key: &str, election_id: &str) -> Result<bool, StoreError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM ballots WHERE identity_key = ?1 AND election_id = ?2",
            params![identity_key, election_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}
