use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const ERROR_PREFIX: &str = "org.votegate.Gate1.Error.";

#[zbus::proxy(
    interface = "org.votegate.Gate1",
    default_service = "org.votegate.Gate1",
    default_path = "/org/votegate/Gate1"
)]
trait Gate {
    async fn enroll(&self, identity: &str, image: &[u8]) -> zbus::Result<String>;
    async fn verify_face(&self, image: &[u8]) -> zbus::Result<(bool, String)>;
    async fn verify(&self, identity: &str, image: &[u8], session: &str) -> zbus::Result<bool>;
    async fn is_duplicate(&self, image: &[u8]) -> zbus::Result<(bool, String)>;
    async fn begin_liveness(&self) -> zbus::Result<String>;
    async fn liveness_step(&self, session: &str, frame: &[u8]) -> zbus::Result<(bool, u32)>;
    async fn reset_liveness(&self, session: &str) -> zbus::Result<u32>;
    async fn end_liveness(&self, session: &str) -> zbus::Result<bool>;
    async fn cast_vote(
        &self,
        identity: &str,
        election: &str,
        candidate: &str,
        image: &[u8],
        session: &str,
    ) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "votegate", about = "Face-gated voting client")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a member's face
    Enroll {
        identity: String,
        image: PathBuf,
    },
    /// Verify a face, optionally against a claimed identity
    Verify {
        /// Identity the face must belong to
        #[arg(long = "as")]
        identity: Option<String>,
        /// Liveness session id from `votegate liveness`
        #[arg(long)]
        session: Option<String>,
        image: PathBuf,
    },
    /// Check whether a face is already enrolled
    CheckDuplicate { image: PathBuf },
    /// Run a blink check over a sequence of frames
    Liveness {
        /// Keep the session open and print its id for a later verify or vote
        #[arg(long)]
        keep: bool,
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Verify the voter and cast one ballot
    Vote {
        identity: String,
        election: String,
        candidate: String,
        image: PathBuf,
        #[arg(long)]
        session: Option<String>,
    },
    /// Show daemon status
    Status,
}

/// Exit codes: 1 = access denied, 2 = retake photo. Other failures exit 3.
enum Verdict {
    Ok,
    Denied,
    Retake,
}

impl From<Verdict> for ExitCode {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Ok => ExitCode::SUCCESS,
            Verdict::Denied => ExitCode::from(1),
            Verdict::Retake => ExitCode::from(2),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(verdict) => verdict.into(),
        Err(err) => {
            if let Some(verdict) = retake_hint(&err) {
                return verdict.into();
            }
            eprintln!("error: {err:#}");
            ExitCode::from(3)
        }
    }
}

async fn run(cli: Cli) -> Result<Verdict> {
    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let gate = GateProxy::new(&conn).await?;
    tracing::debug!(system = cli.system, "connected to votegated");

    match cli.command {
        Commands::Enroll { identity, image } => {
            let summary = gate.enroll(&identity, &read_image(&image)?).await?;
            println!("enrolled: {summary}");
            Ok(Verdict::Ok)
        }
        Commands::Verify {
            identity: Some(identity),
            session,
            image,
        } => {
            let session = session.unwrap_or_default();
            if gate.verify(&identity, &read_image(&image)?, &session).await? {
                println!("verified: face matches {identity}");
                Ok(Verdict::Ok)
            } else {
                println!("access denied: face does not match {identity}");
                Ok(Verdict::Denied)
            }
        }
        Commands::Verify {
            identity: None,
            image,
            ..
        } => {
            let (matched, identity) = gate.verify_face(&read_image(&image)?).await?;
            if matched {
                println!("recognized: {identity}");
                Ok(Verdict::Ok)
            } else {
                println!("access denied: face not recognized");
                Ok(Verdict::Denied)
            }
        }
        Commands::CheckDuplicate { image } => {
            let (duplicate, identity) = gate.is_duplicate(&read_image(&image)?).await?;
            if duplicate {
                println!("already enrolled as {identity}");
            } else {
                println!("not enrolled");
            }
            Ok(Verdict::Ok)
        }
        Commands::Liveness { keep, frames } => {
            let session = gate.begin_liveness().await?;
            let outcome = step_frames(&gate, &session, &frames).await;
            if close_session(keep, outcome.is_ok()) {
                if let Err(err) = gate.end_liveness(&session).await {
                    tracing::warn!(session = %session, error = %err, "failed to end liveness session");
                }
            }
            let count = outcome?;
            println!("blinks: {count}");
            if keep {
                println!("session: {session}");
            }
            Ok(if count > 0 { Verdict::Ok } else { Verdict::Denied })
        }
        Commands::Vote {
            identity,
            election,
            candidate,
            image,
            session,
        } => {
            let session = session.unwrap_or_default();
            let accepted = gate
                .cast_vote(&identity, &election, &candidate, &read_image(&image)?, &session)
                .await?;
            if accepted {
                println!("vote recorded for {identity} in {election}");
                Ok(Verdict::Ok)
            } else {
                println!("access denied: face does not match {identity}");
                Ok(Verdict::Denied)
            }
        }
        Commands::Status => {
            let status = gate.status().await?;
            let pretty = serde_json::from_str::<serde_json::Value>(&status)
                .and_then(|v| serde_json::to_string_pretty(&v))
                .unwrap_or(status);
            println!("{pretty}");
            Ok(Verdict::Ok)
        }
    }
}

/// Feed each frame to `session`. Returns the final blink count.
async fn step_frames(gate: &GateProxy<'_>, session: &str, frames: &[PathBuf]) -> Result<u32> {
    let mut count = 0;
    for path in frames {
        let (blink, total) = gate.liveness_step(session, &read_image(path)?).await?;
        println!("{}: {}", path.display(), if blink { "blink" } else { "-" });
        count = total;
    }
    Ok(count)
}

/// A kept session stays open only when every frame went through.
fn close_session(keep: bool, stepped_all: bool) -> bool {
    !keep || !stepped_all
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))
}

/// Map daemon errors that ask for a new photo, or deny access, to a verdict.
fn retake_hint(err: &anyhow::Error) -> Option<Verdict> {
    let Some(zbus::Error::MethodError(name, detail, _)) = err.downcast_ref::<zbus::Error>() else {
        return None;
    };
    let kind = name.as_str().strip_prefix(ERROR_PREFIX)?;
    let detail = detail.as_deref().unwrap_or_default();
    match kind {
        "NoFaceDetected" | "ExtractionError" => {
            eprintln!("retake photo: {detail}");
            Some(Verdict::Retake)
        }
        "DuplicateFace" | "LivenessRequired" | "AlreadyVoted" => {
            eprintln!("access denied: {detail}");
            Some(Verdict::Denied)
        }
        _ => None,
    }
}
