use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use runs_core::model::{RunId, SessionId, UserId};
use storage::repository::{NewRunRecord, Storage, StorageError};

#[derive(Debug, Clone)]
struct Args {
    db_url: String,
    session_id: SessionId,
    user_id: UserId,
    runs: u32,
    now: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidDbUrl { raw: String },
    InvalidSessionId { raw: String },
    InvalidUserId { raw: String },
    InvalidRuns { raw: String },
    InvalidNow { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidSessionId { raw } => {
                write!(f, "invalid --session-id value (expected UUID): {raw}")
            }
            ArgsError::InvalidUserId { raw } => {
                write!(f, "invalid --user-id value (expected UUID): {raw}")
            }
            ArgsError::InvalidRuns { raw } => write!(f, "invalid --runs value: {raw}"),
            ArgsError::InvalidNow { raw } => {
                write!(f, "invalid --now value (expected RFC3339): {raw}")
            }
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

impl Args {
    fn parse() -> Result<Self, ArgsError> {
        let mut db_url = std::env::var("RUNS_DB_URL").unwrap_or_else(|_| "sqlite:dev.sqlite3".into());
        let mut session_id = std::env::var("RUNS_SESSION_ID")
            .ok()
            .and_then(|value| SessionId::from_str(&value).ok())
            .unwrap_or_else(|| SessionId::new(uuid::Uuid::from_u128(1)));
        let mut user_id = std::env::var("RUNS_USER_ID")
            .ok()
            .and_then(|value| UserId::from_str(&value).ok())
            .unwrap_or_else(|| UserId::new(uuid::Uuid::from_u128(2)));
        let mut runs = std::env::var("RUNS_COUNT")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(3);
        let mut now: Option<DateTime<Utc>> = None;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = value;
                }
                "--session-id" => {
                    let value = require_value(&mut args, "--session-id")?;
                    session_id = value
                        .parse()
                        .map_err(|_| ArgsError::InvalidSessionId { raw: value.clone() })?;
                }
                "--user-id" => {
                    let value = require_value(&mut args, "--user-id")?;
                    user_id = value
                        .parse()
                        .map_err(|_| ArgsError::InvalidUserId { raw: value.clone() })?;
                }
                "--runs" => {
                    let value = require_value(&mut args, "--runs")?;
                    runs = value
                        .parse::<u32>()
                        .map_err(|_| ArgsError::InvalidRuns { raw: value.clone() })?;
                }
                "--now" => {
                    let value = require_value(&mut args, "--now")?;
                    let parsed = DateTime::parse_from_rfc3339(&value)
                        .map_err(|_| ArgsError::InvalidNow { raw: value.clone() })?
                        .with_timezone(&Utc);
                    now = Some(parsed);
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            session_id,
            user_id,
            runs,
            now,
        })
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p storage --bin seed -- [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>         SQLite URL (default: sqlite:dev.sqlite3)");
    eprintln!("  --session-id <uuid>       Session definition id the runs belong to");
    eprintln!("  --user-id <uuid>          Owner of the seeded runs");
    eprintln!("  --runs <n>                Number of runs to seed (default: 3)");
    eprintln!("  --now <rfc3339>           Fixed current time for deterministic seeding");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("Environment (same as flags):");
    eprintln!("  RUNS_DB_URL, RUNS_SESSION_ID, RUNS_USER_ID, RUNS_COUNT");
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse().map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let storage = Storage::sqlite(&args.db_url).await?;
    let now = args.now.unwrap_or_else(Utc::now);

    let mut seeded = 0_u32;
    for i in 0..args.runs {
        let started_at = now - Duration::days(i64::from(i)) - Duration::minutes(30);
        let record = NewRunRecord::started(
            RunId::generate(),
            args.session_id,
            args.user_id,
            started_at,
            Some(format!("seed-{i}")),
        );

        match storage.runs.insert_run(&record).await {
            Ok(()) => {}
            // Re-seeding the same database: the run already exists.
            Err(StorageError::Conflict) => continue,
            Err(e) => return Err(e.into()),
        }
        seeded += 1;

        let step = i + 1;
        storage
            .runs
            .apply_progress(
                record.id,
                Some(step),
                Some(&json!({ "step": step, "elapsed_seconds": 90 * step })),
                started_at + Duration::minutes(5),
            )
            .await?;

        storage
            .checkins
            .append_checkin(
                record.id,
                &json!({ "confidence": 3, "note": "warming up" }),
                started_at + Duration::minutes(6),
            )
            .await?;
        storage
            .activities
            .append_activity(
                record.id,
                &json!({ "kind": "answer_submitted", "step": step }),
                started_at + Duration::minutes(7),
            )
            .await?;

        // First run completes, second is abandoned, the rest stay active.
        if i == 0 {
            storage
                .runs
                .mark_completed(record.id, started_at + Duration::minutes(20))
                .await?;
        } else if i == 1 {
            storage
                .runs
                .mark_abandoned(
                    record.id,
                    Some("seeded abandonment"),
                    started_at + Duration::minutes(15),
                )
                .await?;
        }
    }

    println!(
        "Seeded {} run(s) for session {} and user {} into {}",
        seeded, args.session_id, args.user_id, args.db_url
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
