use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::ratelimit::{unix_now, RateLimitStore, RateLimiter};

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about = "Login rate limiter tooling")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate configuration, then print the effective values
    CheckConfig {
        /// YAML configuration file, overlaid with GATEKEEPER_* variables
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Replay a newline-delimited JSON log of login outcomes
    Replay {
        #[arg(short, long)]
        config: Option<String>,

        /// Event log, one JSON object per line
        events: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    Failure,
    Success,
    Check,
}

#[derive(Debug, Deserialize)]
struct LoginEvent {
    #[serde(default)]
    ts: Option<f64>,
    ip: String,
    #[serde(default)]
    user: Option<String>,
    outcome: Outcome,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::CheckConfig { config } => check_config(config.as_deref()),
        Command::Replay { config, events } => replay(config.as_deref(), &events).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check_config(path: Option<&str>) -> anyhow::Result<()> {
    let config = GatekeeperConfig::load(path).context("invalid configuration")?;
    info!(backend = %config.store.backend, "Configuration is valid");
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

async fn replay(path: Option<&str>, events: &Path) -> anyhow::Result<()> {
    let config = GatekeeperConfig::load(path).context("invalid configuration")?;
    let limiter = RateLimiter::from_config(&config).await?;
    info!(backend = limiter.backend_name(), events = %events.display(), "Replaying login events");

    let file = File::open(events)
        .with_context(|| format!("cannot open event log {}", events.display()))?;
    let summary = replay_events(BufReader::new(file), &limiter).await?;

    let snapshot = limiter.metrics_snapshot(summary.last_ts).await?;
    info!(
        replayed = summary.replayed,
        blocked = summary.blocked,
        skipped = summary.skipped,
        "Replay finished"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Counts gathered while replaying an event log.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ReplaySummary {
    replayed: u64,
    blocked: u64,
    skipped: u64,
    /// Timestamp of the last applied event, or the start time if none
    last_ts: f64,
}

/// Apply every event read from `reader` to `limiter`.
///
/// Blank lines are ignored and malformed lines are logged and skipped.
/// Events without `ts` are applied at the current time.
async fn replay_events<R, S>(reader: R, limiter: &RateLimiter<S>) -> anyhow::Result<ReplaySummary>
where
    R: BufRead,
    S: RateLimitStore,
{
    let mut summary = ReplaySummary {
        replayed: 0,
        blocked: 0,
        skipped: 0,
        last_ts: unix_now(),
    };

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: LoginEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed event");
                summary.skipped += 1;
                continue;
            }
        };

        let now = event.ts.unwrap_or_else(unix_now);
        summary.last_ts = now;
        let user = event.user.as_deref();

        match event.outcome {
            Outcome::Check => {
                if limiter.is_blocked(&event.ip, user, now).await {
                    info!(ip = %event.ip, user = ?user, ts = now, "Attempt blocked");
                    summary.blocked += 1;
                }
            }
            Outcome::Failure => limiter.register_failure(&event.ip, user, now).await?,
            Outcome::Success => limiter.register_success(&event.ip, user, now).await?,
        }
        summary.replayed += 1;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper::ratelimit::{InMemoryStore, RateLimitPolicy};

    fn limiter() -> RateLimiter<InMemoryStore> {
        let policy = RateLimitPolicy {
            max_attempts: 3,
            window_seconds: 5,
            base_block_seconds: 1,
            max_block_seconds: 10,
            ..Default::default()
        };
        RateLimiter::new(policy, InMemoryStore::new()).unwrap()
    }

    #[tokio::test]
    async fn test_replay_failures_end_blocked() {
        let limiter = limiter();
        let log = r#"{"ts":1.0,"ip":"10.0.0.1","user":"alice","outcome":"failure"}
{"ts":2.0,"ip":"10.0.0.1","user":"alice","outcome":"failure"}
{"ts":3.0,"ip":"10.0.0.1","user":"alice","outcome":"failure"}
{"ts":3.5,"ip":"10.0.0.9","user":"alice","outcome":"check"}
"#;

        let summary = replay_events(log.as_bytes(), &limiter).await.unwrap();

        assert_eq!(summary.replayed, 4);
        assert_eq!(summary.blocked, 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.last_ts, 3.5);

        let snapshot = limiter.metrics_snapshot(summary.last_ts).await.unwrap();
        assert_eq!(snapshot.failed_attempts_total, 3);
        assert_eq!(snapshot.rate_limit_triggered_total, 1);
        assert_eq!(snapshot.blocked_requests_total, 1);
    }

    #[tokio::test]
    async fn test_replay_skips_malformed_lines() {
        let limiter = limiter();
        let log = r#"{"ts":1.0,"ip":"10.0.0.1","outcome":"failure"}
not json at all

{"ts":2.0,"ip":"10.0.0.1","outcome":"explode"}
{"ts":3.0,"ip":"10.0.0.1","outcome":"success"}
"#;

        let summary = replay_events(log.as_bytes(), &limiter).await.unwrap();

        assert_eq!(summary.replayed, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.last_ts, 3.0);
        let snapshot = limiter.metrics_snapshot(3.0).await.unwrap();
        assert_eq!(snapshot.failed_attempts_total, 1);
        assert_eq!(snapshot.failed_attempts_user_total, 0);
    }

    #[tokio::test]
    async fn test_replay_without_timestamp_uses_current_time() {
        let limiter = limiter();
        let before = unix_now();
        let log = r#"{"ip":"10.0.0.1","user":"bob","outcome":"failure"}"#;

        let summary = replay_events(log.as_bytes(), &limiter).await.unwrap();

        assert_eq!(summary.replayed, 1);
        assert!(summary.last_ts >= before);
        assert!(summary.last_ts <= unix_now());
        let state = limiter
            .store()
            .attempt_state(gatekeeper::ratelimit::KeyKind::User, "bob")
            .unwrap();
        assert_eq!(state.failures.len(), 1);
        assert!(state.failures[0] >= before);
    }
}
