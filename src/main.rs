use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use sliding_gate::config::GateConfig;
use sliding_gate::ratelimit::{Decision, KeyResolver, LimiterFacade, RateLimitKey, RequestIdentity};
use sliding_gate::telemetry;

/// Sliding window rate limiter.
#[derive(Debug, Parser)]
#[command(name = "sliding-gate", version, about)]
struct Cli {
    /// YAML configuration file; SLIDING_GATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run requests through the configured limiter and print each decision
    Check {
        /// Client key, e.g. `ip:1.2.3.4` or `user:42`
        #[arg(short, long)]
        key: String,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Pause between requests, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Request path, matched against the skip paths
        #[arg(long)]
        path: Option<String>,
    },
    /// Print the effective configuration
    ShowConfig,
}

/// Resolves every request to the key given on the command line.
struct FixedKey(RateLimitKey);

impl KeyResolver for FixedKey {
    fn resolve_key(&self, _request: &RequestIdentity) -> RateLimitKey {
        self.0.clone()
    }
}

/// One line of `check` output.
#[derive(Debug, Serialize)]
struct DecisionLine<'a> {
    seq: u32,
    key: &'a str,
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset: u64,
    reset_at: String,
}

impl<'a> DecisionLine<'a> {
    fn new(seq: u32, key: &'a str, decision: &Decision) -> Self {
        let reset_at: DateTime<Utc> = decision.reset_at.into();
        Self {
            seq,
            key,
            allowed: decision.allowed,
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset_epoch_secs(),
            reset_at: reset_at.to_rfc3339(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GateConfig::load(cli.config.as_deref())?;

    telemetry::init(&config.logging)?;
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::ShowConfig => {
            print!("{}", config.to_yaml()?);
        }
        Command::Check {
            key,
            count,
            interval_ms,
            path,
        } => {
            let facade = LimiterFacade::from_config(&config)
                .await?
                .with_resolver(Arc::new(FixedKey(RateLimitKey::new(key.as_str()))));
            let request = RequestIdentity::new(
                path.unwrap_or_else(|| "/".to_string()),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
            );
            let interval = Duration::from_millis(interval_ms);

            for seq in 1..=count {
                let decision = facade.allow_request(&request).await;

                println!("{}", serde_json::to_string(&DecisionLine::new(seq, &key, &decision))?);

                if !interval.is_zero() && seq < count {
                    tokio::time::sleep(interval).await;
                }
            }

            let stats = facade.stats();
            info!(
                decisions = stats.decisions,
                rejections = stats.rejections,
                bypasses = stats.bypasses,
                backend_failures = stats.backend_failures,
                "Check finished"
            );
        }
    }

    Ok(())
}
