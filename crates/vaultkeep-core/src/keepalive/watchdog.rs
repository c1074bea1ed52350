//! The keepalive loop.
//!
//! Sleeps a jittered interval, re-reads the token file, probes the vault,
//! and repeats until the hard deadline, a failure, or a stop request. The
//! jitter keeps the pings from settling into lockstep with the server's
//! fixed inactivity window. The watchdog never re-authenticates; only the
//! interactive process can prompt for credentials.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::api::{ApiClient, SessionApi};
use crate::auth::{TokenStateError, TokenStore};
use crate::utils::format_hours;

use super::log::KeepaliveLog;
use super::process::{remove_pid_file_if_owned, WatchdogArgs};

/// Why a watchdog run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    HardTimeout,
    TokenMissing,
    TokenEmpty,
    PingFailed,
    Stopped,
}

impl ExitReason {
    /// Process exit status for this reason
    pub fn exit_code(&self) -> u8 {
        match self {
            ExitReason::HardTimeout | ExitReason::Stopped => 0,
            ExitReason::TokenMissing | ExitReason::TokenEmpty | ExitReason::PingFailed => 1,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExitReason::HardTimeout => "hard timeout reached",
            ExitReason::TokenMissing => "token file missing",
            ExitReason::TokenEmpty => "token file empty",
            ExitReason::PingFailed => "ping failed",
            ExitReason::Stopped => "stop requested",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogReport {
    pub reason: ExitReason,
    /// Successful probes during the run
    pub pings: u32,
    pub elapsed: Duration,
}

pub struct Watchdog<P> {
    probe: P,
    store: TokenStore,
    log: KeepaliveLog,
    min_interval: u64,
    max_interval: u64,
    deadline: Instant,
    rng: StdRng,
}

impl<P: SessionApi> Watchdog<P> {
    /// Intervals are whole seconds; `max_interval` below `min_interval` is
    /// raised to it.
    pub fn new(
        probe: P,
        store: TokenStore,
        log: KeepaliveLog,
        min_interval: u64,
        max_interval: u64,
        deadline: Instant,
    ) -> Self {
        Self {
            probe,
            store,
            log,
            min_interval,
            max_interval: max_interval.max(min_interval),
            deadline,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic jitter, for tests
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn next_interval(&mut self) -> Duration {
        Duration::from_secs(self.rng.gen_range(self.min_interval..=self.max_interval))
    }

    /// Run until the deadline, a failure, or `stop` resolves.
    pub async fn run<F>(mut self, stop: F) -> WatchdogReport
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let mut pings = 0;
        tokio::pin!(stop);

        let reason = loop {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.log.append("Hard timeout reached, exiting");
                break ExitReason::HardTimeout;
            }

            let nap = self.next_interval().min(remaining);
            self.log.append(format!(
                "Sleeping {:.0}s (remaining: {})",
                nap.as_secs_f64(),
                format_hours(remaining)
            ));

            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = &mut stop => {
                    self.log.append("Stop requested, shutting down");
                    break ExitReason::Stopped;
                }
            }

            if Instant::now() >= self.deadline {
                self.log.append("Hard timeout reached after sleep, exiting");
                break ExitReason::HardTimeout;
            }

            let token = match self.store.require() {
                Ok(token) => token,
                Err(TokenStateError::Missing(_)) => {
                    self.log.append("Token file missing, exiting");
                    break ExitReason::TokenMissing;
                }
                Err(TokenStateError::Empty(_)) => {
                    self.log.append("Token is empty, exiting");
                    break ExitReason::TokenEmpty;
                }
            };

            if self.probe.probe(&token).await {
                pings += 1;
                self.log.append(format!(
                    "Keepalive ping successful (elapsed: {})",
                    format_hours(started.elapsed())
                ));
            } else {
                self.log
                    .append("Keepalive ping failed - token expired or invalid, exiting");
                break ExitReason::PingFailed;
            }
        };

        WatchdogReport {
            reason,
            pings,
            elapsed: started.elapsed(),
        }
    }
}

/// Body of the detached watchdog process.
///
/// Builds the real client from `args`, runs the loop, and removes the PID
/// file on the way out if it still names this process.
pub async fn run_from_args<F>(args: WatchdogArgs, stop: F) -> Result<WatchdogReport>
where
    F: Future<Output = ()>,
{
    let log = KeepaliveLog::new(args.log_path.clone());
    let client = ApiClient::new(&args.endpoint, args.verify_ssl)
        .context("Failed to build API client for keepalive")?;

    // Convert the wall-clock deadline to the monotonic clock once
    let remaining = (args.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let pid = std::process::id();

    log.append(format!("Keepalive started for endpoint: {}", args.endpoint));
    log.append(format!(
        "Hard timeout: {}s ({})",
        remaining.as_secs(),
        format_hours(remaining)
    ));
    log.append(format!("PID: {}", pid));

    let watchdog = Watchdog::new(
        client,
        TokenStore::new(args.token_path.clone()),
        log.clone(),
        args.min_interval,
        args.max_interval,
        Instant::now() + remaining,
    );
    let report = watchdog.run(stop).await;

    log.append(format!(
        "Keepalive exiting: {} ({} successful pings over {})",
        report.reason,
        report.pings,
        format_hours(report.elapsed)
    ));
    remove_pid_file_if_owned(&args.pid_path, pid);
    Ok(report)
}
