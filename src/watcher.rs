// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Auth-log watcher driving the quarantine table.
//!
//! A single long-running task re-reads the host authentication log on a
//! fixed period, extracts the source IP of every `Failed password` line,
//! and bans addresses that cross the failure threshold. The file is read
//! from the beginning on every pass and no offset is tracked; the bounded
//! ban window keeps this correct across log rotation.
//!
//! Every matched line is stamped with the wall clock of the pass that saw
//! it, not with the timestamp embedded in the line. An address with enough
//! matching lines anywhere in the file is therefore banned on every pass
//! until the next sweep lets the ban lapse. This mirrors the deployed
//! behavior and the tests pin it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::banlist::BanList;

/// Failures within the window required before an address is banned.
pub const BAN_THRESHOLD: usize = 5;

/// How far back failures count towards the threshold.
pub const BAN_WINDOW: Duration = Duration::from_secs(10 * 60);

/// How long a triggered ban lasts.
pub const BAN_DURATION: Duration = Duration::from_secs(10 * 60);

/// Sleep between successful passes over the log.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Sleep after failing to open the log before trying again.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

const FAILED_PASSWORD_PATTERN: &str =
    r"(?i)Failed password for .* from ([0-9]{1,3}(?:\.[0-9]{1,3}){3}) port";

/// Background task that tails the auth log and feeds the [`BanList`].
#[derive(Debug)]
pub struct LogWatcher {
    path: PathBuf,
    bans: BanList,
    pattern: Regex,
}

/// Outcome of a single pass over the log, mostly for logs and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Lines that matched the failed-password pattern.
    pub matched_lines: usize,
    /// Addresses banned by this pass.
    pub banned: Vec<String>,
}

impl LogWatcher {
    /// Create a watcher over `path` feeding `bans`.
    pub fn new(path: impl Into<PathBuf>, bans: BanList) -> Self {
        Self {
            path: path.into(),
            bans,
            // Compile-time constant, exercised by the unit tests.
            pattern: Regex::new(FAILED_PASSWORD_PATTERN).expect("failed-password pattern is valid"),
        }
    }

    /// Run forever: scan, sweep, sleep.
    ///
    /// A pass that cannot open the log is logged at warn and retried
    /// after [`RETRY_INTERVAL`]; nothing here is fatal to the process.
    pub async fn run(self) {
        tracing::info!(path = %self.path.display(), "starting auth log watcher");

        loop {
            match self.scan_once().await {
                Ok(outcome) => {
                    if !outcome.banned.is_empty() {
                        tracing::info!(
                            banned = outcome.banned.len(),
                            matched_lines = outcome.matched_lines,
                            "auth log pass complete"
                        );
                    }
                    self.bans.sweep().await;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "failed to read auth log, will retry"
                    );
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Perform one pass over the log.
    ///
    /// Reads the whole file, buckets failure timestamps per source IP
    /// (stamped with this pass's clock), and bans every address with at
    /// least [`BAN_THRESHOLD`] failures inside [`BAN_WINDOW`].
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened or read; the caller
    /// treats that as transient.
    pub async fn scan_once(&self) -> Result<ScanOutcome> {
        let file = File::open(&self.path)
            .await
            .with_context(|| format!("failed to open auth log {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let now = Instant::now();
        let mut failures: HashMap<String, Vec<Instant>> = HashMap::new();
        let mut outcome = ScanOutcome::default();

        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("failed to read auth log {}", self.path.display()))?
        {
            if let Some(ip) = self.match_failed_password(&line) {
                failures.entry(ip.to_string()).or_default().push(now);
                outcome.matched_lines += 1;
            }
        }

        for (ip, stamps) in failures {
            let recent = stamps
                .iter()
                .filter(|stamp| now.duration_since(**stamp) <= BAN_WINDOW)
                .count();
            if recent >= BAN_THRESHOLD {
                tracing::info!(
                    ip = %ip,
                    failures = recent,
                    ban_secs = BAN_DURATION.as_secs(),
                    "failure threshold reached"
                );
                self.bans.ban(&ip, BAN_DURATION).await;
                outcome.banned.push(ip);
            }
        }

        Ok(outcome)
    }

    /// Extract the source IP from a failed-password line, if any.
    fn match_failed_password<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.pattern
            .captures(line)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str())
    }
}
