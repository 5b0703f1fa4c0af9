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

//! End-to-end tests for the auth-log watcher feeding the quarantine
//! table, driven one pass at a time over on-disk fixtures.

use std::io::Write;

use sshproxy::watcher::{BAN_THRESHOLD, POLL_INTERVAL, RETRY_INTERVAL};
use sshproxy::{BanList, LogWatcher};

fn seeded_log(ip: &str, lines: usize) -> tempfile::NamedTempFile {
    let mut log = tempfile::NamedTempFile::new().unwrap();
    for n in 0..lines {
        writeln!(
            log,
            "Jan  1 00:00:0{n} host sshd[4242]: Failed password for root from {ip} port {} ssh2",
            40000 + n
        )
        .unwrap();
    }
    log.flush().unwrap();
    log
}

#[tokio::test]
async fn seeded_log_quarantines_address() {
    let log = seeded_log("127.0.0.1", BAN_THRESHOLD);
    let bans = BanList::new();
    let watcher = LogWatcher::new(log.path(), bans.clone());

    let outcome = watcher.scan_once().await.unwrap();

    assert_eq!(outcome.banned, vec!["127.0.0.1".to_string()]);
    assert!(bans.is_banned("127.0.0.1").await);

    // An admission check for an unrelated address still passes.
    assert!(!bans.is_banned("198.51.100.1").await);
}

#[tokio::test]
async fn below_threshold_never_bans() {
    let log = seeded_log("127.0.0.1", BAN_THRESHOLD - 1);
    let bans = BanList::new();
    let watcher = LogWatcher::new(log.path(), bans.clone());

    let outcome = watcher.scan_once().await.unwrap();

    assert!(outcome.banned.is_empty());
    assert!(!bans.is_banned("127.0.0.1").await);
}

#[tokio::test]
async fn missing_log_is_recoverable_and_never_bans() {
    let bans = BanList::new();
    let watcher = LogWatcher::new("/nonexistent/path/auth.log", bans.clone());

    // Every pass fails the same way and the table stays empty.
    assert!(watcher.scan_once().await.is_err());
    assert!(watcher.scan_once().await.is_err());
    assert!(bans.is_empty().await);
}

#[tokio::test]
async fn lines_appended_between_passes_are_picked_up() {
    let mut log = seeded_log("127.0.0.1", BAN_THRESHOLD - 1);
    let bans = BanList::new();
    let watcher = LogWatcher::new(log.path(), bans.clone());

    watcher.scan_once().await.unwrap();
    assert!(!bans.is_banned("127.0.0.1").await);

    // One more failure lands in the log before the next pass; the full
    // re-read counts all lines as current and crosses the threshold.
    writeln!(
        log,
        "Jan  1 00:01:00 host sshd[4242]: Failed password for root from 127.0.0.1 port 40999 ssh2"
    )
    .unwrap();
    log.flush().unwrap();

    let outcome = watcher.scan_once().await.unwrap();
    assert_eq!(outcome.banned, vec!["127.0.0.1".to_string()]);
    assert!(bans.is_banned("127.0.0.1").await);
}

#[test]
fn watcher_intervals_are_fixed() {
    // The cadence is part of the operational contract.
    assert_eq!(POLL_INTERVAL.as_secs(), 60);
    assert_eq!(RETRY_INTERVAL.as_secs(), 30);
}
