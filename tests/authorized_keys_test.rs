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

//! Tests for loading the authorized key allow-list from disk.

use std::io::Write;

use sshproxy::AuthorizedKeys;

const KEY_LINE: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@example";

fn key_of(line: &str) -> russh::keys::PublicKey {
    let data = line.split_whitespace().nth(1).unwrap();
    russh::keys::parse_public_key_base64(data).unwrap()
}

#[tokio::test]
async fn load_single_key_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{KEY_LINE}").unwrap();
    file.flush().unwrap();

    let keys = AuthorizedKeys::load(file.path()).await.unwrap();

    assert_eq!(keys.len(), 1);
    assert!(keys.contains(&key_of(KEY_LINE)));
}

#[tokio::test]
async fn trailing_garbage_keeps_earlier_keys() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{KEY_LINE}").unwrap();
    writeln!(file, "-- corrupted tail --").unwrap();
    file.flush().unwrap();

    let keys = AuthorizedKeys::load(file.path()).await.unwrap();

    // Parsing stops at the malformed line but keeps what came before.
    assert_eq!(keys.len(), 1);
    assert!(keys.contains(&key_of(KEY_LINE)));
}

#[tokio::test]
async fn empty_file_yields_empty_set() {
    let file = tempfile::NamedTempFile::new().unwrap();

    let keys = AuthorizedKeys::load(file.path()).await.unwrap();

    assert!(keys.is_empty());
    assert!(!keys.contains(&key_of(KEY_LINE)));
}

#[tokio::test]
async fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no_such_file");

    let result = AuthorizedKeys::load(&path).await;
    assert!(result.is_err());
}
