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

//! The allow-list of public keys accepted at the proxy handshake.
//!
//! The file uses the standard one-key-per-line format:
//!
//! ```text
//! ssh-ed25519 AAAAC3NzaC1lZDI1NTE5... user@host
//! ssh-rsa AAAAB3NzaC1yc2EAAAADAQAB... another@host
//! ```
//!
//! Parsing stops silently at the first blank or malformed line; keys
//! above that point are kept. Lookup is by the key's canonical wire
//! encoding, so any re-encoding of the same key matches.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use russh::keys::ssh_key::PublicKey;

/// Immutable set of authorized public keys, keyed by wire encoding.
#[derive(Debug, Default)]
pub struct AuthorizedKeys {
    keys: HashSet<Vec<u8>>,
}

impl AuthorizedKeys {
    /// Load the allow-list from a file.
    ///
    /// # Errors
    ///
    /// Returns an error only if the file cannot be read; content that
    /// stops parsing early is not an error.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read authorized keys from {}", path.display()))?;

        let keys = Self::parse(&content);
        tracing::info!(
            path = %path.display(),
            count = keys.len(),
            "loaded authorized keys"
        );
        Ok(keys)
    }

    /// Parse allow-list content, stopping at the first line that is not
    /// a public key.
    pub fn parse(content: &str) -> Self {
        let mut keys = HashSet::new();

        for line in content.lines() {
            match parse_key_line(line.trim()) {
                Some(key) => match key.to_bytes() {
                    Ok(encoded) => {
                        keys.insert(encoded);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping unencodable key, stopping parse");
                        break;
                    }
                },
                None => {
                    // Blank or malformed line ends the list.
                    break;
                }
            }
        }

        Self { keys }
    }

    /// Check whether `key` is authorized, comparing wire encodings.
    pub fn contains(&self, key: &PublicKey) -> bool {
        key.to_bytes()
            .map(|encoded| self.keys.contains(&encoded))
            .unwrap_or(false)
    }

    /// Number of keys in the set.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Parse a single `type base64-data [comment]` line.
fn parse_key_line(line: &str) -> Option<PublicKey> {
    let mut parts = line.split_whitespace();
    let _key_type = parts.next()?;
    let key_data = parts.next()?;

    russh::keys::parse_public_key_base64(key_data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@example";
    // Same structure, last key byte differs
    const OTHER_ED25519_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJm other@example";

    fn key_of(line: &str) -> PublicKey {
        parse_key_line(line).expect("test key should parse")
    }

    #[test]
    fn test_parse_single_key() {
        let keys = AuthorizedKeys::parse(ED25519_KEY);
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&key_of(ED25519_KEY)));
        assert!(!keys.contains(&key_of(OTHER_ED25519_KEY)));
    }

    #[test]
    fn test_parse_multiple_keys() {
        let content = format!("{ED25519_KEY}\n{OTHER_ED25519_KEY}\n");
        let keys = AuthorizedKeys::parse(&content);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&key_of(ED25519_KEY)));
        assert!(keys.contains(&key_of(OTHER_ED25519_KEY)));
    }

    #[test]
    fn test_blank_line_terminates() {
        let content = format!("{ED25519_KEY}\n\n{OTHER_ED25519_KEY}\n");
        let keys = AuthorizedKeys::parse(&content);
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&key_of(ED25519_KEY)));
        assert!(!keys.contains(&key_of(OTHER_ED25519_KEY)));
    }

    #[test]
    fn test_malformed_line_terminates() {
        let content = format!("not a key line\n{ED25519_KEY}\n");
        let keys = AuthorizedKeys::parse(&content);
        assert!(keys.is_empty());
    }

    #[test]
    fn test_empty_content() {
        let keys = AuthorizedKeys::parse("");
        assert!(keys.is_empty());
        assert!(!keys.contains(&key_of(ED25519_KEY)));
    }

    #[test]
    fn test_comment_is_optional() {
        let without_comment = ED25519_KEY.rsplit_once(' ').unwrap().0;
        let keys = AuthorizedKeys::parse(without_comment);
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&key_of(ED25519_KEY)));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = AuthorizedKeys::load("/nonexistent/authorized_keys").await;
        assert!(result.is_err());
    }
}
