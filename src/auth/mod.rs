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

//! Key material loaded once at startup.
//!
//! - [`AuthorizedKeys`]: the public keys the proxy accepts at its own
//!   handshake, immutable for the process lifetime.
//! - [`load_host_key`]: the private key the proxy presents to clients.

pub mod authorized_keys;

use std::path::Path;

use anyhow::{Context, Result};

pub use self::authorized_keys::AuthorizedKeys;

/// Load an SSH private key from an OpenSSH-format file.
///
/// Used for both the proxy's host key and the optional upstream key.
///
/// # Errors
///
/// Returns an error if the key file cannot be read or parsed.
pub fn load_host_key(path: impl AsRef<Path>) -> Result<russh::keys::PrivateKey> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "loading private key");

    russh::keys::PrivateKey::read_openssh_file(path)
        .with_context(|| format!("failed to load private key from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_host_key_missing_file() {
        let result = load_host_key("/nonexistent/host_key");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("/nonexistent/host_key"));
    }
}
