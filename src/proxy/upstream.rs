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

//! Authenticated client connections to the upstream server.
//!
//! After a client passes the edge handshake, its session channels are
//! forwarded over a single SSH connection the proxy opens to the upstream,
//! authenticated as the same user. Two credential sources are supported,
//! chosen once per session:
//!
//! - **Agent delegation**: when a credential agent socket is available,
//!   the agent signs the upstream handshake.
//! - **Inline key**: a private key held by the proxy is used directly.
//!
//! Host key verification against the upstream is intentionally disabled:
//! the proxy is tenant-to-tenant plumbing behind the trust boundary, not
//! the trust anchor. Point it only at an upstream you control.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, Handler};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use thiserror::Error;

/// Wall-clock budget for connecting and authenticating upstream.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Credential source for the upstream handshake.
#[derive(Debug, Clone)]
pub enum UpstreamAuth {
    /// Delegate signing to a credential agent over its local socket.
    Agent { socket: PathBuf },
    /// Sign with a private key held by the proxy.
    Inline { key: Arc<PrivateKey> },
}

impl UpstreamAuth {
    /// Pick the credential source for a session.
    ///
    /// Agent delegation is preferred when a socket is available; the
    /// inline key is the fallback.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::NoCredential`] when neither source exists.
    pub fn resolve(
        agent_socket: Option<&PathBuf>,
        inline_key: Option<&Arc<PrivateKey>>,
    ) -> Result<Self, UpstreamError> {
        if let Some(socket) = agent_socket {
            return Ok(Self::Agent {
                socket: socket.clone(),
            });
        }
        if let Some(key) = inline_key {
            return Ok(Self::Inline {
                key: Arc::clone(key),
            });
        }
        Err(UpstreamError::NoCredential)
    }
}

/// Errors from dialing or authenticating to the upstream.
///
/// These never tear down the client session; they close the channel that
/// triggered the dial and later channel opens retry.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no upstream credential available (no agent socket, no inline key)")]
    NoCredential,

    #[error("timed out connecting to upstream {addr}")]
    ConnectTimeout { addr: String },

    #[error("upstream rejected authentication for user '{user}'")]
    AuthRejected { user: String },

    #[error("credential agent has no identities")]
    NoAgentIdentities,

    #[error("credential agent failure: {0}")]
    Agent(#[from] russh::keys::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

/// Client handler for the upstream connection.
///
/// `check_server_key` accepts any host key; see the module docs for why
/// this is deliberate.
#[derive(Debug, Clone)]
pub struct UpstreamHandler;

impl Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Open and authenticate an SSH connection to the upstream.
///
/// # Arguments
///
/// * `addr` - Upstream address in `host:port` form
/// * `user` - User asserted by the accepted edge handshake
/// * `auth` - Credential source resolved for this session
pub async fn dial(
    addr: &str,
    user: &str,
    auth: &UpstreamAuth,
) -> Result<Handle<UpstreamHandler>, UpstreamError> {
    let config = Arc::new(client::Config::default());

    let mut handle = tokio::time::timeout(
        DIAL_TIMEOUT,
        client::connect(config, addr, UpstreamHandler),
    )
    .await
    .map_err(|_| UpstreamError::ConnectTimeout {
        addr: addr.to_string(),
    })??;

    match auth {
        UpstreamAuth::Agent { socket } => {
            authenticate_with_agent(&mut handle, user, socket).await?;
        }
        UpstreamAuth::Inline { key } => {
            authenticate_with_key(&mut handle, user, key).await?;
        }
    }

    tracing::info!(upstream = %addr, user = %user, "upstream connection established");
    Ok(handle)
}

/// Try every identity the agent offers until one authenticates.
async fn authenticate_with_agent(
    handle: &mut Handle<UpstreamHandler>,
    user: &str,
    socket: &PathBuf,
) -> Result<(), UpstreamError> {
    let mut agent = AgentClient::connect_uds(socket).await?;
    let identities = agent.request_identities().await?;

    if identities.is_empty() {
        return Err(UpstreamError::NoAgentIdentities);
    }

    tracing::debug!(
        identities = identities.len(),
        socket = %socket.display(),
        "trying agent identities against upstream"
    );

    for identity in identities {
        let hash = handle.best_supported_rsa_hash().await?.flatten();
        let result = handle
            .authenticate_publickey_with(user, identity.clone(), hash, &mut agent)
            .await;

        match result {
            Ok(auth_result) if auth_result.success() => return Ok(()),
            Ok(_) => {
                tracing::debug!(
                    key_type = %identity.algorithm(),
                    "upstream declined agent identity"
                );
            }
            Err(e) => {
                tracing::debug!(
                    key_type = %identity.algorithm(),
                    error = %e,
                    "agent signing attempt failed"
                );
            }
        }
    }

    Err(UpstreamError::AuthRejected {
        user: user.to_string(),
    })
}

/// Authenticate with the proxy-held private key.
async fn authenticate_with_key(
    handle: &mut Handle<UpstreamHandler>,
    user: &str,
    key: &Arc<PrivateKey>,
) -> Result<(), UpstreamError> {
    let hash = handle.best_supported_rsa_hash().await?.flatten();
    let result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::clone(key), hash))
        .await?;

    if result.success() {
        Ok(())
    } else {
        Err(UpstreamError::AuthRejected {
            user: user.to_string(),
        })
    }
}
