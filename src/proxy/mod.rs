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

//! The proxy server: admission, handshake termination, forwarding.
//!
//! [`ProxyServer`] owns the accept loop. Quarantined addresses are dropped
//! before a single protocol byte is exchanged; everything else is handed
//! to a per-connection task running the SSH session with a
//! [`ProxyHandler`]. A connection that has not authenticated within
//! [`HANDSHAKE_DEADLINE`] is closed by a watchdog.

pub mod forward;
pub mod handler;
pub mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use tokio::net::{TcpListener, TcpStream};

use crate::auth::AuthorizedKeys;
use crate::banlist::{BackoffList, BanList};

pub use self::handler::ProxyHandler;
pub use self::upstream::{UpstreamAuth, UpstreamError};

/// Wall-clock budget from socket accept to completed authentication.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Immutable state shared by every connection.
pub struct ProxyContext {
    /// Upstream SSH server, `host:port`.
    pub upstream_addr: String,

    /// Private key presented to clients during the handshake.
    pub host_key: PrivateKey,

    /// Public keys accepted at the edge.
    pub authorized: Arc<AuthorizedKeys>,

    /// Quarantine table written by the log watcher.
    pub bans: BanList,

    /// Backoff table written by failed handshakes.
    pub backoff: BackoffList,

    /// Credential agent socket, if the environment exposes one.
    pub agent_socket: Option<PathBuf>,

    /// Optional private key for upstream auth when no agent is available.
    pub upstream_key: Option<Arc<PrivateKey>>,
}

/// The front-door proxy server.
pub struct ProxyServer {
    listen_addr: String,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    /// Create a server listening on `listen_addr`.
    pub fn new(listen_addr: impl Into<String>, ctx: ProxyContext) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ctx: Arc::new(ctx),
        }
    }

    /// Shared proxy state, mainly for tests.
    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// Run the accept loop forever.
    ///
    /// # Errors
    ///
    /// Returns an error only if the listen address cannot be bound;
    /// individual accept failures are logged and the loop continues.
    pub async fn run(&self) -> Result<()> {
        let config = Arc::new(self.build_russh_config());

        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("failed to bind listener on {}", self.listen_addr))?;

        tracing::info!(
            listen = %self.listen_addr,
            upstream = %self.ctx.upstream_addr,
            "proxy listening"
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let ip = peer.ip().to_string();
            if self.ctx.bans.is_banned(&ip).await {
                tracing::warn!(ip = %ip, "rejected quarantined address");
                continue;
            }

            tracing::debug!(peer = %peer, "connection admitted");

            let config = Arc::clone(&config);
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(config, ctx, stream, peer).await {
                    tracing::debug!(peer = %peer, error = %e, "session ended with error");
                }
            });
        }
    }

    fn build_russh_config(&self) -> russh::server::Config {
        russh::server::Config {
            keys: vec![self.ctx.host_key.clone()],
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        }
    }
}

/// Drive one client session to completion.
///
/// The handshake watchdog fires once: if the peer has not authenticated
/// by then, the session is told to disconnect and the connection winds
/// down. After authentication the session runs until the client
/// disconnects or a protocol error ends it.
async fn serve_connection(
    config: Arc<russh::server::Config>,
    ctx: Arc<ProxyContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let accepted_at = Instant::now();
    let authed = Arc::new(AtomicBool::new(false));
    let handler = ProxyHandler::new(Some(peer), ctx, Arc::clone(&authed));

    // The deadline covers the version exchange too, not just key
    // exchange and auth.
    let session = tokio::time::timeout(
        HANDSHAKE_DEADLINE,
        russh::server::run_stream(config, stream, handler),
    )
    .await
    .map_err(|_| anyhow::anyhow!("handshake deadline exceeded during version exchange"))??;

    let handle = session.handle();
    let mut session = pin!(session);
    let remaining = HANDSHAKE_DEADLINE.saturating_sub(accepted_at.elapsed());

    tokio::select! {
        result = session.as_mut() => return result,
        _ = tokio::time::sleep(remaining) => {
            if !authed.load(Ordering::Relaxed) {
                tracing::warn!(peer = %peer, "handshake deadline exceeded");
                let _ = handle
                    .disconnect(
                        russh::Disconnect::ByApplication,
                        "handshake timeout".into(),
                        "".into(),
                    )
                    .await;
                return Ok(());
            }
        }
    }

    // Authenticated before the deadline; the watchdog is spent.
    session.await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> ProxyContext {
        use russh::keys::ssh_key::rand_core::OsRng;
        let host_key =
            PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519)
                .expect("key generation should not fail");

        ProxyContext {
            upstream_addr: "127.0.0.1:2222".to_string(),
            host_key,
            authorized: Arc::new(AuthorizedKeys::default()),
            bans: BanList::new(),
            backoff: BackoffList::new(),
            agent_socket: None,
            upstream_key: None,
        }
    }

    #[test]
    fn test_server_creation() {
        let server = ProxyServer::new("127.0.0.1:2245", test_context());

        assert_eq!(server.listen_addr, "127.0.0.1:2245");
        assert_eq!(server.context().upstream_addr, "127.0.0.1:2222");
    }

    #[test]
    fn test_russh_config_has_host_key() {
        let server = ProxyServer::new("127.0.0.1:2245", test_context());
        let config = server.build_russh_config();

        assert_eq!(config.keys.len(), 1);
    }

    #[tokio::test]
    async fn test_run_fails_on_unbindable_address() {
        let server = ProxyServer::new("256.256.256.256:2245", test_context());

        let result = server.run().await;
        assert!(result.is_err());
    }
}
