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

//! Per-connection protocol handler.
//!
//! Implements `russh::server::Handler` for one accepted client: terminates
//! the handshake against the authorized key set (with backoff on
//! failures), then turns every accepted session channel into a forwarding
//! pump towards the upstream. Non-session channels, subsystems, and global
//! forwarding requests are refused; the payload bytes themselves are never
//! inspected.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use russh::keys::ssh_key;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::forward::{self, ForwardCmd, ForwardTarget, UpstreamSlot};
use super::upstream::UpstreamAuth;
use super::ProxyContext;

/// Handler for a single client connection.
pub struct ProxyHandler {
    /// Remote address of the connected client.
    peer_addr: Option<SocketAddr>,

    /// Shared proxy state (key material, tables, upstream coordinates).
    ctx: Arc<ProxyContext>,

    /// Set on successful authentication; read by the handshake watchdog.
    authed: Arc<AtomicBool>,

    /// User asserted by the accepted handshake.
    username: Option<String>,

    /// The accepted public key, kept so later stages can identify the
    /// client by its wire encoding.
    client_key: Option<ssh_key::PublicKey>,

    /// Credential source for the upstream, resolved at first channel open.
    upstream_auth: Option<UpstreamAuth>,
    upstream_auth_resolved: bool,

    /// Upstream connection shared by all channels of this session.
    upstream: UpstreamSlot,

    /// Live forwarded channels.
    channels: HashMap<ChannelId, ForwardedChannel>,
}

/// Handler-side ends of one forwarded channel.
struct ForwardedChannel {
    cmds: UnboundedSender<ForwardCmd>,
    cancel: CancellationToken,
}

impl ProxyHandler {
    /// Create a handler for a freshly accepted connection.
    pub fn new(
        peer_addr: Option<SocketAddr>,
        ctx: Arc<ProxyContext>,
        authed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            peer_addr,
            ctx,
            authed,
            username: None,
            client_key: None,
            upstream_auth: None,
            upstream_auth_resolved: false,
            upstream: Arc::new(Mutex::new(None)),
            channels: HashMap::new(),
        }
    }

    /// Peer identity as the backoff table sees it (`ip:port`).
    fn peer_key(&self) -> String {
        self.peer_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Whether the handshake has completed successfully.
    pub fn is_authenticated(&self) -> bool {
        self.authed.load(Ordering::Relaxed)
    }

    /// The authenticated username, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Wire encoding of the accepted client key, if authenticated.
    pub fn client_key_bytes(&self) -> Option<Vec<u8>> {
        self.client_key.as_ref().and_then(|key| key.to_bytes().ok())
    }

    /// Log a channel request and relay it to the channel's pump.
    ///
    /// Replies success once the command is queued; the pump applies it to
    /// the upstream channel in order. Requests for unknown channels get a
    /// failure reply.
    fn relay_request(
        &mut self,
        channel: ChannelId,
        kind: &str,
        cmd: ForwardCmd,
        session: &mut Session,
        wants_reply: bool,
    ) {
        match self.channels.get(&channel) {
            Some(state) if state.cmds.send(cmd).is_ok() => {
                tracing::debug!(
                    channel = ?channel,
                    request = %kind,
                    "relaying channel request upstream"
                );
                if wants_reply {
                    let _ = session.channel_success(channel);
                }
            }
            _ => {
                tracing::debug!(
                    channel = ?channel,
                    request = %kind,
                    "channel request without live forward"
                );
                if wants_reply {
                    let _ = session.channel_failure(channel);
                }
            }
        }
    }
}

impl russh::server::Handler for ProxyHandler {
    type Error = anyhow::Error;

    /// Reject 'none' authentication, advertising public key auth.
    fn auth_none(
        &mut self,
        user: &str,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        tracing::debug!(
            user = %user,
            peer = ?self.peer_addr,
            "auth none attempt"
        );

        let mut methods = MethodSet::empty();
        methods.push(MethodKind::PublicKey);

        async move {
            Ok(Auth::Reject {
                proceed_with_methods: Some(methods),
                partial_success: false,
            })
        }
    }

    /// Terminate public key authentication against the allow-list.
    ///
    /// Peers inside their backoff window are rejected before the key is
    /// looked at. Every rejection is the same opaque result on the wire;
    /// only the server log distinguishes backoff from a bad key.
    fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        tracing::debug!(
            user = %user,
            peer = ?self.peer_addr,
            key_type = %public_key.algorithm(),
            "public key authentication attempt"
        );

        let peer = self.peer_key();
        let ctx = Arc::clone(&self.ctx);
        let authed = Arc::clone(&self.authed);
        let user = user.to_string();
        let public_key = public_key.clone();

        let username_slot = &mut self.username;
        let key_slot = &mut self.client_key;

        async move {
            if ctx.backoff.is_penalized(&peer).await {
                tracing::warn!(
                    peer = %peer,
                    user = %user,
                    "rejecting handshake during backoff"
                );
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                });
            }

            if ctx.authorized.contains(&public_key) {
                tracing::info!(
                    user = %user,
                    peer = %peer,
                    key_type = %public_key.algorithm(),
                    "public key authentication successful"
                );

                *username_slot = Some(user);
                *key_slot = Some(public_key);
                authed.store(true, Ordering::Relaxed);

                Ok(Auth::Accept)
            } else {
                tracing::info!(
                    user = %user,
                    peer = %peer,
                    key_type = %public_key.algorithm(),
                    "public key not authorized"
                );

                ctx.backoff.penalize(&peer).await;

                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    /// Accept a session channel and start its forwarding pump.
    ///
    /// The first channel of a session also resolves the upstream
    /// credential source. The pump dials lazily, so a dead upstream shows
    /// up as the channel closing shortly after it was accepted.
    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let id = channel.id();

        let Some(user) = self.username.clone() else {
            tracing::warn!(channel = ?id, peer = ?self.peer_addr, "session channel before auth");
            return async { Ok(false) }.boxed();
        };

        if !self.upstream_auth_resolved {
            self.upstream_auth_resolved = true;
            self.upstream_auth = match UpstreamAuth::resolve(
                self.ctx.agent_socket.as_ref(),
                self.ctx.upstream_key.as_ref(),
            ) {
                Ok(auth) => Some(auth),
                Err(e) => {
                    tracing::warn!(
                        peer = ?self.peer_addr,
                        error = %e,
                        "session has no upstream credential"
                    );
                    None
                }
            };
        }

        let (cmds, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.channels.insert(
            id,
            ForwardedChannel {
                cmds,
                cancel: cancel.clone(),
            },
        );

        let target = ForwardTarget {
            addr: self.ctx.upstream_addr.clone(),
            user,
            auth: self.upstream_auth.clone(),
        };

        tracing::debug!(
            channel = ?id,
            peer = ?self.peer_addr,
            "session channel opened"
        );

        tokio::spawn(forward::run(
            session.handle(),
            id,
            Arc::clone(&self.upstream),
            target,
            cmd_rx,
            cancel,
        ));

        async { Ok(true) }.boxed()
    }

    /// Refuse non-session channels; the session itself stays up.
    fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        tracing::info!(
            channel = ?channel.id(),
            peer = ?self.peer_addr,
            target = %format!("{host_to_connect}:{port_to_connect}"),
            "rejecting unknown channel type"
        );
        async { Ok(false) }
    }

    /// Forward client bytes into the channel's pump.
    fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::trace!(channel = ?channel, bytes = %data.len(), "client data");

        if let Some(state) = self.channels.get(&channel) {
            if state.cmds.send(ForwardCmd::Data(data.to_vec())).is_err() {
                tracing::debug!(channel = ?channel, "dropping data for ended forward");
            }
        }

        async { Ok(()) }
    }

    fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        // The command bytes are relayed opaquely, never parsed.
        self.relay_request(
            channel,
            "exec",
            ForwardCmd::Exec(data.to_vec()),
            session,
            true,
        );
        async { Ok(()) }
    }

    fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        self.relay_request(channel, "shell", ForwardCmd::Shell, session, true);
        async { Ok(()) }
    }

    #[allow(clippy::too_many_arguments)]
    fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let cmd = ForwardCmd::Pty {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        };
        self.relay_request(channel, "pty-req", cmd, session, true);
        async { Ok(()) }
    }

    fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let cmd = ForwardCmd::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.relay_request(channel, "env", cmd, session, true);
        async { Ok(()) }
    }

    #[allow(clippy::too_many_arguments)]
    fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let cmd = ForwardCmd::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        };
        // window-change carries no reply
        self.relay_request(channel, "window-change", cmd, session, false);
        async { Ok(()) }
    }

    /// Subsystems are not forwarded.
    fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::info!(
            channel = ?channel,
            subsystem = %name,
            peer = ?self.peer_addr,
            "subsystem not supported"
        );
        let _ = session.channel_failure(channel);
        async { Ok(()) }
    }

    /// Global forwarding requests are refused.
    fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        tracing::info!(
            peer = ?self.peer_addr,
            bind = %format!("{address}:{port}"),
            "global request not supported"
        );
        async { Ok(false) }
    }

    fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        tracing::info!(
            peer = ?self.peer_addr,
            bind = %format!("{address}:{port}"),
            "global request not supported"
        );
        async { Ok(false) }
    }

    /// Propagate client EOF to the upstream half.
    fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::debug!(channel = ?channel, "client channel eof");

        if let Some(state) = self.channels.get(&channel) {
            let _ = state.cmds.send(ForwardCmd::Eof);
        }

        async { Ok(()) }
    }

    /// Unwind the pump when the client closes its half.
    fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::debug!(channel = ?channel, "client channel closed");

        if let Some(state) = self.channels.remove(&channel) {
            state.cancel.cancel();
        }

        async { Ok(()) }
    }
}

impl Drop for ProxyHandler {
    fn drop(&mut self) {
        // The connection is gone; cancel every pump so upstream halves
        // close too.
        for (id, state) in self.channels.drain() {
            tracing::debug!(channel = ?id, "cancelling forward on session end");
            state.cancel.cancel();
        }

        tracing::info!(
            peer = ?self.peer_addr,
            user = ?self.username,
            authenticated = %self.is_authenticated(),
            "session ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthorizedKeys;
    use crate::banlist::{BackoffList, BanList};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_ctx() -> Arc<ProxyContext> {
        use russh::keys::ssh_key::rand_core::OsRng;
        let host_key =
            russh::keys::PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519)
                .expect("key generation should not fail");

        Arc::new(ProxyContext {
            upstream_addr: "127.0.0.1:2222".to_string(),
            host_key,
            authorized: Arc::new(AuthorizedKeys::default()),
            bans: BanList::new(),
            backoff: BackoffList::new(),
            agent_socket: None,
            upstream_key: None,
        })
    }

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 50412)
    }

    fn test_handler(peer: Option<SocketAddr>) -> ProxyHandler {
        ProxyHandler::new(peer, test_ctx(), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_handler_initial_state() {
        let handler = test_handler(Some(test_addr()));

        assert!(!handler.is_authenticated());
        assert!(handler.username().is_none());
        assert!(handler.client_key_bytes().is_none());
        assert!(handler.channels.is_empty());
    }

    #[test]
    fn test_peer_key_includes_port() {
        let handler = test_handler(Some(test_addr()));
        assert_eq!(handler.peer_key(), "127.0.0.1:50412");
    }

    #[test]
    fn test_peer_key_unknown() {
        let handler = test_handler(None);
        assert_eq!(handler.peer_key(), "unknown");
    }

    #[test]
    fn test_authed_flag_is_shared() {
        let authed = Arc::new(AtomicBool::new(false));
        let handler = ProxyHandler::new(Some(test_addr()), test_ctx(), Arc::clone(&authed));

        authed.store(true, Ordering::Relaxed);
        assert!(handler.is_authenticated());
    }
}
