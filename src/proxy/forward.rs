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

//! Per-channel forwarding between an accepted client channel and its
//! upstream counterpart.
//!
//! Each forwarded channel runs one pump task that owns the upstream
//! channel half. Traffic from the client arrives as [`ForwardCmd`]s over
//! an unbounded pipe fed by the connection handler; traffic from the
//! upstream arrives on the channel's message stream. The task relays both
//! directions until either side ends or the handler cancels it, then
//! closes whichever half is still open. Byte order is preserved within
//! each direction; the two directions are independent.

use std::sync::Arc;

use russh::client::Handle as ClientHandle;
use russh::server::Handle as ServerHandle;
use russh::{ChannelId, ChannelMsg, Pty};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::upstream::{self, UpstreamAuth, UpstreamError, UpstreamHandler};

/// Session-scoped slot holding the upstream connection.
///
/// The first pump to run dials and fills the slot; later channels on the
/// same session reuse it. A failed dial leaves the slot empty so the next
/// channel open retries.
pub(crate) type UpstreamSlot = Arc<Mutex<Option<Arc<ClientHandle<UpstreamHandler>>>>>;

/// Client-side traffic relayed into the upstream channel.
#[derive(Debug)]
pub(crate) enum ForwardCmd {
    Data(Vec<u8>),
    Exec(Vec<u8>),
    Shell,
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Env {
        name: String,
        value: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Eof,
}

/// Everything a pump needs to bring up its upstream half.
pub(crate) struct ForwardTarget {
    pub addr: String,
    pub user: String,
    pub auth: Option<UpstreamAuth>,
}

/// Run the pump for one forwarded channel.
///
/// Resolves the session's upstream connection (dialing on first use),
/// opens a matching session channel, then relays in both directions until
/// end-of-stream, error, or cancellation. All failure paths close the
/// client channel; none of them touch the rest of the session.
pub(crate) async fn run(
    handle: ServerHandle,
    id: ChannelId,
    slot: UpstreamSlot,
    target: ForwardTarget,
    mut cmds: UnboundedReceiver<ForwardCmd>,
    cancel: CancellationToken,
) {
    let client = match resolve_client(&slot, &target).await {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(
                channel = ?id,
                upstream = %target.addr,
                error = %e,
                "upstream unavailable, closing channel"
            );
            let _ = handle.close(id).await;
            return;
        }
    };

    let mut channel = match client.channel_open_session().await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(
                channel = ?id,
                upstream = %target.addr,
                error = %e,
                "failed to open upstream channel"
            );
            let _ = handle.close(id).await;
            return;
        }
    };

    tracing::debug!(channel = ?id, upstream = %target.addr, "forwarding channel");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = channel.close().await;
                break;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if handle.data(id, data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if handle.extended_data(id, ext, data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    let _ = handle.exit_status_request(id, exit_status).await;
                }
                Some(ChannelMsg::Eof) => {
                    let _ = handle.eof(id).await;
                }
                Some(ChannelMsg::Close) => {
                    let _ = handle.close(id).await;
                    break;
                }
                Some(other) => {
                    // Remaining upstream messages (window adjusts, request
                    // replies, exit signals) are drained here.
                    tracing::trace!(channel = ?id, msg = ?other, "discarding upstream message");
                }
                None => {
                    let _ = handle.close(id).await;
                    break;
                }
            },
            cmd = cmds.recv() => match cmd {
                Some(cmd) => {
                    if apply_cmd(&channel, cmd).await.is_err() {
                        let _ = handle.close(id).await;
                        break;
                    }
                }
                None => {
                    // Handler side is gone; unwind the upstream half.
                    let _ = channel.close().await;
                    break;
                }
            },
        }
    }

    tracing::debug!(channel = ?id, "forwarding ended");
}

/// Apply one client-side command to the upstream channel.
async fn apply_cmd(
    channel: &russh::Channel<russh::client::Msg>,
    cmd: ForwardCmd,
) -> Result<(), russh::Error> {
    match cmd {
        ForwardCmd::Data(bytes) => channel.data(&bytes[..]).await,
        ForwardCmd::Exec(command) => channel.exec(false, command).await,
        ForwardCmd::Shell => channel.request_shell(false).await,
        ForwardCmd::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            channel
                .request_pty(
                    false,
                    &term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    &modes,
                )
                .await
        }
        ForwardCmd::Env { name, value } => channel.set_env(false, name, value).await,
        ForwardCmd::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            channel
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
        }
        ForwardCmd::Eof => channel.eof().await,
    }
}

/// Get the session's upstream connection, dialing if necessary.
async fn resolve_client(
    slot: &UpstreamSlot,
    target: &ForwardTarget,
) -> Result<Arc<ClientHandle<UpstreamHandler>>, UpstreamError> {
    let mut guard = slot.lock().await;

    if let Some(client) = guard.as_ref() {
        if !client.is_closed() {
            return Ok(Arc::clone(client));
        }
        // Stale handle from a dropped upstream connection; redial.
        *guard = None;
    }

    let auth = target.auth.clone().ok_or(UpstreamError::NoCredential)?;
    let client = Arc::new(upstream::dial(&target.addr, &target.user, &auth).await?);
    *guard = Some(Arc::clone(&client));
    Ok(client)
}
