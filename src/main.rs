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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use sshproxy::banlist::{BackoffList, BanList};
use sshproxy::utils::logging;
use sshproxy::{auth, AuthorizedKeys, LogWatcher, ProxyContext, ProxyServer};

const DEFAULT_AUTH_LOG: &str = "/var/log/auth.log";

/// Brute-force-quarantining front-door proxy for SSH
#[derive(Parser, Debug)]
#[command(name = "sshproxy")]
#[command(version)]
#[command(about = "Brute-force-quarantining front-door proxy for SSH", long_about = None)]
struct Cli {
    /// Address to listen on (host:port)
    listen_addr: String,

    /// Upstream SSH server to forward sessions to (host:port)
    upstream_addr: String,

    /// Host private key presented to clients
    #[arg(
        long,
        env = "SSHPROXY_HOST_KEY",
        value_name = "FILE",
        default_value = "ssh_host_ed25519_key"
    )]
    host_key: PathBuf,

    /// Public keys accepted at the proxy handshake
    #[arg(
        long,
        env = "SSHPROXY_AUTHORIZED_KEYS",
        value_name = "FILE",
        default_value = "authorized_keys"
    )]
    authorized_keys: PathBuf,

    /// Private key for upstream auth when no credential agent is available
    #[arg(long, env = "SSHPROXY_UPSTREAM_KEY", value_name = "FILE")]
    upstream_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging();

    let host_key = auth::load_host_key(&cli.host_key)?;

    let authorized = Arc::new(AuthorizedKeys::load(&cli.authorized_keys).await?);
    if authorized.is_empty() {
        tracing::warn!(
            path = %cli.authorized_keys.display(),
            "authorized keys file is empty, every handshake will be rejected"
        );
    }

    let upstream_key = match &cli.upstream_key {
        Some(path) => Some(Arc::new(
            auth::load_host_key(path).context("failed to load upstream key")?,
        )),
        None => None,
    };

    let agent_socket = std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from);
    if agent_socket.is_none() && upstream_key.is_none() {
        tracing::warn!(
            "no credential agent and no upstream key, session channels cannot be forwarded"
        );
    }

    let auth_log =
        std::env::var("SSHPROXY_AUTH_LOG").unwrap_or_else(|_| DEFAULT_AUTH_LOG.to_string());

    let bans = BanList::new();
    let backoff = BackoffList::new();

    tokio::spawn(LogWatcher::new(auth_log, bans.clone()).run());

    let server = ProxyServer::new(
        cli.listen_addr.clone(),
        ProxyContext {
            upstream_addr: cli.upstream_addr.clone(),
            host_key,
            authorized,
            bans,
            backoff,
            agent_socket,
            upstream_key,
        },
    );

    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_structure() {
        use clap::CommandFactory;

        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_requires_both_addresses() {
        assert!(Cli::try_parse_from(["sshproxy"]).is_err());
        assert!(Cli::try_parse_from(["sshproxy", ":2245"]).is_err());
        assert!(Cli::try_parse_from(["sshproxy", ":2245", "localhost:2222", "extra"]).is_err());
    }

    #[test]
    fn test_cli_positional_addresses() {
        let cli = Cli::try_parse_from(["sshproxy", ":2245", "localhost:2222"]).unwrap();

        assert_eq!(cli.listen_addr, ":2245");
        assert_eq!(cli.upstream_addr, "localhost:2222");
        assert_eq!(cli.host_key, PathBuf::from("ssh_host_ed25519_key"));
        assert_eq!(cli.authorized_keys, PathBuf::from("authorized_keys"));
        assert!(cli.upstream_key.is_none());
    }

    #[test]
    fn test_cli_key_flags() {
        let cli = Cli::try_parse_from([
            "sshproxy",
            ":2245",
            "localhost:2222",
            "--host-key",
            "/etc/sshproxy/host_key",
            "--authorized-keys",
            "/etc/sshproxy/authorized_keys",
            "--upstream-key",
            "/etc/sshproxy/upstream_key",
        ])
        .unwrap();

        assert_eq!(cli.host_key, PathBuf::from("/etc/sshproxy/host_key"));
        assert_eq!(
            cli.authorized_keys,
            PathBuf::from("/etc/sshproxy/authorized_keys")
        );
        assert_eq!(
            cli.upstream_key,
            Some(PathBuf::from("/etc/sshproxy/upstream_key"))
        );
    }
}
