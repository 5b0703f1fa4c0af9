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

//! Brute-force-quarantining front-door proxy for SSH.
//!
//! The proxy sits between untrusted clients and a trusted upstream sshd.
//! It terminates the SSH handshake at the edge against an allow-list of
//! public keys, quarantines addresses that show up in the host auth log
//! with repeated password failures, and forwards accepted session
//! channels to the upstream authenticated as the client.

pub mod auth;
pub mod banlist;
pub mod proxy;
pub mod utils;
pub mod watcher;

pub use auth::AuthorizedKeys;
pub use banlist::{BackoffList, BanList};
pub use proxy::{ProxyContext, ProxyServer};
pub use watcher::LogWatcher;
