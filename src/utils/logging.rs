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

use tracing_subscriber::EnvFilter;

/// Initialize logging from `SSHPROXY_LOG_LEVEL`.
///
/// Accepted values are `debug`, `info`, `warn`, and `error`; anything
/// else (including an unset variable) falls back to `info`.
pub fn init_logging() {
    let level = std::env::var("SSHPROXY_LOG_LEVEL").unwrap_or_default();
    let filter = EnvFilter::new(format!("sshproxy={}", level_or_default(&level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn level_or_default(level: &str) -> &str {
    match level {
        "debug" | "info" | "warn" | "error" => level,
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_levels_pass_through() {
        assert_eq!(level_or_default("debug"), "debug");
        assert_eq!(level_or_default("info"), "info");
        assert_eq!(level_or_default("warn"), "warn");
        assert_eq!(level_or_default("error"), "error");
    }

    #[test]
    fn test_unknown_levels_fall_back() {
        assert_eq!(level_or_default(""), "info");
        assert_eq!(level_or_default("trace"), "info");
        assert_eq!(level_or_default("INFO"), "info");
    }
}
