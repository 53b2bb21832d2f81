// Copyright 2023 Google LLC
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

//! Remote endpoint parsing and the derived hashes used to name the SSH
//! control socket and the per-host state file / IPC socket (spec.md 4.1,
//! 4.9, 6).

use std::fmt;

use anyhow::anyhow;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

const DEFAULT_SSH_PORT: u16 = 22;

/// A parsed `ssh://user@host[:port]` / `user@host[:port]` remote
/// endpoint. IPv6 hosts must be bracketed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// True if `host` was written with brackets in the source string
    /// (i.e. it is an IPv6 literal). Preserved so `to_url` round-trips.
    bracketed: bool,
}

impl RemoteEndpoint {
    /// Parse any of the forms documented in spec.md 6:
    /// `ssh://user@host`, `ssh://user@host:port`, `user@host:port`,
    /// with IPv6 hosts written as `[addr]`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let rest = s.strip_prefix("ssh://").unwrap_or(s);

        let (user, hostport) = rest
            .split_once('@')
            .ok_or_else(|| anyhow!("endpoint '{}' is missing a 'user@' part", s))?;
        if user.is_empty() {
            return Err(anyhow!("endpoint '{}' has an empty user", s));
        }

        let (host, port, bracketed) = if let Some(rest) = hostport.strip_prefix('[') {
            let (addr, after) = rest
                .split_once(']')
                .ok_or_else(|| anyhow!("endpoint '{}' has an unterminated '[' for IPv6", s))?;
            if addr.is_empty() {
                return Err(anyhow!("endpoint '{}' has an empty bracketed host", s));
            }
            let port = match after.strip_prefix(':') {
                Some(p) => parse_port(p, s)?,
                None if after.is_empty() => DEFAULT_SSH_PORT,
                None => {
                    return Err(anyhow!(
                        "endpoint '{}' has trailing garbage after ']': '{}'",
                        s,
                        after
                    ))
                }
            };
            (addr.to_string(), port, true)
        } else if hostport.contains(':') && looks_like_unbracketed_ipv6(hostport) {
            return Err(anyhow!(
                "endpoint '{}' has an unbracketed IPv6 host; wrap it in brackets, e.g. \
                 'user@[::1]:2222'",
                s
            ));
        } else if let Some((host, port)) = hostport.rsplit_once(':') {
            (host.to_string(), parse_port(port, s)?, false)
        } else {
            (hostport.to_string(), DEFAULT_SSH_PORT, false)
        };

        if host.is_empty() {
            return Err(anyhow!("endpoint '{}' has an empty host", s));
        }

        Ok(RemoteEndpoint { user: user.to_string(), host, port, bracketed })
    }

    /// The canonical string form used for hashing and for display. This
    /// is what the control-path and state-file hashes are derived from,
    /// so it must be stable for equivalent inputs.
    pub fn canonical(&self) -> String {
        if self.bracketed {
            format!("{}@[{}]:{}", self.user, self.host, self.port)
        } else {
            format!("{}@{}:{}", self.user, self.host, self.port)
        }
    }

    pub fn to_url(&self) -> String {
        format!("ssh://{}", self.canonical())
    }

    /// A short, collision-resistant hash of the canonical endpoint,
    /// shared by the control-socket path and the state-file/IPC-socket
    /// names so that restarts reuse the same paths (spec.md 4.1, 6).
    ///
    /// First 12 characters of the url-safe-no-pad base64 encoding of the
    /// SHA-256 digest, as spec.md 4.9 specifies for the state file name.
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        let encoded = URL_SAFE_NO_PAD.encode(digest);
        encoded.chars().take(12).collect()
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_url())
    }
}

fn parse_port(s: &str, whole: &str) -> anyhow::Result<u16> {
    s.parse::<u16>()
        .map_err(|_| anyhow!("endpoint '{}' has an invalid port '{}'", whole, s))
}

/// Heuristic: more than one ':' outside of a trailing `:port` means this
/// is an IPv6 literal that the caller forgot to bracket. A single ':'
/// is just `host:port`.
fn looks_like_unbracketed_ipv6(hostport: &str) -> bool {
    hostport.matches(':').count() > 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_form_with_default_port() {
        let e = RemoteEndpoint::parse("ssh://dev@build-box").unwrap();
        assert_eq!(e.user, "dev");
        assert_eq!(e.host, "build-box");
        assert_eq!(e.port, 22);
    }

    #[test]
    fn parses_scheme_form_with_explicit_port() {
        let e = RemoteEndpoint::parse("ssh://dev@build-box:2222").unwrap();
        assert_eq!(e.port, 2222);
    }

    #[test]
    fn parses_bare_form() {
        let e = RemoteEndpoint::parse("dev@build-box:2222").unwrap();
        assert_eq!(e.user, "dev");
        assert_eq!(e.host, "build-box");
        assert_eq!(e.port, 2222);
    }

    #[test]
    fn parses_bracketed_ipv6_with_port() {
        let e = RemoteEndpoint::parse("ssh://dev@[::1]:2222").unwrap();
        assert_eq!(e.host, "::1");
        assert_eq!(e.port, 2222);
    }

    #[test]
    fn parses_bracketed_ipv6_without_port() {
        let e = RemoteEndpoint::parse("dev@[fe80::1]").unwrap();
        assert_eq!(e.host, "fe80::1");
        assert_eq!(e.port, 22);
    }

    #[test]
    fn rejects_unbracketed_ipv6() {
        let err = RemoteEndpoint::parse("dev@::1:2222").unwrap_err();
        assert!(err.to_string().contains("unbracketed IPv6"));
    }

    #[test]
    fn rejects_missing_user() {
        assert!(RemoteEndpoint::parse("build-box").is_err());
    }

    #[test]
    fn parse_format_parse_round_trips() {
        for s in [
            "ssh://dev@build-box",
            "ssh://dev@build-box:2222",
            "dev@build-box:2222",
            "ssh://dev@[::1]:2222",
        ] {
            let e1 = RemoteEndpoint::parse(s).unwrap();
            let e2 = RemoteEndpoint::parse(&e1.to_url()).unwrap();
            assert_eq!(e1, e2);
        }
    }

    #[test]
    fn hash_is_deterministic_and_short() {
        let e1 = RemoteEndpoint::parse("ssh://dev@build-box:2222").unwrap();
        let e2 = RemoteEndpoint::parse("dev@build-box:2222").unwrap();
        assert_eq!(e1.hash(), e2.hash());
        assert_eq!(e1.hash().len(), 12);
    }

    #[test]
    fn hash_differs_across_endpoints() {
        let e1 = RemoteEndpoint::parse("ssh://dev@build-box-a").unwrap();
        let e2 = RemoteEndpoint::parse("ssh://dev@build-box-b").unwrap();
        assert_ne!(e1.hash(), e2.hash());
    }
}
