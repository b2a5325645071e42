//! Ambient credential resolution
//!
//! When the caller asks for the "system" identity and the CLI agent is not
//! installed, the network transport needs a secret from somewhere. The
//! order is:
//!
//! 1. the OAuth identity the CLI agent stores after login (macOS keychain,
//!    else `~/.claude/.credentials.json`), if it is not about to expire
//! 2. `ANTHROPIC_API_KEY`, then `CLAUDE_API_KEY`
//! 3. nothing, which leaves the agent unconfigured
//!
//! Both lookups go through [`CredentialSources`] so tests can resolve
//! without touching the real environment.

use crate::config::Credentials;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

/// Keychain service name under which the CLI agent stores its login
pub const KEYCHAIN_SERVICE: &str = "Claude Code-credentials";

/// Environment variables consulted after the stored identity, in order
pub const API_KEY_VARS: [&str; 2] = ["ANTHROPIC_API_KEY", "CLAUDE_API_KEY"];

/// An identity is treated as expired this long before its real expiry
pub const EXPIRY_MARGIN_MS: i64 = 5 * 60 * 1000;

/// OAuth identity stored by the CLI agent
#[derive(Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Expiry in milliseconds since the epoch; 0 means no expiry
    pub expires_at_ms: i64,
    pub subscription_type: Option<String>,
    pub scopes: Vec<String>,
}

impl fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("access_token", &"***")
            .field("expires_at_ms", &self.expires_at_ms)
            .field("subscription_type", &self.subscription_type)
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[derive(Deserialize)]
struct StoredCredentials {
    #[serde(rename = "claudeAiOauth")]
    oauth: Option<StoredOAuth>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredOAuth {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    subscription_type: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
}

impl AgentIdentity {
    /// Parses the stored credentials document. `Ok(None)` when it holds no
    /// OAuth identity or the token is empty.
    pub fn from_json(document: &str) -> Result<Option<Self>> {
        let stored: StoredCredentials = serde_json::from_str(document)?;
        Ok(stored
            .oauth
            .filter(|o| !o.access_token.is_empty())
            .map(|o| Self {
                access_token: o.access_token,
                refresh_token: o.refresh_token,
                expires_at_ms: o.expires_at.unwrap_or(0),
                subscription_type: o.subscription_type,
                scopes: o.scopes,
            }))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at_ms != 0 && now.timestamp_millis() + EXPIRY_MARGIN_MS >= self.expires_at_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

type IdentityLookup = Box<dyn Fn() -> Option<String> + Send + Sync>;
type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Where ambient credentials are looked up
pub struct CredentialSources {
    identity: IdentityLookup,
    env: EnvLookup,
}

impl fmt::Debug for CredentialSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSources").finish_non_exhaustive()
    }
}

impl Default for CredentialSources {
    fn default() -> Self {
        Self::system()
    }
}

impl CredentialSources {
    /// The real keychain/credentials file and process environment
    pub fn system() -> Self {
        Self {
            identity: Box::new(read_stored_identity),
            env: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Custom lookups; `identity` returns the raw stored JSON document
    pub fn new<I, E>(identity: I, env: E) -> Self
    where
        I: Fn() -> Option<String> + Send + Sync + 'static,
        E: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            identity: Box::new(identity),
            env: Box::new(env),
        }
    }

    /// Sources that never find anything
    pub fn empty() -> Self {
        Self::new(|| None, |_| None)
    }

    /// Resolves the ambient identity. Returns unconfigured credentials when
    /// every source comes up empty.
    pub fn resolve(&self) -> Credentials {
        self.resolve_at(Utc::now())
    }

    pub fn resolve_at(&self, now: DateTime<Utc>) -> Credentials {
        if let Some(document) = (self.identity)() {
            match AgentIdentity::from_json(&document) {
                Ok(Some(identity)) if !identity.is_expired_at(now) => {
                    debug!(subscription = ?identity.subscription_type, "using stored agent identity");
                    return Credentials::oauth(identity.access_token);
                }
                Ok(Some(_)) => debug!("stored agent identity is expired or about to expire"),
                Ok(None) => debug!("stored credentials hold no agent identity"),
                Err(e) => debug!(error = %e, "stored credentials are unreadable"),
            }
        }

        for name in API_KEY_VARS {
            if let Some(key) = (self.env)(name).filter(|k| !k.is_empty()) {
                debug!(source = name, "using API key from environment");
                return Credentials::api_key(key);
            }
        }

        Credentials::default()
    }
}

/// Reads the stored identity document: keychain first on macOS, then the
/// credentials file in the home directory.
fn read_stored_identity() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("security")
            .args(["find-generic-password", "-s", KEYCHAIN_SERVICE, "-w"])
            .output()
            .ok();
        if let Some(output) = output.filter(|o| o.status.success()) {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }

    let path = dirs::home_dir()?.join(".claude").join(".credentials.json");
    std::fs::read_to_string(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const NOW_MS: i64 = 1_750_000_000_000;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(NOW_MS).unwrap()
    }

    fn document(expires_at: i64) -> String {
        serde_json::json!({
            "claudeAiOauth": {
                "accessToken": "oauth-token",
                "refreshToken": "refresh",
                "expiresAt": expires_at,
                "subscriptionType": "pro",
                "scopes": ["user:inference"]
            }
        })
        .to_string()
    }

    #[test]
    fn test_parse_identity() {
        let identity = AgentIdentity::from_json(&document(123)).unwrap().unwrap();
        assert_eq!(identity.access_token, "oauth-token");
        assert_eq!(identity.expires_at_ms, 123);
        assert_eq!(identity.subscription_type.as_deref(), Some("pro"));
        assert_eq!(identity.scopes, vec!["user:inference"]);
        assert!(!format!("{identity:?}").contains("oauth-token"));
    }

    #[test]
    fn test_document_without_identity() {
        assert!(AgentIdentity::from_json("{}").unwrap().is_none());
        assert!(AgentIdentity::from_json("not json").is_err());
    }

    #[test]
    fn test_expiry_margin() {
        let soon = AgentIdentity::from_json(&document(NOW_MS + EXPIRY_MARGIN_MS - 1))
            .unwrap()
            .unwrap();
        assert!(soon.is_expired_at(now()));

        let later = AgentIdentity::from_json(&document(NOW_MS + EXPIRY_MARGIN_MS + 60_000))
            .unwrap()
            .unwrap();
        assert!(!later.is_expired_at(now()));

        let never = AgentIdentity::from_json(&document(0)).unwrap().unwrap();
        assert!(!never.is_expired_at(now()));
    }

    #[test]
    fn test_resolve_prefers_valid_identity() {
        let sources = CredentialSources::new(
            || Some(document(0)),
            |_| Some("sk-env".to_string()),
        );
        assert_eq!(sources.resolve_at(now()), Credentials::oauth("oauth-token"));
    }

    #[test]
    fn test_resolve_skips_expired_identity() {
        let sources = CredentialSources::new(
            || Some(document(NOW_MS)),
            |name| (name == "ANTHROPIC_API_KEY").then(|| "sk-env".to_string()),
        );
        assert_eq!(sources.resolve_at(now()), Credentials::api_key("sk-env"));
    }

    #[test]
    fn test_resolve_env_order() {
        let sources = CredentialSources::new(
            || None,
            |name| match name {
                "ANTHROPIC_API_KEY" => Some(String::new()),
                "CLAUDE_API_KEY" => Some("sk-second".to_string()),
                _ => None,
            },
        );
        assert_eq!(sources.resolve_at(now()), Credentials::api_key("sk-second"));
    }

    #[test]
    fn test_resolve_nothing_found() {
        let creds = CredentialSources::empty().resolve_at(now());
        assert!(!creds.is_configured());
    }
}
