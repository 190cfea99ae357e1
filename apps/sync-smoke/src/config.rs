//! Environment-backed runtime configuration for `sync-smoke`.

use std::{env, fmt, sync::Arc, time::Duration};

use sync_core::{ConversationFilter, ConversationStatus, ReconnectPolicy, StatusFilter};
use sync_platform::{
    CredentialError, CredentialSource, StaticCredential, StoredCredential, TokenStore,
};
use sync_transport::DashboardConfig;
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_LIST_LIMIT: u32 = 100;

/// Runtime configuration used by the smoke runner.
#[derive(Clone, PartialEq)]
pub struct SmokeConfig {
    /// Base URL of the REST API.
    pub api_base: Url,
    /// Base URL of the push channels; derived from `api_base` when unset.
    pub ws_base: Url,
    pub token: Option<String>,
    /// Read the token from the OS keyring under this account; a
    /// `SUPPORTDESK_TOKEN` given alongside is saved there first.
    pub token_account: Option<String>,
    /// Open a transcript for this conversation as well.
    pub conversation_id: Option<String>,
    /// Send this text once the transcript is open.
    pub send_text: Option<String>,
    pub filter: ConversationFilter,
    pub poll_interval: Duration,
    pub list_limit: u32,
    pub reconnect: ReconnectPolicy,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_base = parse_url(
            "SUPPORTDESK_API_URL",
            optional_trimmed_env("SUPPORTDESK_API_URL", &mut lookup)
                .unwrap_or_else(|| DEFAULT_API_URL.to_owned()),
        )?;
        let ws_base = match optional_trimmed_env("SUPPORTDESK_WS_URL", &mut lookup) {
            Some(value) => parse_url("SUPPORTDESK_WS_URL", value)?,
            None => derive_ws_base(&api_base)?,
        };

        let token = optional_trimmed_env("SUPPORTDESK_TOKEN", &mut lookup);
        let token_account = optional_trimmed_env("SUPPORTDESK_TOKEN_ACCOUNT", &mut lookup);
        let conversation_id = optional_trimmed_env("SUPPORTDESK_CONVERSATION_ID", &mut lookup);
        let send_text = optional_trimmed_env("SUPPORTDESK_SEND_TEXT", &mut lookup);

        let status = match optional_trimmed_env("SUPPORTDESK_STATUS_FILTER", &mut lookup) {
            Some(value) => parse_status_filter(&value)?,
            None => StatusFilter::All,
        };
        let filter = ConversationFilter {
            status,
            agent_id: optional_trimmed_env("SUPPORTDESK_AGENT_ID", &mut lookup),
        };

        let poll_interval_ms = parse_u64_with_default(
            "SUPPORTDESK_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
            &mut lookup,
        )?;
        let list_limit =
            parse_u32_with_default("SUPPORTDESK_LIST_LIMIT", DEFAULT_LIST_LIMIT, &mut lookup)?;

        let defaults = ReconnectPolicy::default();
        let reconnect_base_ms = parse_u64_with_default(
            "SUPPORTDESK_RECONNECT_BASE_MS",
            defaults.base_delay_ms(),
            &mut lookup,
        )?;
        let reconnect_max_attempts = parse_u32_with_default(
            "SUPPORTDESK_RECONNECT_MAX_ATTEMPTS",
            defaults.max_attempts(),
            &mut lookup,
        )?;

        for (key, value) in [
            ("SUPPORTDESK_POLL_INTERVAL_MS", poll_interval_ms),
            ("SUPPORTDESK_LIST_LIMIT", u64::from(list_limit)),
            ("SUPPORTDESK_RECONNECT_BASE_MS", reconnect_base_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_owned(),
                    reason: "must be at least 1".to_owned(),
                });
            }
        }

        Ok(Self {
            api_base,
            ws_base,
            token,
            token_account,
            conversation_id,
            send_text,
            filter,
            poll_interval: Duration::from_millis(poll_interval_ms),
            list_limit,
            reconnect: ReconnectPolicy::new(reconnect_base_ms, reconnect_max_attempts),
        })
    }

    /// Credential for channels and REST calls, backed by `store` when a
    /// token account is configured.
    pub fn credentials<S>(&self, store: S) -> Result<Arc<dyn CredentialSource>, CredentialError>
    where
        S: TokenStore + 'static,
    {
        let Some(account) = &self.token_account else {
            return Ok(Arc::new(match &self.token {
                Some(token) => StaticCredential::new(token.clone()),
                None => StaticCredential::missing(),
            }));
        };
        let stored = StoredCredential::new(store, account.clone());
        if let Some(token) = &self.token {
            stored.save(token)?;
        }
        Ok(Arc::new(stored))
    }

    pub fn dashboard_config(&self) -> DashboardConfig {
        DashboardConfig {
            poll_interval: self.poll_interval,
            list_limit: Some(self.list_limit),
            filter: self.filter.clone(),
            ..DashboardConfig::default()
        }
    }
}

impl fmt::Debug for SmokeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmokeConfig")
            .field("api_base", &self.api_base.as_str())
            .field("ws_base", &self.ws_base.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_account", &self.token_account)
            .field("conversation_id", &self.conversation_id)
            .field("send_text", &self.send_text)
            .field("filter", &self.filter)
            .field("poll_interval", &self.poll_interval)
            .field("list_limit", &self.list_limit)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_url(key: &'static str, value: String) -> Result<Url, ConfigError> {
    Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn derive_ws_base(api_base: &Url) -> Result<Url, ConfigError> {
    let scheme = match api_base.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ConfigError::InvalidValue {
                key: "SUPPORTDESK_API_URL",
                value: api_base.to_string(),
                reason: format!("cannot derive a websocket URL from scheme '{other}'"),
            });
        }
    };
    let mut ws_base = api_base.clone();
    ws_base
        .set_scheme(scheme)
        .map_err(|()| ConfigError::InvalidValue {
            key: "SUPPORTDESK_API_URL",
            value: api_base.to_string(),
            reason: "cannot switch to a websocket scheme".to_owned(),
        })?;
    Ok(ws_base)
}

fn parse_status_filter(value: &str) -> Result<StatusFilter, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "all" => return Ok(StatusFilter::All),
        "open" => return Ok(StatusFilter::Open),
        _ => {}
    }
    let status = match value.to_ascii_uppercase().as_str() {
        "AI_ACTIVE" => ConversationStatus::AiActive,
        "NEEDS_HUMAN" => ConversationStatus::NeedsHuman,
        "HUMAN_ACTIVE" => ConversationStatus::HumanActive,
        "CLOSED" => ConversationStatus::Closed,
        _ => {
            return Err(ConfigError::InvalidValue {
                key: "SUPPORTDESK_STATUS_FILTER",
                value: value.to_owned(),
                reason: "expected all, open or a conversation status".to_owned(),
            });
        }
    };
    Ok(StatusFilter::Only(status))
}

fn parse_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_u32_with_default<F>(
    key: &'static str,
    default: u32,
    lookup: &mut F,
) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<u32>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use sync_platform::MemoryTokenStore;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_any_environment() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg.api_base.as_str(), "http://localhost:8000/");
        assert_eq!(cfg.ws_base.as_str(), "ws://localhost:8000/");
        assert_eq!(cfg.token, None);
        assert_eq!(cfg.filter, ConversationFilter::default());
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn derives_secure_ws_base_and_reads_session_fields() {
        let cfg = config_from_pairs(&[
            ("SUPPORTDESK_API_URL", "https://desk.example.com"),
            ("SUPPORTDESK_TOKEN", "  tok-123  "),
            ("SUPPORTDESK_CONVERSATION_ID", "c42"),
            ("SUPPORTDESK_SEND_TEXT", "smoke hello"),
            ("SUPPORTDESK_STATUS_FILTER", "needs_human"),
            ("SUPPORTDESK_AGENT_ID", "agent-9"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.ws_base.as_str(), "wss://desk.example.com/");
        assert_eq!(cfg.token.as_deref(), Some("tok-123"));
        assert_eq!(cfg.conversation_id.as_deref(), Some("c42"));
        assert_eq!(
            cfg.filter.status,
            StatusFilter::Only(ConversationStatus::NeedsHuman)
        );
        assert_eq!(cfg.dashboard_config().filter.agent_id.as_deref(), Some("agent-9"));
    }

    #[test]
    fn explicit_ws_base_wins() {
        let cfg = config_from_pairs(&[
            ("SUPPORTDESK_API_URL", "https://api.example.com"),
            ("SUPPORTDESK_WS_URL", "wss://push.example.com"),
        ])
        .expect("config should parse");
        assert_eq!(cfg.ws_base.as_str(), "wss://push.example.com/");
    }

    #[test]
    fn debug_output_redacts_token() {
        let cfg = config_from_pairs(&[("SUPPORTDESK_TOKEN", "very-secret")]).expect("config");
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn plain_token_is_used_without_an_account() {
        let cfg = config_from_pairs(&[("SUPPORTDESK_TOKEN", "tok-1")]).expect("config");
        let store = MemoryTokenStore::default();
        let credentials = cfg.credentials(store.clone()).expect("credentials");
        assert_eq!(credentials.credential().as_deref(), Some("tok-1"));
        assert_eq!(store.load("tok-1"), Ok(None));
    }

    #[test]
    fn token_account_saves_and_reads_through_store() {
        let store = MemoryTokenStore::default();
        let cfg = config_from_pairs(&[
            ("SUPPORTDESK_TOKEN", "tok-2"),
            ("SUPPORTDESK_TOKEN_ACCOUNT", "agent-9"),
        ])
        .expect("config");
        cfg.credentials(store.clone()).expect("credentials");
        assert_eq!(store.load("agent-9"), Ok(Some("tok-2".to_owned())));

        let later = config_from_pairs(&[("SUPPORTDESK_TOKEN_ACCOUNT", "agent-9")]).expect("config");
        let credentials = later.credentials(store).expect("credentials");
        assert_eq!(credentials.credential().as_deref(), Some("tok-2"));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = config_from_pairs(&[("SUPPORTDESK_LIST_LIMIT", "abc")])
            .expect_err("invalid limit should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "SUPPORTDESK_LIST_LIMIT",
                ..
            }
        ));

        let err = config_from_pairs(&[("SUPPORTDESK_POLL_INTERVAL_MS", "0")])
            .expect_err("zero interval should fail");
        assert!(err.to_string().contains("must be at least 1"));

        let err = config_from_pairs(&[("SUPPORTDESK_STATUS_FILTER", "sleeping")])
            .expect_err("unknown status should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "SUPPORTDESK_STATUS_FILTER",
                ..
            }
        ));
    }
}
