//! Konfiguration des Call-Cores
//!
//! Defaults für Polling, Klingel-Timeout und ICE Server, optional
//! überschrieben durch Umgebungsvariablen.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Ein STUN/TURN Eintrag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Öffentliche STUN Server (kein TURN-Relay, symmetrisches NAT bleibt eine Lücke)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// API-Basis inklusive `/api` Präfix
    pub api_base_url: String,
    /// ID des lokalen Benutzers (für das Ausfiltern eigener Candidates)
    pub user_id: String,
    pub auth_token: Option<String>,
    #[serde(with = "millis")]
    pub negotiating_poll_interval: Duration,
    #[serde(with = "millis")]
    pub connected_poll_interval: Duration,
    #[serde(with = "millis")]
    pub incoming_poll_interval: Duration,
    #[serde(with = "secs")]
    pub ring_timeout: Duration,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8001/api".to_string(),
            user_id: String::new(),
            auth_token: None,
            negotiating_poll_interval: Duration::from_millis(500),
            connected_poll_interval: Duration::from_millis(1000),
            incoming_poll_interval: Duration::from_millis(1000),
            ring_timeout: Duration::from_secs(45),
            request_timeout: Duration::from_secs(10),
            ice_servers: default_ice_servers(),
        }
    }
}

impl CallConfig {
    /// Defaults plus Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Wie `from_env`, aber mit beliebiger Quelle (Tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL").filter(|v| !v.trim().is_empty()) {
            config.api_base_url = url.trim().to_string();
        }
        if let Some(user_id) = lookup("CALL_USER_ID") {
            config.user_id = user_id;
        }
        if let Some(token) = lookup("CALL_AUTH_TOKEN").filter(|v| !v.is_empty()) {
            config.auth_token = Some(token);
        }
        if let Some(ms) = parse_u64(&lookup, "CALL_POLL_INTERVAL_MS")? {
            config.negotiating_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "CALL_CONNECTED_POLL_INTERVAL_MS")? {
            config.connected_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, "CALL_RING_TIMEOUT_SECS")? {
            config.ring_timeout = Duration::from_secs(secs);
        }
        if let Some(urls) = lookup("CALL_STUN_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if !urls.is_empty() {
                config.ice_servers = vec![IceServerConfig {
                    urls,
                    username: String::new(),
                    credential: String::new(),
                }];
            }
        }

        Ok(config)
    }
}

fn parse_u64<F>(lookup: &F, name: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidValue { name, value }),
            Ok(n) => Ok(Some(n)),
        },
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

// ============================================================================
// TESTS
// ============================================================================
