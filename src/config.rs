#![forbid(unsafe_code)]

// Server configuration loaded from environment variables

use crate::engine::{CodecConfig, MediaKind};
use serde_json::json;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port the signaling server listens on
    pub port: u16,
    /// Maximum concurrent WebSocket connections
    pub max_connections: usize,
    /// Seconds of inactivity before a connection is dropped
    pub idle_timeout_secs: u64,
    /// Codecs advertised by every router
    pub codecs: Vec<CodecConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            max_connections: 1000,
            idle_timeout_secs: 300,
            codecs: default_codecs(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PORT", defaults.port),
            max_connections: env_parse("MAX_CONNECTIONS", defaults.max_connections),
            idle_timeout_secs: env_parse("IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs),
            codecs: defaults.codecs,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Baseline codec set: Opus for audio, VP8 for video with a 1 Mbps
/// starting bitrate hint.
pub fn default_codecs() -> Vec<CodecConfig> {
    vec![
        CodecConfig {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: serde_json::Value::Null,
        },
        CodecConfig {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({ "x-google-start-bitrate": 1000 }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.codecs.len(), 2);
        assert_eq!(config.codecs[0].kind, MediaKind::Audio);
        assert_eq!(config.codecs[1].kind, MediaKind::Video);
    }
}
