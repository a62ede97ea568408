//! Konfiguration
//!
//! Alle Einstellungen kommen aus Umgebungsvariablen mit sinnvollen
//! Defaults, damit der Client ohne Config-Datei startet.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Der einzige Voice-Channel der Spielwelt
pub const DEFAULT_CHANNEL: &str = "gameWorld";

/// Standard Signaling-Server
pub const DEFAULT_SIGNALING_URL: &str = "https://devverse-signaling.workers.dev";

/// Heartbeat-Intervall für den Presence-Eintrag
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// Ab diesem Alter gilt ein Presence-Eintrag als offline
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(30);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Could not determine app data directory")]
    NoDataDir,
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

/// Welcher Call-Transport verwendet wird
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Echte Peer-to-Peer Anrufe über WebRTC
    WebRtc,
    /// Prozessinterne Vermittlung (Demo, Tests)
    Loopback,
}

/// Optionaler TURN-Server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Gesamte Client-Konfiguration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub channel: String,
    pub signaling_url: Url,
    pub db_path: PathBuf,
    pub renew_interval: Duration,
    pub freshness_window: Duration,
    pub turn: Option<TurnServer>,
    pub transport: TransportKind,
}

impl AppConfig {
    /// Liest die Konfiguration aus der Prozess-Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Liest die Konfiguration über eine beliebige Lookup-Funktion
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let user_id = get("DEVVERSE_USER_ID").ok_or(ConfigError::Missing("DEVVERSE_USER_ID"))?;
        let display_name = get("DEVVERSE_DISPLAY_NAME").unwrap_or_else(|| user_id.clone());

        let signaling_raw =
            get("SIGNALING_URL").unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        let signaling_url = Url::parse(&signaling_raw).map_err(|e| ConfigError::Invalid {
            key: "SIGNALING_URL",
            reason: e.to_string(),
        })?;

        let db_path = match get("DEVVERSE_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        let renew_interval = parse_secs(get("DEVVERSE_RENEW_SECS"), "DEVVERSE_RENEW_SECS")?
            .unwrap_or(DEFAULT_RENEW_INTERVAL);
        let freshness_window =
            parse_secs(get("DEVVERSE_FRESHNESS_SECS"), "DEVVERSE_FRESHNESS_SECS")?
                .unwrap_or(DEFAULT_FRESHNESS_WINDOW);

        // Ein Fenster kürzer als das Intervall würde jeden Peer flackern lassen
        if freshness_window < renew_interval {
            return Err(ConfigError::Invalid {
                key: "DEVVERSE_FRESHNESS_SECS",
                reason: "freshness window must not be shorter than the renew interval"
                    .to_string(),
            });
        }

        let turn = match get("DEVVERSE_TURN_URL") {
            Some(url) => Some(TurnServer {
                url,
                username: get("DEVVERSE_TURN_USERNAME").unwrap_or_default(),
                credential: get("DEVVERSE_TURN_CREDENTIAL").unwrap_or_default(),
            }),
            None => None,
        };

        let transport = match get("DEVVERSE_TRANSPORT").as_deref() {
            None | Some("webrtc") => TransportKind::WebRtc,
            Some("loopback") => TransportKind::Loopback,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "DEVVERSE_TRANSPORT",
                    reason: format!("unknown transport '{}'", other),
                })
            }
        };

        Ok(Self {
            user_id,
            display_name,
            avatar_url: get("DEVVERSE_AVATAR_URL"),
            channel: get("DEVVERSE_CHANNEL").unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            signaling_url,
            db_path,
            renew_interval,
            freshness_window,
            turn,
            transport,
        })
    }
}

/// Parst eine Sekundenangabe (> 0)
fn parse_secs(raw: Option<String>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("'{}' is not a number of seconds", raw),
    })?;

    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".to_string(),
        });
    }

    Ok(Some(Duration::from_secs(secs)))
}

/// Pfad zur lokalen Datenbank im App-Datenverzeichnis
fn default_db_path() -> Result<PathBuf, ConfigError> {
    let proj_dirs = directories::ProjectDirs::from("dev", "devverse", "devverse-voice")
        .ok_or(ConfigError::NoDataDir)?;

    let mut path = proj_dirs.data_dir().to_path_buf();
    path.push("devverse.db");
    Ok(path)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[
            ("DEVVERSE_USER_ID", "alice"),
            ("DEVVERSE_DB_PATH", "/tmp/devverse-test.db"),
        ])
        .unwrap();

        assert_eq!(config.user_id, "alice");
        assert_eq!(config.display_name, "alice");
        assert_eq!(config.channel, DEFAULT_CHANNEL);
        assert_eq!(config.renew_interval, DEFAULT_RENEW_INTERVAL);
        assert_eq!(config.freshness_window, DEFAULT_FRESHNESS_WINDOW);
        assert_eq!(config.transport, TransportKind::WebRtc);
        assert!(config.turn.is_none());
    }

    #[test]
    fn test_missing_user_id() {
        let err = config_from(&[("DEVVERSE_DB_PATH", "/tmp/x.db")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DEVVERSE_USER_ID")));
    }

    #[test]
    fn test_window_shorter_than_interval_rejected() {
        let err = config_from(&[
            ("DEVVERSE_USER_ID", "alice"),
            ("DEVVERSE_DB_PATH", "/tmp/x.db"),
            ("DEVVERSE_RENEW_SECS", "20"),
            ("DEVVERSE_FRESHNESS_SECS", "5"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_loopback_and_turn() {
        let config = config_from(&[
            ("DEVVERSE_USER_ID", "bob"),
            ("DEVVERSE_DB_PATH", "/tmp/x.db"),
            ("DEVVERSE_TRANSPORT", "loopback"),
            ("DEVVERSE_TURN_URL", "turn:turn.example.com:3478"),
            ("DEVVERSE_TURN_USERNAME", "u"),
        ])
        .unwrap();

        assert_eq!(config.transport, TransportKind::Loopback);
        let turn = config.turn.unwrap();
        assert_eq!(turn.username, "u");
        assert_eq!(turn.credential, "");
    }

    #[test]
    fn test_invalid_signaling_url() {
        let err = config_from(&[
            ("DEVVERSE_USER_ID", "alice"),
            ("DEVVERSE_DB_PATH", "/tmp/x.db"),
            ("SIGNALING_URL", "not a url"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SIGNALING_URL", .. }));
    }
}
