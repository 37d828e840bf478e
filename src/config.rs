//! Player configuration.
//!
//! Settings come from three places, later ones overriding earlier ones in
//! the command-line player: built-in defaults, the environment, and an
//! optional JSON file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Client name used when neither a configured name nor the executable name is available.
pub const DEFAULT_CLIENT_NAME: &str = "MIDI Player";

/// Environment variable naming the transport client.
pub const ENV_APP_NAME: &str = "MIDIPLAY_APP_NAME";
/// Environment variable holding an explicit output address.
pub const ENV_OUTPUT_PORTS: &str = "ALSA_OUTPUT_PORTS";
/// Environment variable disabling automatic port connection.
pub const ENV_NO_CONNECT: &str = "MIDIPLAY_NO_CONNECT_PORTS";
/// Environment variable enabling pause emulation.
pub const ENV_ALLOW_PAUSE: &str = "MIDIPLAY_ALLOW_PAUSE";

/// How a song connects to the transport and what it allows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Transport client name; defaults to the executable name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    /// Address to connect to before falling back to discovery, e.g. "128:0".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ports: Option<String>,

    /// Leave the output unconnected; events go to whoever subscribes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_connect: Option<bool>,

    /// Enable pause emulation.
    ///
    /// Off when unset: pausing mutes with a volume message that not every
    /// receiver honours, and a frozen queue can leave notes hanging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_pause: Option<bool>,
}

impl PlayerConfig {
    /// Reads settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through an arbitrary variable lookup.
    ///
    /// Empty values count as unset. Booleans that do not parse keep their
    /// default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let flag = |key: &str| get(key).and_then(|value| parse_bool(&value));

        Self {
            client_name: get(ENV_APP_NAME),
            output_ports: get(ENV_OUTPUT_PORTS),
            no_connect: flag(ENV_NO_CONNECT),
            allow_pause: flag(ENV_ALLOW_PAUSE),
        }
    }

    /// Loads settings from a JSON file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not valid JSON
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Overlays the fields set in `other` on top of this configuration.
    pub fn merge(mut self, other: PlayerConfig) -> Self {
        if other.client_name.is_some() {
            self.client_name = other.client_name;
        }
        if other.output_ports.is_some() {
            self.output_ports = other.output_ports;
        }
        if other.no_connect.is_some() {
            self.no_connect = other.no_connect;
        }
        if other.allow_pause.is_some() {
            self.allow_pause = other.allow_pause;
        }
        self
    }

    /// Whether automatic port connection is disabled.
    pub fn no_connect(&self) -> bool {
        self.no_connect.unwrap_or(false)
    }

    /// Whether pause emulation is enabled.
    pub fn allow_pause(&self) -> bool {
        self.allow_pause.unwrap_or(false)
    }

    /// The client name to register: configured name, executable name, or
    /// [`DEFAULT_CLIENT_NAME`].
    pub fn resolved_client_name(&self) -> String {
        self.client_name
            .clone()
            .or_else(executable_name)
            .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string())
    }
}

/// Base name of the running executable.
fn executable_name() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    let name = exe.file_name()?.to_str()?;
    (!name.is_empty()).then(|| name.to_string())
}

/// Parses a boolean setting.
///
/// Accepts 1/0, true/false, yes/no and on/off in any case.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PlayerConfig::default();
        assert!(!config.allow_pause());
        assert!(!config.no_connect());
        assert!(config.output_ports.is_none());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool(" YES "), Some(true));
        assert_eq!(parse_bool("Off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_from_lookup() {
        let config = PlayerConfig::from_lookup(lookup(&[
            (ENV_APP_NAME, "Jukebox"),
            (ENV_OUTPUT_PORTS, "128:0"),
            (ENV_NO_CONNECT, "garbage"),
            (ENV_ALLOW_PAUSE, "true"),
        ]));
        assert_eq!(config.client_name.as_deref(), Some("Jukebox"));
        assert_eq!(config.output_ports.as_deref(), Some("128:0"));
        assert_eq!(config.no_connect, None);
        assert!(!config.no_connect());
        assert!(config.allow_pause());
        assert_eq!(config.resolved_client_name(), "Jukebox");
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = PlayerConfig::from_lookup(lookup(&[(ENV_APP_NAME, ""), (ENV_OUTPUT_PORTS, "  ")]));
        assert!(config.client_name.is_none());
        assert!(config.output_ports.is_none());
        assert!(!config.resolved_client_name().is_empty());
    }

    #[test]
    fn test_json_partial_fields() {
        let config: PlayerConfig = serde_json::from_str(r#"{"allow_pause": true}"#).unwrap();
        assert!(config.allow_pause());
        assert!(config.client_name.is_none());

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("client_name"));
        assert!(!json.contains("no_connect"));
    }

    #[test]
    fn test_load_json_file() {
        let path = std::env::temp_dir().join(format!("midiplay-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"client_name": "Test", "no_connect": true}"#).unwrap();
        let config = PlayerConfig::load_json(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.client_name.as_deref(), Some("Test"));
        assert!(config.no_connect());
        assert!(PlayerConfig::load_json(&path).is_err());
    }

    #[test]
    fn test_merge_overlays_set_fields() {
        let base = PlayerConfig {
            client_name: Some("Base".to_string()),
            output_ports: Some("20:0".to_string()),
            ..Default::default()
        };
        let merged = base.merge(PlayerConfig {
            output_ports: Some("FLUID".to_string()),
            allow_pause: Some(true),
            ..Default::default()
        });
        assert_eq!(merged.client_name.as_deref(), Some("Base"));
        assert_eq!(merged.output_ports.as_deref(), Some("FLUID"));
        assert!(merged.allow_pause());
    }

    #[test]
    fn test_later_source_can_clear_flags() {
        let env = PlayerConfig::from_lookup(lookup(&[
            (ENV_ALLOW_PAUSE, "1"),
            (ENV_NO_CONNECT, "yes"),
        ]));
        let file: PlayerConfig = serde_json::from_str(r#"{"allow_pause": false}"#).unwrap();

        let merged = env.merge(file);
        assert!(!merged.allow_pause());
        // Unset in the file, so the environment still applies
        assert!(merged.no_connect());
    }
}
