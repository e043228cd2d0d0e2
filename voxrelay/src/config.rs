use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use voxrelay_sfu::{AdmissionConfig, SfuConfig};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
    pub admission: AdmissionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted WebSocket frame, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3016,
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if !Path::new(path).exists() {
                return Err(ConfigError::NotFound(path.to_string()));
            }
            builder = builder.add_source(File::with_name(path));
        }

        // VOXRELAY_SERVER__PORT, VOXRELAY_SFU__MAX_PEERS_PER_ROOM, ...
        builder = builder.add_source(
            Environment::with_prefix("VOXRELAY")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("admission.denied_users")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Validate configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.max_message_size < 1024 {
            errors.push(format!(
                "server.max_message_size must be at least 1024 bytes, got {}",
                self.server.max_message_size
            ));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use voxrelay_sfu::{AdmissionPolicy, DenyListPolicy, RoomId, UserId};

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.http_address(), "0.0.0.0:3016");
        assert_eq!(config.logging.level, "info");
        assert!(config.admission.denied_users.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r"
server:
  port: 9000
logging:
  format: json
sfu:
  max_peers_per_room: 8
admission:
  denied_users: ['5']
  room_denylist:
    lobby: ['7']
"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.sfu.max_peers_per_room, 8);
        assert_eq!(config.sfu.media_codecs.len(), 1);
        assert_eq!(config.admission.denied_users, vec!["5".to_string()]);
        assert_eq!(config.admission.room_denylist["lobby"], vec!["7".to_string()]);
    }

    #[test]
    fn test_example_config_blocks_user_5() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.yaml");
        let config = Config::load(Some(path)).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.sfu.max_rooms, 0);
        assert_eq!(config.sfu.media_codecs, SfuConfig::default().media_codecs);
        assert_eq!(config.sfu.transport, SfuConfig::default().transport);

        let policy = DenyListPolicy::from(&config.admission);
        assert!(!policy.admit(&RoomId::from("r2"), &UserId::from("5")).is_allowed());
        assert!(policy.admit(&RoomId::from("r2"), &UserId::from("6")).is_allowed());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load(Some("/nonexistent/voxrelay.yaml")).is_err());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.logging.format = "xml".to_string();
        config.sfu.media_codecs.clear();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }
}
