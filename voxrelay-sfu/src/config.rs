//! SFU Configuration

use crate::engine::{RtpCodecCapability, WebRtcTransportOptions};
use serde::{Deserialize, Serialize};

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Codecs every room router is created with
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Listen options for WebRTC transports
    pub transport: WebRtcTransportOptions,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            media_codecs: vec![RtpCodecCapability::opus()],
            max_rooms: 0,
            max_peers_per_room: 0,
            transport: WebRtcTransportOptions::default(),
        }
    }
}

impl SfuConfig {
    /// Collect every configuration problem instead of stopping at the first one
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must contain at least one codec".to_string());
        }
        for codec in &self.media_codecs {
            if !codec.mime_type.contains('/') {
                errors.push(format!(
                    "sfu.media_codecs: mime type '{}' must look like 'audio/opus'",
                    codec.mime_type
                ));
            }
            if codec.clock_rate == 0 {
                errors.push(format!(
                    "sfu.media_codecs: clock rate of '{}' must be positive",
                    codec.mime_type
                ));
            }
        }
        if !self.transport.enable_udp && !self.transport.enable_tcp {
            errors.push("sfu.transport: at least one of enable_udp/enable_tcp must be set".to_string());
        }
        if let Some(address) = &self.transport.announced_address {
            if address.trim().is_empty() {
                errors.push("sfu.transport.announced_address must not be blank".to_string());
            }
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

    #[test]
    fn test_default_is_audio_only_and_valid() {
        let config = SfuConfig::default();
        assert_eq!(config.media_codecs.len(), 1);
        assert_eq!(config.media_codecs[0].mime_type, "audio/opus");
        assert_eq!(config.max_rooms, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = SfuConfig::default();
        config.media_codecs.clear();
        config.transport.enable_udp = false;
        config.transport.enable_tcp = false;
        config.transport.announced_address = Some("  ".to_string());

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: SfuConfig = serde_json::from_value(serde_json::json!({
            "max_peers_per_room": 4,
            "transport": {"announced_address": "203.0.113.7"}
        }))
        .unwrap();
        assert_eq!(config.max_peers_per_room, 4);
        assert!(config.transport.enable_udp);
        assert_eq!(config.transport.announced_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.media_codecs.len(), 1);
    }
}
