//! Voice module configuration
//!
//! Endpoint, identity role, audio format, and policy knobs for the call
//! subsystem.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::device::FrameSpec;

/// Policy for incoming call requests.
///
/// The legacy client answered every `call-request` immediately. That is now
/// a policy choice: `Manual` surfaces the call to the UI and waits for
/// `accept_incoming`/`reject_incoming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcceptPolicy {
    /// Ring and wait for an explicit user decision (default)
    #[default]
    Manual,
    /// Answer incoming calls without confirmation
    Auto,
}

/// Configuration for the voice call module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Signaling server hostname or IP
    pub server_host: String,

    /// Signaling server port
    pub server_port: u16,

    /// Role announced at registration ("seller" for this client)
    pub role: String,

    /// PCM sample rate in Hz
    pub sample_rate: u32,

    /// Channel count (mono for voice)
    pub channels: u16,

    /// Bounded writer queue between the capture loop and the socket
    pub send_queue_depth: usize,

    /// Bounded queue between the receive path and the playback loop
    pub playback_queue_depth: usize,

    /// How incoming call requests are answered
    pub accept_policy: AcceptPolicy,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: 9000,
            role: "seller".to_string(),
            sample_rate: 44_100,
            channels: 1,
            send_queue_depth: 32,
            playback_queue_depth: 16,
            accept_policy: AcceptPolicy::Manual,
            connect_timeout_secs: 10,
        }
    }
}

impl VoiceConfig {
    /// Create config from environment variables
    pub fn from_env() -> Option<Self> {
        let server_host = std::env::var("VOICE_SIGNAL_HOST").ok()?;

        let server_port = std::env::var("VOICE_SIGNAL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(9000);

        let accept_policy = match std::env::var("VOICE_ACCEPT_POLICY")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "auto" => AcceptPolicy::Auto,
            _ => AcceptPolicy::Manual,
        };

        Some(Self {
            server_host,
            server_port,
            role: std::env::var("VOICE_ROLE").unwrap_or_else(|_| "seller".to_string()),
            sample_rate: std::env::var("VOICE_SAMPLE_RATE")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(44_100),
            channels: std::env::var("VOICE_CHANNELS")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(1),
            accept_policy,
            ..Self::default()
        })
    }

    /// Validate configuration before connecting
    pub fn validate(&self) -> Result<(), String> {
        if self.server_host.is_empty() {
            return Err("signaling server host is required".to_string());
        }
        if self.server_port == 0 {
            return Err("signaling server port is required".to_string());
        }
        // Frame geometry slices 20ms frames, so the rate must divide into
        // 50 whole frames per second.
        if self.sample_rate == 0 || self.sample_rate % 50 != 0 {
            return Err("sample rate must be a non-zero multiple of 50 Hz".to_string());
        }
        if !(1..=2).contains(&self.channels) {
            return Err("channel count must be 1 or 2".to_string());
        }
        if self.send_queue_depth == 0 || self.playback_queue_depth == 0 {
            return Err("queue depths must be non-zero".to_string());
        }
        Ok(())
    }

    /// Audio frame geometry derived from the configured format
    pub fn frame_spec(&self) -> FrameSpec {
        FrameSpec {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_host() {
        let config = VoiceConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn populated_config_validates() {
        let config = VoiceConfig {
            server_host: "192.168.1.20".to_string(),
            ..VoiceConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn frame_spec_matches_audio_params() {
        let config = VoiceConfig {
            server_host: "h".to_string(),
            sample_rate: 8000,
            channels: 1,
            ..VoiceConfig::default()
        };
        let spec = config.frame_spec();
        // 20ms at 8kHz mono, 16-bit
        assert_eq!(spec.samples_per_frame(), 160);
        assert_eq!(spec.frame_bytes(), 320);
    }

    #[test]
    fn rejects_sample_rate_that_does_not_frame_evenly() {
        // 44_099 / 50 truncates, which would silently shrink every frame
        let config = VoiceConfig {
            server_host: "h".to_string(),
            sample_rate: 44_099,
            ..VoiceConfig::default()
        };
        assert!(config.validate().is_err());

        let config = VoiceConfig {
            server_host: "h".to_string(),
            sample_rate: 30,
            ..VoiceConfig::default()
        };
        assert!(config.validate().is_err());

        let config = VoiceConfig {
            server_host: "h".to_string(),
            sample_rate: 8000,
            ..VoiceConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_channel_count() {
        let config = VoiceConfig {
            server_host: "h".to_string(),
            channels: 6,
            ..VoiceConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
