//! SFU Configuration

use crate::rtp::{CodecParameters, RtpCodecCapability};
use crate::types::{MediaKind, RoomId};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// What happens to a room once its last peer leaves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyRoomPolicy {
    /// Close the router and forget the room immediately
    #[default]
    Close,
    /// Keep the router for `empty_room_ttl_secs` so peers can rejoin cheaply
    Keep,
}

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Number of media engine workers (0 = one per available CPU)
    pub num_workers: usize,
    /// Lowest RTC port handed out to transports
    pub rtc_min_port: u16,
    /// Highest RTC port handed out to transports
    pub rtc_max_port: u16,
    /// Address transports listen on
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates (public IP behind NAT)
    pub announced_address: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Codecs every router is created with
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Room used when a client does not name one
    pub default_room: RoomId,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    pub empty_room_policy: EmptyRoomPolicy,
    /// Grace period for empty rooms under `EmptyRoomPolicy::Keep`
    pub empty_room_ttl_secs: u64,
    /// Time given to in-flight responses before the process exits on an unrecoverable worker death
    pub worker_death_grace_secs: u64,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            rtc_min_port: 2000,
            rtc_max_port: 2020,
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_address: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            media_codecs: default_media_codecs(),
            default_room: RoomId::from("default"),
            max_rooms: 0,
            max_peers_per_room: 50,
            empty_room_policy: EmptyRoomPolicy::Close,
            empty_room_ttl_secs: 300,
            worker_death_grace_secs: 2,
        }
    }
}

impl SfuConfig {
    /// Worker count after resolving `0` to the hardware concurrency
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }

    /// Collect configuration problems instead of failing on the first one
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.rtc_min_port == 0 || self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "sfu.rtc_min_port ({}) must be non-zero and not above sfu.rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if !self.enable_udp && !self.enable_tcp {
            errors.push("sfu: at least one of enable_udp / enable_tcp must be set".to_string());
        }
        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must not be empty".to_string());
        }
        for codec in &self.media_codecs {
            if MediaKind::from_mime_type(&codec.mime_type) != Some(codec.kind) {
                errors.push(format!(
                    "sfu.media_codecs: mime type {} does not match kind {}",
                    codec.mime_type, codec.kind
                ));
            }
        }
        if self.default_room.as_str().is_empty() {
            errors.push("sfu.default_room must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Opus audio and VP8 video with a starting bitrate hint
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut vp8_parameters = CodecParameters::new();
    vp8_parameters.insert("x-google-start-bitrate".to_string(), 1000.into());

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: CodecParameters::new(),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
            rtcp_feedback: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SfuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.media_codecs.len(), 2);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_validation_collects_errors() {
        let config = SfuConfig {
            rtc_min_port: 3000,
            rtc_max_port: 2000,
            enable_udp: false,
            enable_tcp: false,
            media_codecs: Vec::new(),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_codec_kind_must_match_mime() {
        let mut config = SfuConfig::default();
        config.media_codecs[0].kind = MediaKind::Video;
        assert!(config.validate().is_err());
    }
}
