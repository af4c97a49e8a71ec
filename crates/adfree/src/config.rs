use std::time::Duration;

use manifest::Resolution;
use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Token marking a live playlist as currently carrying stitched ad content.
pub const AD_SIGNIFIER: &str = "stitched-ad";

/// Segment title marker present on real live segments and absent on ads.
pub const LIVE_SEGMENT_MARKER: &str = ",live";

/// Path fragments that identify placeholder/unavailable ad segments.
pub const AD_PLACEHOLDER_URL_FRAGMENTS: &[&str] = &["404_processing", "twitch-client-ad"];

/// Value the ad metadata URL attributes are neutralized to.
pub const NEUTRALIZED_URL: &str = "about:blank";

/// Tag attributes whose values point at ad tracking endpoints.
pub const AD_METADATA_URL_ATTRS: &[&str] =
    &["X-TV-TWITCH-AD-URL", "X-TV-TWITCH-AD-CLICK-TRACKING-URL"];

/// Marker distinguishing a true midroll from a preroll ad block.
pub const MIDROLL_MARKER: &str = "X-TV-TWITCH-AD-ROLL-TYPE=\"MIDROLL\"";

pub const GQL_URL: &str = "https://gql.twitch.tv/gql";
pub const USHER_BASE: &str = "https://usher.ttvnw.net/api/channel/hls";
pub const DEFAULT_CLIENT_ID: &str = "kimne78kx3ncx6brgo4mv6wki5h1ko";

/// Built-in persisted-query hash for PlaybackAccessToken; a session may carry
/// an updated one pushed from another context.
pub const DEFAULT_GQL_HASH: &str =
    "ed230aa1e33e07eebb8928504583da78a5173989fadfb1ac94be06a04f3cdbe9";

/// Session/device identity of one execution context.
///
/// Each context owns its own instance; nothing here is shared memory.
/// Changes are re-published to other contexts via explicit messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub client_version: Option<String>,
    pub client_session: Option<String>,
    pub client_id: Option<String>,
    pub device_id: String,
    pub client_integrity: Option<String>,
    pub authorization: Option<String>,
    pub gql_token_hash: Option<String>,
    pub ads_blocked: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            client_version: None,
            client_session: None,
            client_id: None,
            device_id: random_device_id(),
            client_integrity: None,
            authorization: None,
            gql_token_hash: None,
            ads_blocked: 0,
        }
    }
}

/// Random 16-digit device id, the shape the upstream device-id header expects.
pub fn random_device_id() -> String {
    rand::rng()
        .random_range(1_000_000_000_000_000_i64..=9_999_999_999_999_999_i64)
        .to_string()
}

/// Behavior switches, including the test knobs the acceptance logic honors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Toggles {
    /// Classify every segment as an ad regardless of markers.
    pub treat_all_as_ads: bool,
    /// Strip even when the ad signifier is absent.
    pub force_strip: bool,
    /// Reject the first K profiles during negotiation regardless of content.
    pub simulated_ad_depth: usize,
    /// Serve the HEVC-substituted master playlist when one was synthesized.
    pub hevc_substitution_enabled: bool,
}

/// One authorization profile to try during backup negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupProfile {
    pub name: String,
    /// Attempt at most once and never re-fetch on a recorded miss.
    pub cache_only: bool,
}

impl BackupProfile {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cache_only: false,
        }
    }

    pub fn cache_only(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cache_only: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum channels tracked before strict FIFO eviction kicks in.
    pub registry_capacity: usize,
    /// Maximum isolated execution contexts tracked at once.
    pub context_capacity: usize,
    /// First crash-restart delay; doubles per attempt.
    pub restart_backoff_base: Duration,
    pub max_restart_attempts: u32,
    pub ad_cache_ttl: Duration,
    pub ad_cache_prune_interval: Duration,
    /// How many stripped pairs are kept for empty-playlist recovery.
    pub recovery_buffer_depth: usize,
    pub default_target_resolution: Resolution,
    /// Ordered profile list tried during negotiation.
    pub profiles: Vec<BackupProfile>,
    /// Profile whose playlist is preferred as the fallback of last resort.
    pub fallback_profile: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry_capacity: 5,
            context_capacity: 5,
            restart_backoff_base: Duration::from_secs(1),
            max_restart_attempts: 3,
            ad_cache_ttl: Duration::from_secs(120),
            ad_cache_prune_interval: Duration::from_secs(60),
            recovery_buffer_depth: 3,
            default_target_resolution: Resolution::new(1920, 1080),
            profiles: vec![
                BackupProfile::new("embed"),
                BackupProfile::new("autoplay"),
                BackupProfile::cache_only("picture-by-picture"),
                BackupProfile::new("thunderdome"),
            ],
            fallback_profile: "embed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_shape() {
        let id = random_device_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_default_profiles() {
        let settings = Settings::default();
        assert_eq!(settings.profiles.len(), 4);
        assert!(settings.profiles.iter().any(|p| p.cache_only));
        assert!(
            settings
                .profiles
                .iter()
                .any(|p| p.name == settings.fallback_profile)
        );
    }
}
