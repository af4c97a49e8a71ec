use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use manifest::{
    Resolution, STREAM_INF_TAG, VariantInfo, is_hevc_codecs, parse_attribute_list,
    parse_master_playlist, rewrite_attribute, server_time,
};
use tracing::{debug, info, warn};

use crate::fetch::{FetchRequest, Fetcher};

/// Per-profile backup manifest cache entry. Absence from the map means the
/// profile has not been attempted yet; `Failed` means attempted and failed.
/// The two must never be conflated, since cache-only profiles are allowed
/// one attempt ever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupEntry {
    Failed,
    Cached(String),
}

/// Three-way view over the backup manifest cache for one profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupEntryState {
    NotAttempted,
    Failed,
    Cached,
}

/// Everything the engine tracks for one live channel.
#[derive(Debug)]
pub struct StreamState {
    pub channel_name: String,
    pub is_showing_ad: bool,
    pub last_reload_at: DateTime<Utc>,
    /// The raw master ("encodings") manifest this state was built from.
    pub encodings_playlist: String,
    /// HEVC-substituted master manifest, when one could be synthesized.
    pub modified_playlist: Option<String>,
    pub is_using_modified_playlist: bool,
    /// Once true, ad events are handled by stripping in place instead of
    /// negotiating a replacement stream.
    pub is_using_fallback_stream: bool,
    /// Query string carried over from the original manifest request.
    pub usher_params: String,
    /// Ad segment URLs already drained; each is fetched at most once.
    pub requested_ad_segments: HashSet<String>,
    pub variants_by_url: HashMap<String, VariantInfo>,
    pub variant_list: Vec<VariantInfo>,
    pub backup_encodings: HashMap<String, BackupEntry>,
    /// Profile that last produced an accepted backup playlist.
    pub active_backup_profile: Option<String>,
    pub is_midroll: bool,
    pub is_stripping_ad_segments: bool,
    pub num_stripped_ad_segments: u64,
}

impl StreamState {
    pub(crate) fn build(channel: &str, manifest_text: &str, request_url: &str) -> Self {
        let variant_list = parse_master_playlist(manifest_text);
        let variants_by_url = variant_list
            .iter()
            .map(|v| (v.url.clone(), v.clone()))
            .collect();
        let usher_params = request_url
            .split_once('?')
            .map(|(_, query)| query.to_string())
            .unwrap_or_default();
        let modified_playlist = synthesize_modified_playlist(manifest_text, &variant_list);

        Self {
            channel_name: channel.to_string(),
            is_showing_ad: false,
            last_reload_at: server_time(manifest_text).unwrap_or_else(Utc::now),
            encodings_playlist: manifest_text.to_string(),
            modified_playlist,
            is_using_modified_playlist: false,
            is_using_fallback_stream: false,
            usher_params,
            requested_ad_segments: HashSet::new(),
            variants_by_url,
            variant_list,
            backup_encodings: HashMap::new(),
            active_backup_profile: None,
            is_midroll: false,
            is_stripping_ad_segments: false,
            num_stripped_ad_segments: 0,
        }
    }

    pub fn backup_entry_state(&self, profile: &str) -> BackupEntryState {
        match self.backup_encodings.get(profile) {
            None => BackupEntryState::NotAttempted,
            Some(BackupEntry::Failed) => BackupEntryState::Failed,
            Some(BackupEntry::Cached(_)) => BackupEntryState::Cached,
        }
    }

    pub fn first_playable_variant(&self) -> Option<&VariantInfo> {
        self.variant_list.first()
    }
}

/// Per-channel stream state store, bounded by strict FIFO eviction.
///
/// Insertion order decides who goes, never recency of use. The reverse
/// URL index is kept exactly in lockstep: entries are added when a state is
/// built and removed only when its owning state leaves the registry.
pub struct StreamRegistry {
    capacity: usize,
    states: HashMap<String, StreamState>,
    order: VecDeque<String>,
    url_index: HashMap<String, String>,
}

impl StreamRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            states: HashMap::new(),
            order: VecDeque::new(),
            url_index: HashMap::new(),
        }
    }

    /// Returns the state for a channel, building it from the given manifest
    /// when there is none to reuse.
    ///
    /// A cached state is only reused after revalidation: its first playable
    /// variant URL is probed, and on any failure the whole state is
    /// discarded and rebuilt from the fresh manifest. Cached state is never
    /// patched in place.
    pub async fn get_or_create(
        &mut self,
        channel: &str,
        manifest_text: &str,
        request_url: &str,
        fetcher: &dyn Fetcher,
    ) -> &mut StreamState {
        let mut reuse = false;
        if let Some(state) = self.states.get(channel) {
            reuse = revalidate(state, fetcher).await;
            if reuse {
                debug!(channel, "reusing revalidated stream state");
            } else {
                info!(channel, "cached stream state failed revalidation, rebuilding");
            }
        }

        if !reuse {
            self.remove(channel);
            self.evict_to_fit();

            let state = StreamState::build(channel, manifest_text, request_url);
            for variant in &state.variant_list {
                self.url_index.insert(variant.url.clone(), channel.to_string());
            }
            debug!(
                channel,
                variants = state.variant_list.len(),
                hevc_substituted = state.modified_playlist.is_some(),
                "registered stream state"
            );
            self.order.push_back(channel.to_string());
            self.states.insert(channel.to_string(), state);
        }

        self.states
            .entry(channel.to_string())
            .or_insert_with(|| StreamState::build(channel, manifest_text, request_url))
    }

    pub fn get(&self, channel: &str) -> Option<&StreamState> {
        self.states.get(channel)
    }

    pub fn get_mut(&mut self, channel: &str) -> Option<&mut StreamState> {
        self.states.get_mut(channel)
    }

    /// Resolves a variant (media playlist) URL back to its owning state.
    pub fn lookup_by_url(&mut self, variant_url: &str) -> Option<&mut StreamState> {
        let channel = self.url_index.get(variant_url)?.clone();
        self.states.get_mut(&channel)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn remove(&mut self, channel: &str) {
        if let Some(state) = self.states.remove(channel) {
            for variant in &state.variant_list {
                self.url_index.remove(&variant.url);
            }
            self.order.retain(|c| c != channel);
        }
    }

    fn evict_to_fit(&mut self) {
        while self.states.len() >= self.capacity {
            let Some(oldest) = self.order.front().cloned() else {
                break;
            };
            warn!(channel = %oldest, "registry full, evicting oldest channel");
            self.remove(&oldest);
        }
    }
}

async fn revalidate(state: &StreamState, fetcher: &dyn Fetcher) -> bool {
    let Some(variant) = state.first_playable_variant() else {
        return false;
    };
    match fetcher.fetch(FetchRequest::get(variant.url.clone())).await {
        Ok(response) => response.is_success(),
        Err(e) => {
            debug!(url = %variant.url, error = %e, "revalidation probe failed");
            false
        }
    }
}

/// Synthesizes an HEVC-substituted master playlist: every HEVC stream-inf
/// line has its CODECS rewritten and its URL line replaced with the non-HEVC
/// variant closest in pixel count. Returns `None` unless both an HEVC and a
/// non-HEVC variant exist.
fn synthesize_modified_playlist(
    manifest_text: &str,
    variants: &[VariantInfo],
) -> Option<String> {
    let non_hevc: Vec<&VariantInfo> = variants
        .iter()
        .filter(|v| !is_hevc_codecs(&v.codecs))
        .collect();
    let has_hevc = variants.iter().any(|v| is_hevc_codecs(&v.codecs));
    if !has_hevc || non_hevc.is_empty() {
        return None;
    }

    let lines: Vec<&str> = manifest_text.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let substituted = line
            .trim()
            .strip_prefix(STREAM_INF_TAG)
            .map(|rest| parse_attribute_list(rest))
            .filter(|attrs| is_hevc_codecs(attrs.get("CODECS").map_or("", String::as_str)))
            .and_then(|attrs| {
                let url_line = lines.get(i + 1).map(|l| l.trim())?;
                if url_line.is_empty() || url_line.starts_with('#') {
                    return None;
                }
                let resolution = attrs
                    .get("RESOLUTION")
                    .and_then(|r| r.parse::<Resolution>().ok());
                let substitute = match resolution {
                    Some(resolution) => closest_by_pixels(&non_hevc, resolution),
                    None => non_hevc.first().copied(),
                }?;
                Some((
                    rewrite_attribute(line, "CODECS", &substitute.codecs),
                    substitute.url.clone(),
                ))
            });

        match substituted {
            Some((tag_line, url)) => {
                out.push(tag_line);
                out.push(url);
                i += 2;
            }
            None => {
                out.push(line.to_string());
                i += 1;
            }
        }
    }

    let mut text = out.join("\n");
    if manifest_text.ends_with('\n') {
        text.push('\n');
    }
    Some(text)
}

fn closest_by_pixels<'a>(
    candidates: &[&'a VariantInfo],
    target: Resolution,
) -> Option<&'a VariantInfo> {
    let mut best: Option<(&VariantInfo, u64)> = None;
    for variant in candidates {
        let Some(resolution) = variant.resolution else {
            continue;
        };
        let distance = resolution.pixels().abs_diff(target.pixels());
        match best {
            Some((_, closest)) if distance >= closest => {}
            _ => best = Some((variant, distance)),
        }
    }
    best.map(|(variant, _)| variant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockFetcher;

    fn master(channel: &str) -> String {
        format!(
            "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=6000000,RESOLUTION=1920x1080,FRAME-RATE=60,CODECS=\"avc1.4d402a,mp4a.40.2\"\n\
https://edge.example.com/{channel}/chunked/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720,FRAME-RATE=30,CODECS=\"avc1.4d401f,mp4a.40.2\"\n\
https://edge.example.com/{channel}/720p30/index.m3u8\n"
        )
    }

    const HEVC_MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=4000000,RESOLUTION=1920x1080,CODECS=\"hev1.1.6.L120.90,mp4a.40.2\"\n\
https://edge.example.com/c/hevc1080/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=6000000,RESOLUTION=1920x1080,CODECS=\"avc1.4d402a,mp4a.40.2\"\n\
https://edge.example.com/c/chunked/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720,CODECS=\"avc1.4d401f,mp4a.40.2\"\n\
https://edge.example.com/c/720p30/index.m3u8\n";

    #[tokio::test]
    async fn test_create_and_lookup_by_url() {
        let fetcher = MockFetcher::new();
        let mut registry = StreamRegistry::new(5);
        let manifest = master("somechannel");
        registry
            .get_or_create(
                "somechannel",
                &manifest,
                "https://usher.ttvnw.net/api/channel/hls/somechannel.m3u8?token=t&sig=s",
                &fetcher,
            )
            .await;

        let state = registry
            .lookup_by_url("https://edge.example.com/somechannel/chunked/index.m3u8")
            .unwrap();
        assert_eq!(state.channel_name, "somechannel");
        assert_eq!(state.usher_params, "token=t&sig=s");
        assert_eq!(state.variant_list.len(), 2);
        assert_eq!(
            state.backup_entry_state("embed"),
            BackupEntryState::NotAttempted
        );
    }

    #[tokio::test]
    async fn test_fifo_eviction_drops_first_registered_channel() {
        let fetcher = MockFetcher::new();
        let mut registry = StreamRegistry::new(5);
        for n in 0..6 {
            let channel = format!("channel{n}");
            let manifest = master(&channel);
            registry
                .get_or_create(&channel, &manifest, "https://usher.example.com/x.m3u8", &fetcher)
                .await;
        }

        assert_eq!(registry.len(), 5);
        assert!(registry.get("channel0").is_none());
        assert!(
            registry
                .lookup_by_url("https://edge.example.com/channel0/chunked/index.m3u8")
                .is_none()
        );
        assert!(
            registry
                .lookup_by_url("https://edge.example.com/channel0/720p30/index.m3u8")
                .is_none()
        );
        assert!(registry.get("channel1").is_some());
        assert!(registry.get("channel5").is_some());
    }

    #[tokio::test]
    async fn test_eviction_is_by_insertion_order_not_recency() {
        let fetcher = MockFetcher::new();
        // Probe succeeds so re-visits reuse instead of rebuild.
        fetcher.route("https://edge.example.com/", 200, "#EXTM3U\n");
        let mut registry = StreamRegistry::new(2);

        for channel in ["a", "b"] {
            let manifest = master(channel);
            registry
                .get_or_create(channel, &manifest, "https://u.example.com/x.m3u8", &fetcher)
                .await;
        }
        // Touch "a" again; FIFO must still evict it first.
        let manifest_a = master("a");
        registry
            .get_or_create("a", &manifest_a, "https://u.example.com/x.m3u8", &fetcher)
            .await;

        let manifest_c = master("c");
        registry
            .get_or_create("c", &manifest_c, "https://u.example.com/x.m3u8", &fetcher)
            .await;

        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
        assert!(registry.get("c").is_some());
    }

    #[tokio::test]
    async fn test_failed_revalidation_rebuilds_state() {
        let fetcher = MockFetcher::new();
        let mut registry = StreamRegistry::new(5);
        let manifest = master("somechannel");
        {
            let state = registry
                .get_or_create("somechannel", &manifest, "https://u.example.com/x.m3u8", &fetcher)
                .await;
            state.num_stripped_ad_segments = 7;
        }

        // Probe is unrouted (404), so the cached state must be discarded and
        // rebuilt, not patched.
        let state = registry
            .get_or_create("somechannel", &manifest, "https://u.example.com/x.m3u8", &fetcher)
            .await;
        assert_eq!(state.num_stripped_ad_segments, 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_successful_revalidation_reuses_state() {
        let fetcher = MockFetcher::new();
        fetcher.route("https://edge.example.com/", 200, "#EXTM3U\n");
        let mut registry = StreamRegistry::new(5);
        let manifest = master("somechannel");
        {
            let state = registry
                .get_or_create("somechannel", &manifest, "https://u.example.com/x.m3u8", &fetcher)
                .await;
            state.num_stripped_ad_segments = 7;
        }

        let state = registry
            .get_or_create("somechannel", &manifest, "https://u.example.com/x.m3u8", &fetcher)
            .await;
        assert_eq!(state.num_stripped_ad_segments, 7);
    }

    #[tokio::test]
    async fn test_hevc_substitution() {
        let fetcher = MockFetcher::new();
        let mut registry = StreamRegistry::new(5);
        let state = registry
            .get_or_create("c", HEVC_MASTER, "https://u.example.com/x.m3u8", &fetcher)
            .await;

        let modified = state.modified_playlist.as_deref().unwrap();
        assert!(!modified.contains("hev1"));
        // The HEVC 1080p entry now points at the avc 1080p variant, the
        // closest non-HEVC rendition by pixel count.
        assert!(!modified.contains("hevc1080"));
        assert_eq!(modified.matches("https://edge.example.com/c/chunked/index.m3u8").count(), 2);
        assert!(modified.contains("CODECS=\"avc1.4d402a,mp4a.40.2\""));
        // Non-HEVC lines are untouched.
        assert!(modified.contains("https://edge.example.com/c/720p30/index.m3u8"));
    }

    #[tokio::test]
    async fn test_no_substitution_without_hevc() {
        let fetcher = MockFetcher::new();
        let mut registry = StreamRegistry::new(5);
        let manifest = master("c");
        let state = registry
            .get_or_create("c", &manifest, "https://u.example.com/x.m3u8", &fetcher)
            .await;
        assert!(state.modified_playlist.is_none());
    }
}
