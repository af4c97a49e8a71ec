use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use manifest::STREAM_INF_TAG;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::ad_cache::{SegmentAdCache, SharedSegmentAdCache};
use crate::config::{AD_SIGNIFIER, MIDROLL_MARKER, SessionState, Settings, Toggles};
use crate::error::EngineError;
use crate::fetch::{FetchRequest, FetchResponse, Fetcher};
use crate::messages::ContextMessage;
use crate::negotiator::{NegotiatorDeps, negotiate};
use crate::registry::{StreamRegistry, StreamState};
use crate::rewriter::{RewriteContext, rewrite};
use crate::supervisor::{ContextFactory, ContextSupervisor};
use crate::token::TokenClient;

/// The engine facade one execution context talks to.
///
/// Manifest processing never fails outward: whatever goes wrong internally,
/// the caller gets usable playlist text back, degraded at worst to the
/// input itself.
pub struct Engine {
    settings: Settings,
    fetcher: Arc<dyn Fetcher>,
    token_client: TokenClient,
    registry: tokio::sync::Mutex<StreamRegistry>,
    ad_cache: SharedSegmentAdCache,
    session: Arc<parking_lot::Mutex<SessionState>>,
    toggles: Arc<parking_lot::Mutex<Toggles>>,
    supervisor: ContextSupervisor,
    lifecycle_rx: parking_lot::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<ContextMessage>>>,
    ads_blocked_tx: Arc<watch::Sender<u64>>,
}

impl Engine {
    pub fn new(
        settings: Settings,
        fetcher: Arc<dyn Fetcher>,
        factory: Arc<dyn ContextFactory>,
    ) -> Self {
        let session = Arc::new(parking_lot::Mutex::new(SessionState::default()));
        let toggles = Arc::new(parking_lot::Mutex::new(Toggles::default()));
        let (ads_blocked_tx, _) = watch::channel(0);
        let ads_blocked_tx = Arc::new(ads_blocked_tx);
        let (supervisor, lifecycle_rx) = ContextSupervisor::new(
            factory,
            session.clone(),
            toggles.clone(),
            settings.clone(),
            ads_blocked_tx.clone(),
        );
        Self {
            registry: tokio::sync::Mutex::new(StreamRegistry::new(settings.registry_capacity)),
            ad_cache: SegmentAdCache::shared(&settings),
            token_client: TokenClient::new(fetcher.clone()),
            settings,
            fetcher,
            session,
            toggles,
            supervisor,
            lifecycle_rx: parking_lot::Mutex::new(Some(lifecycle_rx)),
            ads_blocked_tx,
        }
    }

    pub fn session(&self) -> Arc<parking_lot::Mutex<SessionState>> {
        self.session.clone()
    }

    pub fn toggles(&self) -> Arc<parking_lot::Mutex<Toggles>> {
        self.toggles.clone()
    }

    /// Subscribes to the running ads-blocked counter.
    pub fn ads_blocked(&self) -> watch::Receiver<u64> {
        self.ads_blocked_tx.subscribe()
    }

    /// Takes the stream of ad lifecycle and player-control messages. Yields
    /// `None` after the first call.
    pub fn lifecycle_events(
        &self,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<ContextMessage>> {
        self.lifecycle_rx.lock().take()
    }

    pub async fn create_context(
        &self,
        url: &str,
        opts: HashMap<String, String>,
        script: Option<String>,
    ) -> Result<u64, EngineError> {
        self.supervisor.create_context(url, opts, script).await
    }

    /// Processes one playlist body on its way to the player.
    ///
    /// Master playlists register or refresh the channel's stream state and
    /// may come back HEVC-substituted. Media playlists are ad-detected and
    /// either replaced by a negotiated backup playlist or stripped in place.
    pub async fn process_manifest(&self, url: &str, text: &str) -> String {
        if text.contains(STREAM_INF_TAG) {
            self.process_master(url, text).await
        } else {
            self.process_media(url, text).await
        }
    }

    async fn process_master(&self, url: &str, text: &str) -> String {
        let Some(channel) = channel_from_url(url) else {
            debug!(url, "no channel name in master playlist URL, passing through");
            return text.to_string();
        };

        let mut registry = self.registry.lock().await;
        let state = registry
            .get_or_create(&channel, text, url, self.fetcher.as_ref())
            .await;

        let substitute = self.toggles.lock().hevc_substitution_enabled;
        if substitute && let Some(modified) = &state.modified_playlist {
            info!(channel = %state.channel_name, "serving HEVC-substituted master playlist");
            state.is_using_modified_playlist = true;
            return modified.clone();
        }
        state.is_using_modified_playlist = false;
        text.to_string()
    }

    async fn process_media(&self, url: &str, text: &str) -> String {
        let mut registry = self.registry.lock().await;
        let Some(state) = registry.lookup_by_url(url) else {
            debug!(url, "media playlist for unknown stream, passing through");
            return text.to_string();
        };

        let has_signifier = text.contains(AD_SIGNIFIER);
        state.is_midroll = text.contains(MIDROLL_MARKER);

        if has_signifier && !state.is_showing_ad {
            state.is_showing_ad = true;
            self.supervisor.record_ad_blocked();
            info!(
                channel = %state.channel_name,
                midroll = state.is_midroll,
                "ad break started"
            );
        } else if !has_signifier && state.is_showing_ad {
            state.is_showing_ad = false;
            state.is_midroll = false;
            info!(channel = %state.channel_name, "ad break ended");
        }

        let toggles = self.toggles.lock().clone();

        if has_signifier && !state.is_using_fallback_stream {
            // Match the backup to the rendition actually being watched.
            let (target, target_fps) = state
                .variants_by_url
                .get(url)
                .map(|variant| (variant.resolution, variant.frame_rate))
                .unwrap_or((None, None));
            let session = self.session.lock().clone();
            let deps = NegotiatorDeps {
                fetcher: self.fetcher.clone(),
                token_client: &self.token_client,
                session: &session,
                toggles: &toggles,
                settings: &self.settings,
            };
            let outcome = negotiate(state, &deps, target, target_fps, false).await;
            match outcome.playlist {
                // Negotiation can outlive the ad break; a replacement is
                // only applied while the ad is still showing.
                Some(playlist) if state.is_showing_ad => {
                    return if outcome.is_fallback {
                        // The last resort may itself carry ads.
                        self.strip_in_place(state, &playlist, toggles)
                    } else {
                        playlist
                    };
                }
                Some(_) => {
                    debug!(
                        channel = %state.channel_name,
                        "ad break over before negotiation finished, discarding result"
                    );
                }
                None => {
                    warn!(
                        channel = %state.channel_name,
                        "backup negotiation exhausted, stripping in place from now on"
                    );
                    state.is_using_fallback_stream = true;
                }
            }
        }

        self.strip_in_place(state, text, toggles)
    }

    fn strip_in_place(
        &self,
        state: &mut StreamState,
        text: &str,
        toggles: Toggles,
    ) -> String {
        let ctx = RewriteContext {
            ad_cache: &self.ad_cache,
            fetcher: self.fetcher.clone(),
            toggles,
            settings: &self.settings,
            now: Instant::now(),
        };
        rewrite(state, text, &ctx)
    }

    /// Fetches a URL on the player's behalf, piping playlist bodies through
    /// `process_manifest`. Degrades, never errors: transport failure becomes
    /// a synthesized bad-gateway response.
    pub async fn intercept_fetch(&self, request: FetchRequest) -> FetchResponse {
        let url = request.url.clone();
        let response = match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url, error = %e, "upstream fetch failed");
                return FetchResponse {
                    status: 502,
                    body: String::new(),
                };
            }
        };

        if response.is_success() && is_playlist_url(&url) {
            let body = self.process_manifest(&url, &response.body).await;
            return FetchResponse {
                status: response.status,
                body,
            };
        }
        response
    }
}

fn is_playlist_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().ends_with(".m3u8"),
        Err(_) => url.split(['?', '#']).next().is_some_and(|p| p.ends_with(".m3u8")),
    }
}

/// Pulls the channel name out of a master playlist URL
/// (`…/hls/{channel}.m3u8`).
fn channel_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let channel = segment.strip_suffix(".m3u8").unwrap_or(segment);
    if channel.is_empty() {
        None
    } else {
        Some(channel.to_ascii_lowercase())
    }
}
