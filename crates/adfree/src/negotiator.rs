use std::sync::Arc;

use manifest::{Resolution, parse_master_playlist, select_variant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{AD_SIGNIFIER, BackupProfile, SessionState, Settings, Toggles, USHER_BASE};
use crate::error::EngineError;
use crate::fetch::{FetchRequest, Fetcher};
use crate::registry::{BackupEntry, StreamState};
use crate::token::{PlaybackToken, TokenClient, parse_playback_token};

/// Result of one backup negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationOutcome {
    pub profile: Option<String>,
    pub playlist: Option<String>,
    /// True when no ad-free candidate was found and the returned playlist is
    /// the fallback of last resort.
    pub is_fallback: bool,
}

impl NegotiationOutcome {
    fn exhausted() -> Self {
        Self {
            profile: None,
            playlist: None,
            is_fallback: false,
        }
    }
}

/// What the negotiator borrows from its owning engine for one search.
pub struct NegotiatorDeps<'a> {
    pub fetcher: Arc<dyn Fetcher>,
    pub token_client: &'a TokenClient,
    pub session: &'a SessionState,
    pub toggles: &'a Toggles,
    pub settings: &'a Settings,
}

const ATTEMPTS_PER_PROFILE: u32 = 2;

/// Searches the ordered profile list for an ad-free replacement playlist.
///
/// Strictly sequential: one profile at a time, at most two attempts each,
/// every failure caught and logged so the search always continues to the
/// next candidate. Only one negotiation can be in flight per stream state
/// because the state is borrowed mutably through the whole call.
pub async fn negotiate(
    state: &mut StreamState,
    deps: &NegotiatorDeps<'_>,
    target: Option<Resolution>,
    target_fps: Option<f64>,
    minimal: bool,
) -> NegotiationOutcome {
    let target = target.unwrap_or(deps.settings.default_target_resolution);

    // The profile that last worked goes first.
    let mut profiles: Vec<BackupProfile> = deps.settings.profiles.clone();
    if let Some(active) = state.active_backup_profile.clone()
        && let Some(position) = profiles.iter().position(|p| p.name == active)
    {
        let preferred = profiles.remove(position);
        profiles.insert(0, preferred);
    }

    let mut last_resort: Option<(String, String)> = None;
    let mut last_resort_from_fallback_profile = false;

    for (profile_index, profile) in profiles.iter().enumerate() {
        let mut attempt = 0;
        while attempt < ATTEMPTS_PER_PROFILE {
            attempt += 1;

            let (encodings, fresh) = match backup_encodings(state, deps, profile).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(
                        channel = %state.channel_name,
                        profile = %profile.name,
                        attempt,
                        error = %e,
                        "backup manifest unavailable"
                    );
                    if profile.cache_only {
                        // Cache-only profiles get one shot, never a refetch.
                        break;
                    }
                    continue;
                }
            };

            let variants = parse_master_playlist(&encodings);
            let Some(variant) = select_variant(&variants, target, target_fps) else {
                warn!(
                    channel = %state.channel_name,
                    profile = %profile.name,
                    "backup manifest carries no usable variant"
                );
                if fresh {
                    state
                        .backup_encodings
                        .insert(profile.name.clone(), BackupEntry::Failed);
                }
                if profile.cache_only {
                    break;
                }
                continue;
            };

            let playlist = match deps.fetcher.fetch(FetchRequest::get(variant.url.clone())).await
            {
                Ok(response) if response.is_success() => response.body,
                Ok(response) => {
                    debug!(
                        url = %variant.url,
                        status = response.status,
                        "backup variant fetch rejected"
                    );
                    if profile.cache_only {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    debug!(url = %variant.url, error = %e, "backup variant fetch failed");
                    if profile.cache_only {
                        break;
                    }
                    continue;
                }
            };

            if last_resort.is_none()
                || (profile.name == deps.settings.fallback_profile
                    && !last_resort_from_fallback_profile)
            {
                last_resort_from_fallback_profile =
                    profile.name == deps.settings.fallback_profile;
                last_resort = Some((profile.name.clone(), playlist.clone()));
            }

            // A freshly fetched manifest is spent after one use; one reused
            // from a prior Cached entry keeps its entry (preserved upstream
            // asymmetry, see DESIGN.md).
            if fresh {
                state.backup_encodings.remove(&profile.name);
            }

            let forced_reject = profile_index < deps.toggles.simulated_ad_depth;
            let ad_free = !playlist.contains(AD_SIGNIFIER);
            if minimal || (ad_free && !forced_reject) {
                info!(
                    channel = %state.channel_name,
                    profile = %profile.name,
                    variant = %variant.url,
                    minimal,
                    "accepted backup playlist"
                );
                state.active_backup_profile = Some(profile.name.clone());
                return NegotiationOutcome {
                    profile: Some(profile.name.clone()),
                    playlist: Some(playlist),
                    is_fallback: false,
                };
            }

            debug!(
                channel = %state.channel_name,
                profile = %profile.name,
                forced_reject,
                "backup playlist rejected, trying next profile"
            );
            // Content was evaluated and rejected; retrying the same profile
            // would only return the same playlist.
            break;
        }
    }

    if let Some((profile, playlist)) = last_resort {
        info!(
            channel = %state.channel_name,
            profile = %profile,
            "no ad-free backup found, using fallback of last resort"
        );
        // From here on, ad events on this channel strip in place instead of
        // renegotiating.
        state.is_using_fallback_stream = true;
        return NegotiationOutcome {
            profile: Some(profile),
            playlist: Some(playlist),
            is_fallback: true,
        };
    }

    warn!(channel = %state.channel_name, "backup negotiation exhausted");
    NegotiationOutcome::exhausted()
}

/// Returns the backup master manifest for a profile, either reused from the
/// per-state cache or freshly fetched via token + usher. The bool is true
/// for a fresh fetch.
async fn backup_encodings(
    state: &mut StreamState,
    deps: &NegotiatorDeps<'_>,
    profile: &BackupProfile,
) -> Result<(String, bool), EngineError> {
    match state.backup_encodings.get(&profile.name) {
        Some(BackupEntry::Cached(text)) => return Ok((text.clone(), false)),
        Some(BackupEntry::Failed) if profile.cache_only => {
            return Err(EngineError::Token {
                reason: format!("cache-only profile {} already failed", profile.name),
            });
        }
        _ => {}
    }

    match fetch_backup_manifest(state, deps, &profile.name).await {
        Ok(text) => {
            state
                .backup_encodings
                .insert(profile.name.clone(), BackupEntry::Cached(text.clone()));
            Ok((text, true))
        }
        Err(e) => {
            state
                .backup_encodings
                .insert(profile.name.clone(), BackupEntry::Failed);
            Err(e)
        }
    }
}

async fn fetch_backup_manifest(
    state: &StreamState,
    deps: &NegotiatorDeps<'_>,
    profile: &str,
) -> Result<String, EngineError> {
    let response = deps
        .token_client
        .request_token(deps.session, &state.channel_name, profile)
        .await?;
    if !response.is_success() {
        return Err(EngineError::Token {
            reason: format!("token endpoint answered HTTP {}", response.status),
        });
    }
    let token = parse_playback_token(&response.body)?;

    let url = usher_url(&state.channel_name, &state.usher_params, &token)?;
    let response = deps.fetcher.fetch(FetchRequest::get(url.clone())).await?;
    if !response.is_success() {
        return Err(EngineError::HttpStatus {
            status: response.status,
            url,
        });
    }
    Ok(response.body)
}

/// Builds the profile-specific manifest location: carried-over usher params
/// plus the fresh token/signature pair.
fn usher_url(
    channel: &str,
    usher_params: &str,
    token: &PlaybackToken,
) -> Result<String, EngineError> {
    let mut url = Url::parse(&format!("{USHER_BASE}/{channel}.m3u8"))?;
    if !usher_params.is_empty() {
        url.set_query(Some(usher_params));
    }
    url.query_pairs_mut()
        .append_pair("token", &token.value)
        .append_pair("sig", &token.signature)
        .append_pair("player", "twitchweb");
    Ok(url.into())
}
