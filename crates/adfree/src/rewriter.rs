use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use manifest::{is_extinf, prefetch_url, rewrite_attribute, server_time};
use tracing::{debug, trace};

use crate::ad_cache::SharedSegmentAdCache;
use crate::config::{
    AD_METADATA_URL_ATTRS, AD_PLACEHOLDER_URL_FRAGMENTS, AD_SIGNIFIER, LIVE_SEGMENT_MARKER,
    NEUTRALIZED_URL, Settings, Toggles,
};
use crate::fetch::{FetchRequest, Fetcher};
use crate::registry::StreamState;

/// Dependencies one rewrite pass needs besides the stream state.
pub struct RewriteContext<'a> {
    pub ad_cache: &'a SharedSegmentAdCache,
    pub fetcher: Arc<dyn Fetcher>,
    pub toggles: Toggles,
    pub settings: &'a Settings,
    pub now: Instant,
}

/// One `#EXTINF` line plus its following segment URL line.
struct SegmentPair {
    extinf_index: usize,
    url_index: usize,
    is_ad: bool,
}

/// Rewrites one live media playlist: neutralizes ad metadata URLs, strips
/// classified ad segment pairs (and stale prefetch hints), and recovers a
/// non-empty playlist when stripping would leave no segments at all.
///
/// The pass is idempotent, and for a playlist without the ad signifier (and
/// no force flags) the output differs from the input only in the neutralized
/// URL attribute values.
pub fn rewrite(state: &mut StreamState, text: &str, ctx: &RewriteContext<'_>) -> String {
    if let Some(ts) = server_time(text) {
        state.last_reload_at = ts;
    } else {
        state.last_reload_at = Utc::now();
    }

    let lines: Vec<String> = text.lines().map(|l| neutralize_line(l)).collect();

    // Pair every EXTINF with its following segment URL line and classify.
    // A trailing EXTINF with no URL line yet is not a pair and is never
    // eligible for stripping; a truncated live edge must stay intact.
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if !is_extinf(&lines[i]) {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        let mut url_index = None;
        while j < lines.len() {
            let candidate = lines[j].trim();
            if candidate.is_empty() {
                j += 1;
                continue;
            }
            if !candidate.starts_with('#') {
                url_index = Some(j);
            }
            break;
        }
        let Some(url_index) = url_index else {
            i += 1;
            continue;
        };
        pairs.push(SegmentPair {
            extinf_index: i,
            url_index,
            is_ad: classify(&lines[i], lines[url_index].trim(), &ctx.toggles),
        });
        i = url_index + 1;
    }

    let has_signifier = text.contains(AD_SIGNIFIER);
    let should_strip =
        (has_signifier || ctx.toggles.force_strip) && pairs.iter().any(|p| p.is_ad);

    if !should_strip {
        state.num_stripped_ad_segments = 0;
        state.is_stripping_ad_segments = false;
        ctx.ad_cache.lock().prune(ctx.now);
        return reassemble(lines.iter().map(String::as_str), text);
    }

    let mut skip: HashSet<usize> = HashSet::new();
    let mut removed: Vec<(String, String)> = Vec::new();
    for pair in pairs.iter().filter(|p| p.is_ad) {
        skip.insert(pair.extinf_index);
        skip.insert(pair.url_index);
        removed.push((
            lines[pair.extinf_index].clone(),
            lines[pair.url_index].clone(),
        ));
    }

    // Drop prefetch hints that point into the ad break.
    {
        let mut cache = ctx.ad_cache.lock();
        for (index, line) in lines.iter().enumerate() {
            let Some(url) = prefetch_url(line) else {
                continue;
            };
            let known_ad = cache.contains(url, ctx.now)
                || AD_PLACEHOLDER_URL_FRAGMENTS.iter().any(|f| url.contains(f));
            if known_ad {
                trace!(url, "removing prefetch hint for ad segment");
                skip.insert(index);
            }
        }
    }

    let mut out: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(index, _)| !skip.contains(index))
        .map(|(_, line)| line.as_str())
        .collect();

    // Recovery: a playlist must never go out empty. Re-append the most
    // recently removed pairs when nothing playable is left.
    let recovery: Vec<(String, String)>;
    if !out.iter().any(|l| is_extinf(l)) {
        let depth = ctx.settings.recovery_buffer_depth;
        let start = removed.len().saturating_sub(depth);
        recovery = removed[start..].to_vec();
        debug!(
            channel = %state.channel_name,
            restored = recovery.len(),
            "stripping emptied the playlist, restoring recovery buffer"
        );
        for (extinf, url) in &recovery {
            out.push(extinf);
            out.push(url);
        }
    }

    drain_and_record(state, &removed, ctx);

    state.num_stripped_ad_segments += removed.len() as u64;
    state.is_stripping_ad_segments = true;
    debug!(
        channel = %state.channel_name,
        stripped = removed.len(),
        total = state.num_stripped_ad_segments,
        "stripped ad segments"
    );

    reassemble(out.into_iter(), text)
}

/// An EXTINF entry is an ad iff it lacks the live marker, or its segment URL
/// is a placeholder/unavailable path, or everything is being treated as ads.
/// Anything ambiguous stays classified as content.
fn classify(extinf_line: &str, url_line: &str, toggles: &Toggles) -> bool {
    if toggles.treat_all_as_ads {
        return true;
    }
    if !extinf_line.contains(LIVE_SEGMENT_MARKER) {
        return true;
    }
    AD_PLACEHOLDER_URL_FRAGMENTS
        .iter()
        .any(|f| url_line.contains(f))
}

fn neutralize_line(line: &str) -> String {
    if !line.starts_with('#') {
        return line.to_string();
    }
    let mut rewritten = line.to_string();
    for attr in AD_METADATA_URL_ATTRS {
        if rewritten.contains(attr) {
            rewritten = rewrite_attribute(&rewritten, attr, NEUTRALIZED_URL);
        }
    }
    rewritten
}

/// Issues one fire-and-forget GET per newly stripped segment so the CDN sees
/// it consumed, and records every stripped URL in the global ad cache.
/// Draining is skipped entirely during a true midroll.
fn drain_and_record(
    state: &mut StreamState,
    removed: &[(String, String)],
    ctx: &RewriteContext<'_>,
) {
    let mut cache = ctx.ad_cache.lock();
    for (_, url) in removed {
        let url = url.trim();
        cache.record(url, ctx.now);
        if state.is_midroll || state.requested_ad_segments.contains(url) {
            continue;
        }
        state.requested_ad_segments.insert(url.to_string());
        let fetcher = ctx.fetcher.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = fetcher.fetch(FetchRequest::get(url.clone())).await {
                trace!(url, error = %e, "ad segment drain request failed");
            }
        });
    }
}

// CRLF playlists stay CRLF; the untouched-output guarantee is byte-level.
fn reassemble<'a>(lines: impl Iterator<Item = &'a str>, original: &str) -> String {
    let eol = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let mut text = lines.collect::<Vec<_>>().join(eol);
    if original.ends_with('\n') && !text.is_empty() {
        text.push_str(eol);
    }
    text
}
