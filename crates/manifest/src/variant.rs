use tracing::debug;

use crate::attr::parse_attribute_list;
use crate::resolution::Resolution;

pub const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF:";

/// One rendition advertised by a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantInfo {
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f64>,
    pub codecs: String,
    pub url: String,
}

/// Returns true when a CODECS attribute value advertises an HEVC rendition.
pub fn is_hevc_codecs(codecs: &str) -> bool {
    codecs.split(',').any(|c| {
        let c = c.trim();
        c.starts_with("hvc1") || c.starts_with("hev1")
    })
}

/// Scans a master playlist for `#EXT-X-STREAM-INF` tag + URL line pairs.
///
/// A stream-inf tag whose following URL line is missing (end of input or
/// another tag in its place) is skipped rather than reported as an error; a
/// malformed pair must never take the rest of the playlist down with it.
pub fn parse_master_playlist(text: &str) -> Vec<VariantInfo> {
    let lines: Vec<&str> = text.lines().collect();
    let mut variants = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].trim();
        let Some(rest) = line.strip_prefix(STREAM_INF_TAG) else {
            i += 1;
            continue;
        };
        let attrs = parse_attribute_list(rest);

        // The variant URL is the next non-blank line; hitting another tag
        // first means the pair is malformed.
        let mut j = i + 1;
        let mut url = None;
        while j < lines.len() {
            let candidate = lines[j].trim();
            if candidate.is_empty() {
                j += 1;
                continue;
            }
            if !candidate.starts_with('#') {
                url = Some(candidate.to_string());
            }
            break;
        }

        let Some(url) = url else {
            debug!(line = %line, "skipping stream-inf tag without a variant URL");
            i += 1;
            continue;
        };

        variants.push(VariantInfo {
            resolution: attrs.get("RESOLUTION").and_then(|r| r.parse().ok()),
            frame_rate: attrs.get("FRAME-RATE").and_then(|f| f.parse().ok()),
            codecs: attrs.get("CODECS").cloned().unwrap_or_default(),
            url,
        });
        i = j + 1;
    }

    variants
}

/// Picks the variant best matching a target resolution.
///
/// An exact resolution match whose frame rate also matches short-circuits
/// immediately. Otherwise the first exact resolution match wins, and failing
/// that, the variant minimizing absolute pixel-count difference (ties broken
/// by first occurrence). Variants without resolution metadata are never
/// selected.
pub fn select_variant<'a>(
    variants: &'a [VariantInfo],
    target: Resolution,
    target_fps: Option<f64>,
) -> Option<&'a VariantInfo> {
    let mut exact: Option<&VariantInfo> = None;
    let mut closest: Option<(&VariantInfo, u64)> = None;

    for variant in variants {
        let Some(resolution) = variant.resolution else {
            continue;
        };
        if resolution == target {
            if let (Some(want), Some(have)) = (target_fps, variant.frame_rate)
                && (want - have).abs() < 0.01
            {
                return Some(variant);
            }
            if exact.is_none() {
                exact = Some(variant);
            }
        }
        let distance = resolution.pixels().abs_diff(target.pixels());
        match closest {
            Some((_, best)) if distance >= best => {}
            _ => closest = Some((variant, distance)),
        }
    }

    exact.or(closest.map(|(variant, _)| variant))
}
