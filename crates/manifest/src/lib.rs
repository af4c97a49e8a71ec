//! HLS playlist text handling.
//!
//! Everything in this crate operates on playlist *text*, line by line. The
//! consumers of this crate rewrite live playlists and must hand back anything
//! they did not touch byte-for-byte, so there is deliberately no parse/emit
//! round-trip through a playlist AST here.

pub mod attr;
pub mod error;
pub mod media;
pub mod resolution;
pub mod variant;

pub use attr::parse_attribute_list;
pub use error::ManifestError;
pub use media::{
    EXTINF_TAG, PREFETCH_TAG, SESSION_DATA_TAG, TWITCH_INFO_TAG, is_extinf, prefetch_url,
    rewrite_attribute, server_time,
};
pub use resolution::Resolution;
pub use variant::{STREAM_INF_TAG, VariantInfo, is_hevc_codecs, parse_master_playlist, select_variant};
