//! Ad-stripping and backup-negotiation engine for live HLS streams.
//!
//! The engine sits between a player and its CDN: master playlists register
//! per-channel stream state, media playlists are scanned for stitched ad
//! breaks, and an ad break is answered either by negotiating an ad-free
//! backup rendition of the same stream (through alternate authorization
//! profiles) or by stripping the ad segments out in place. A bounded
//! registry caps per-channel state, a TTL cache remembers known ad segment
//! URLs, and a supervisor keeps isolated player contexts alive and in sync.

pub mod ad_cache;
pub mod api;
pub mod config;
pub mod error;
pub mod fetch;
pub mod messages;
pub mod negotiator;
pub mod registry;
pub mod rewriter;
pub mod supervisor;
pub mod token;

#[cfg(test)]
mod test_support;

pub use ad_cache::{SegmentAdCache, SharedSegmentAdCache};
pub use api::Engine;
pub use config::{BackupProfile, SessionState, Settings, Toggles};
pub use error::EngineError;
pub use fetch::{FetchRequest, FetchResponse, Fetcher, HttpFetcher};
pub use messages::{ContextMessage, MessageKey};
pub use negotiator::NegotiationOutcome;
pub use registry::{StreamRegistry, StreamState};
pub use supervisor::{Bootstrap, ContextFactory, ContextHandle, ContextSupervisor};
pub use token::{PlaybackToken, TokenClient};
