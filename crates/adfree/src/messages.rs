use serde::{Deserialize, Serialize};

/// Message vocabulary shared between the engine and its execution contexts.
///
/// `Update*` keys mutate shared session state and are re-broadcast to every
/// other live context; the rest are lifecycle notifications that flow up to
/// the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKey {
    UpdateClientVersion,
    UpdateClientSession,
    UpdateClientId,
    UpdateDeviceId,
    UpdateClientIntegrityHeader,
    UpdateAuthorizationHeader,
    UpdateToggleState,
    UpdateAdsBlocked,
    UpdateGQLHash,
    AdBlocked,
    AdDetected,
    AdEnded,
    ReloadPlayer,
    PauseResumePlayer,
    TriggeredPlayerReload,
}

/// Every key name the engine understands. Bootstrap option maps are stripped
/// of keys colliding with these before being handed to a context, so host
/// data can never masquerade as an engine message.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "UpdateClientVersion",
    "UpdateClientSession",
    "UpdateClientId",
    "UpdateDeviceId",
    "UpdateClientIntegrityHeader",
    "UpdateAuthorizationHeader",
    "UpdateToggleState",
    "UpdateAdsBlocked",
    "UpdateGQLHash",
    "AdBlocked",
    "AdDetected",
    "AdEnded",
    "ReloadPlayer",
    "PauseResumePlayer",
    "TriggeredPlayerReload",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub key: MessageKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl ContextMessage {
    pub fn bare(key: MessageKey) -> Self {
        Self {
            key,
            value: None,
            count: None,
            channel: None,
        }
    }

    pub fn with_value(key: MessageKey, value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::bare(key)
        }
    }

    pub fn ads_blocked(count: u64) -> Self {
        Self {
            count: Some(count),
            ..Self::bare(MessageKey::UpdateAdsBlocked)
        }
    }

    pub fn ad_blocked(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::bare(MessageKey::AdBlocked)
        }
    }
}
