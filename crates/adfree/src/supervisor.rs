use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{SessionState, Settings, Toggles};
use crate::error::EngineError;
use crate::messages::{ContextMessage, MessageKey, RECOGNIZED_KEYS};

/// Inline bootstrap fragments known to fight over the same player hooks.
/// A context bootstrapped with one of these would corrupt shared session
/// state, so creation is refused outright.
const CONFLICT_MARKERS: &[&str] = &["twitch-videoad", "ttv-ublock", "isVariantA"];

/// Everything a new execution context needs to start: its URL, a snapshot of
/// the current session and toggles, and host-supplied extras. Logic is
/// compiled in; only configuration crosses this boundary.
#[derive(Debug, Clone, Serialize)]
pub struct Bootstrap {
    pub url: String,
    pub session: SessionState,
    pub toggles: Toggles,
    pub extra: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

/// Channel ends of one live context, as handed back by the factory.
pub struct ContextHandle {
    /// Supervisor-to-context messages.
    pub outbound: mpsc::Sender<ContextMessage>,
    /// Context-to-supervisor messages. Closing this is a crash.
    pub inbound: mpsc::Receiver<ContextMessage>,
    /// Fired once when the supervisor retires the context.
    pub terminate: oneshot::Sender<()>,
}

/// Spawns isolated execution contexts.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn create(&self, bootstrap: Bootstrap) -> Result<ContextHandle, EngineError>;
}

struct TrackedContext {
    id: u64,
    url: String,
    extra: HashMap<String, String>,
    script: Option<String>,
    crashes: u32,
    outbound: mpsc::Sender<ContextMessage>,
    terminate: Option<oneshot::Sender<()>>,
    stop: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Inner {
    // Insertion order doubles as the eviction order.
    contexts: VecDeque<TrackedContext>,
}

/// Supervises execution contexts: bounded FIFO tracking, crash restarts with
/// exponential backoff, and session-state fan-out between contexts.
///
/// The inner lock is never held across an await; all channel sends from
/// under it are `try_send`.
#[derive(Clone)]
pub struct ContextSupervisor {
    factory: Arc<dyn ContextFactory>,
    session: Arc<Mutex<SessionState>>,
    toggles: Arc<Mutex<Toggles>>,
    settings: Settings,
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
    ads_blocked_tx: Arc<watch::Sender<u64>>,
    lifecycle_tx: mpsc::UnboundedSender<ContextMessage>,
}

impl ContextSupervisor {
    /// Returns the supervisor plus the channel on which ad lifecycle and
    /// player-control messages surface to the host.
    pub fn new(
        factory: Arc<dyn ContextFactory>,
        session: Arc<Mutex<SessionState>>,
        toggles: Arc<Mutex<Toggles>>,
        settings: Settings,
        ads_blocked_tx: Arc<watch::Sender<u64>>,
    ) -> (Self, mpsc::UnboundedReceiver<ContextMessage>) {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            factory,
            session,
            toggles,
            settings,
            inner: Arc::new(Mutex::new(Inner::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            ads_blocked_tx,
            lifecycle_tx,
        };
        (supervisor, lifecycle_rx)
    }

    pub fn context_count(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    /// Creates and tracks a new context. Evicts the oldest tracked context
    /// first when at capacity.
    pub async fn create_context(
        &self,
        url: &str,
        opts: HashMap<String, String>,
        script: Option<String>,
    ) -> Result<u64, EngineError> {
        if let Some(script_text) = &script
            && let Some(marker) = CONFLICT_MARKERS
                .iter()
                .find(|m| script_text.contains(*m))
        {
            warn!(url, marker, "refusing conflicting bootstrap script");
            return Err(EngineError::ContextRejected {
                reason: format!("bootstrap script conflicts with {marker}"),
            });
        }

        // Host extras must not collide with the message vocabulary.
        let extra: HashMap<String, String> = opts
            .into_iter()
            .filter(|(key, _)| {
                let recognized = RECOGNIZED_KEYS.contains(&key.as_str());
                if recognized {
                    debug!(key, "dropping bootstrap field shadowing a message key");
                }
                !recognized
            })
            .collect();

        self.evict_to_fit();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.spawn_context(id, url.to_string(), extra, script, 0)
            .await?;
        info!(id, url, "execution context created");
        Ok(id)
    }

    async fn spawn_context(
        &self,
        id: u64,
        url: String,
        extra: HashMap<String, String>,
        script: Option<String>,
        crashes: u32,
    ) -> Result<(), EngineError> {
        let bootstrap = Bootstrap {
            url: url.clone(),
            session: self.session.lock().clone(),
            toggles: self.toggles.lock().clone(),
            extra: extra.clone(),
            script: script.clone(),
        };
        let handle = self.factory.create(bootstrap).await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        self.inner.lock().contexts.push_back(TrackedContext {
            id,
            url,
            extra,
            script,
            crashes,
            outbound: handle.outbound,
            terminate: Some(handle.terminate),
            stop: Some(stop_tx),
        });

        let supervisor = self.clone();
        tokio::spawn(monitor_context(supervisor, id, handle.inbound, stop_rx));
        Ok(())
    }

    fn evict_to_fit(&self) {
        let mut inner = self.inner.lock();
        while inner.contexts.len() >= self.settings.context_capacity {
            if let Some(mut oldest) = inner.contexts.pop_front() {
                warn!(id = oldest.id, url = %oldest.url, "evicting oldest execution context");
                if let Some(stop) = oldest.stop.take() {
                    let _ = stop.send(());
                }
                if let Some(terminate) = oldest.terminate.take() {
                    let _ = terminate.send(());
                }
            }
        }
    }

    fn handle_message(&self, source_id: u64, message: ContextMessage) {
        use MessageKey::*;
        match message.key {
            UpdateClientVersion => {
                self.session.lock().client_version = message.value.clone();
                self.broadcast(message, Some(source_id));
            }
            UpdateClientSession => {
                self.session.lock().client_session = message.value.clone();
                self.broadcast(message, Some(source_id));
            }
            UpdateClientId => {
                self.session.lock().client_id = message.value.clone();
                self.broadcast(message, Some(source_id));
            }
            UpdateDeviceId => {
                if let Some(value) = &message.value {
                    self.session.lock().device_id = value.clone();
                }
                self.broadcast(message, Some(source_id));
            }
            UpdateClientIntegrityHeader => {
                self.session.lock().client_integrity = message.value.clone();
                self.broadcast(message, Some(source_id));
            }
            UpdateAuthorizationHeader => {
                self.session.lock().authorization = message.value.clone();
                self.broadcast(message, Some(source_id));
            }
            UpdateGQLHash => {
                self.session.lock().gql_token_hash = message.value.clone();
                self.broadcast(message, Some(source_id));
            }
            UpdateToggleState => {
                match message
                    .value
                    .as_deref()
                    .map(serde_json::from_str::<Toggles>)
                {
                    Some(Ok(toggles)) => {
                        *self.toggles.lock() = toggles;
                        self.broadcast(message, Some(source_id));
                    }
                    _ => debug!(source_id, "ignoring malformed toggle update"),
                }
            }
            UpdateAdsBlocked => {
                if let Some(count) = message.count {
                    self.session.lock().ads_blocked = count;
                    self.ads_blocked_tx.send_replace(count);
                }
                self.broadcast(message, Some(source_id));
            }
            AdBlocked => {
                self.record_ad_blocked();
            }
            AdDetected | AdEnded | ReloadPlayer | PauseResumePlayer
            | TriggeredPlayerReload => {
                let _ = self.lifecycle_tx.send(message);
            }
        }
    }

    /// Increments the shared ads-blocked counter, publishes the new value on
    /// the watch channel, and fans it out to every live context. Counter
    /// mutations always travel as messages; contexts share no memory.
    pub fn record_ad_blocked(&self) -> u64 {
        let count = {
            let mut session = self.session.lock();
            session.ads_blocked += 1;
            session.ads_blocked
        };
        self.ads_blocked_tx.send_replace(count);
        self.broadcast(ContextMessage::ads_blocked(count), None);
        count
    }

    /// Sends a message to every live context, skipping `skip` when given.
    fn broadcast(&self, message: ContextMessage, skip: Option<u64>) {
        let inner = self.inner.lock();
        for context in &inner.contexts {
            if Some(context.id) == skip {
                continue;
            }
            if context.outbound.try_send(message.clone()).is_err() {
                debug!(id = context.id, "context outbound queue full, message dropped");
            }
        }
    }

    fn handle_crash(&self, id: u64) {
        let record = {
            let mut inner = self.inner.lock();
            let position = inner.contexts.iter().position(|c| c.id == id);
            position.and_then(|p| inner.contexts.remove(p))
        };
        // Deliberately evicted contexts are already gone from the set.
        let Some(record) = record else { return };

        let crashes = record.crashes + 1;
        if crashes > self.settings.max_restart_attempts {
            error!(
                id,
                url = %record.url,
                crashes,
                "execution context crashed past the restart limit, abandoning"
            );
            return;
        }

        let delay = self.settings.restart_backoff_base * 2u32.pow(crashes - 1);
        warn!(id, url = %record.url, crashes, ?delay, "execution context crashed, restarting");

        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = supervisor
                .spawn_context(id, record.url.clone(), record.extra, record.script, crashes)
                .await
            {
                error!(id, url = %record.url, error = %e, "context restart failed");
                // A failed recreation counts as a crash of its own. Put a
                // tombstone back so the bookkeeping in handle_crash applies.
                supervisor.inner.lock().contexts.push_back(TrackedContext {
                    id,
                    url: record.url,
                    extra: HashMap::new(),
                    script: None,
                    crashes,
                    outbound: mpsc::channel(1).0,
                    terminate: None,
                    stop: None,
                });
                supervisor.handle_crash(id);
            }
        });
    }
}

async fn monitor_context(
    supervisor: ContextSupervisor,
    id: u64,
    mut inbound: mpsc::Receiver<ContextMessage>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!(id, "context monitor stopped");
                return;
            }
            message = inbound.recv() => match message {
                Some(message) => supervisor.handle_message(id, message),
                None => {
                    supervisor.handle_crash(id);
                    return;
                }
            },
        }
    }
}
