/// Registry of sACN sources seen on the discovery group.
///
/// Each universe-discovery page upserts one `Source` keyed by its CID.
/// Sources that stop advertising are dropped by a periodic sweep once they
/// have been silent for the expiry window (60s by default).

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use sacn_protocol::packets::DiscoveryPacket;
use sacn_protocol::{Cid, SOURCE_EXPIRY_SECS, SWEEP_INTERVAL_SECS};

/// Last known state of one remote source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub cid: Cid,
    pub source_name: String,
    pub ip: IpAddr,
    /// Universes from the most recent discovery page
    pub universes: Vec<u16>,
    pub last_seen: Instant,
}

pub type ChangeCallback = Box<dyn Fn(&Source) + Send + Sync>;

pub struct SourceRegistry {
    /// Keyed by canonical CID string; ordered so address lookups are stable
    sources: RwLock<BTreeMap<String, Source>>,
    on_change: RwLock<Option<ChangeCallback>>,
    expiry: Duration,
    cancel: CancellationToken,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::with_expiry(Duration::from_secs(SOURCE_EXPIRY_SECS))
    }

    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            sources: RwLock::new(BTreeMap::new()),
            on_change: RwLock::new(None),
            expiry,
            cancel: CancellationToken::new(),
        }
    }

    /// Install the change subscriber, replacing any previous one.
    ///
    /// The callback runs synchronously after every `observe`, while the
    /// registry's write lock is held. It must not call back into the
    /// registry.
    pub fn subscribe(&self, callback: impl Fn(&Source) + Send + Sync + 'static) {
        *self.on_change.write().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    pub fn unsubscribe(&self) {
        *self.on_change.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn observe(&self, from: SocketAddr, packet: &DiscoveryPacket) {
        self.observe_at(from, packet, Instant::now());
    }

    /// Upsert the source behind `packet`, stamping it as seen at `now`.
    /// Name, address and universe list are replaced wholesale.
    pub fn observe_at(&self, from: SocketAddr, packet: &DiscoveryPacket, now: Instant) {
        let key = packet.cid.to_string();
        let mut sources = self.write_sources();

        let source = sources.entry(key).or_insert_with(|| {
            info!(
                cid = %packet.cid,
                name = %packet.source_name,
                from = %from.ip(),
                "New sACN source discovered"
            );
            Source {
                cid: packet.cid,
                source_name: String::new(),
                ip: from.ip(),
                universes: Vec::new(),
                last_seen: now,
            }
        });

        source.source_name.clone_from(&packet.source_name);
        source.ip = from.ip();
        source.universes.clone_from(&packet.universes);
        source.last_seen = now;

        debug!(
            cid = %packet.cid,
            page = packet.page,
            last_page = packet.last_page,
            universes = packet.universes.len(),
            "Source updated"
        );

        let on_change = self.on_change.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = on_change.as_ref() {
            callback(source);
        }
    }

    pub fn lookup(&self, cid: &Cid) -> Option<Source> {
        self.read_sources().get(&cid.to_string()).cloned()
    }

    /// First source (in CID order) last heard from `ip`.
    pub fn lookup_by_address(&self, ip: IpAddr) -> Option<Source> {
        self.read_sources().values().find(|s| s.ip == ip).cloned()
    }

    pub fn snapshot(&self) -> Vec<Source> {
        self.read_sources().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_sources().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_sources().is_empty()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drop every source silent for at least the expiry window as of `now`.
    /// Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut sources = self.write_sources();
        let before = sources.len();

        sources.retain(|_, source| {
            let alive = now.saturating_duration_since(source.last_seen) < self.expiry;
            if !alive {
                info!(cid = %source.cid, name = %source.source_name, "sACN source expired");
            }
            alive
        });

        before - sources.len()
    }

    /// Spawn the periodic sweep (every 30s). Runs until `stop`.
    pub fn start_expiry(self: &Arc<Self>) -> JoinHandle<()> {
        self.start_expiry_every(Duration::from_secs(SWEEP_INTERVAL_SECS))
    }

    pub fn start_expiry_every(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately; nothing can be stale yet
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = registry.len(), "Expiry sweep");
                        }
                    }
                }
            }

            debug!("Source expiry stopped");
        })
    }

    /// Stop the periodic sweep. Safe to call any number of times.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn read_sources(&self) -> RwLockReadGuard<'_, BTreeMap<String, Source>> {
        self.sources.read().unwrap_or_else(PoisonError::into_inner)
    }

    // A subscriber that panics poisons the lock after the update has
    // already been applied, so the data is still whole.
    fn write_sources(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Source>> {
        self.sources.write().unwrap_or_else(PoisonError::into_inner)
    }
}
