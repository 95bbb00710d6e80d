//! Shared state of the configuration engine.
//!
//! `Core` owns the per-kind indexes (under one config lock), the change
//! debouncer, and the snapshot publication slot. Event handlers mutate the
//! indexes through [`Core::update`]; the request path reads the published
//! snapshot without taking any lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::apis::reconcile;
use crate::apis::state::ClusterState;
use crate::config::Snapshot;
use crate::error::Error;

/// A static backend definition from the `--custom` flag, overriding whatever
/// the cluster publishes for its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomBackend {
    pub host: String,
    pub path: String,
    pub target: String,
}

/// Parse the `--custom` flag: `host[/path]:ip:port,...`
pub fn parse_custom_backends(spec: &str) -> Result<Vec<CustomBackend>, Error> {
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    spec.split(',')
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').collect();
            if parts.len() != 3 {
                return Err(Error::BadCustomBackend(entry.to_string()));
            }

            let (host, path) = match parts[0].split_once('/') {
                Some((host, path)) => (host.to_string(), format!("/{path}")),
                None => (parts[0].to_string(), String::new()),
            };

            Ok(CustomBackend {
                host,
                path,
                target: format!("{}:{}", parts[1], parts[2]),
            })
        })
        .collect()
}

pub struct Core {
    /// The config lock: indexes mutated by event handlers, read by the
    /// reconciler. Never held across an await point.
    state: Mutex<ClusterState>,

    // Debouncer sequence pair: every change bumps `change_seq`; an apply
    // task publishes only when `applied_seq` still lags its own sequence,
    // and afterwards marks everything seen so far as applied.
    change_seq: AtomicU64,
    applied_seq: AtomicU64,
    reconcile_count: AtomicU64,

    apply_delay: Duration,
    custom: Vec<CustomBackend>,

    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
}

impl Core {
    pub fn new(apply_delay: Duration, custom: Vec<CustomBackend>) -> Arc<Self> {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot::default()));

        Arc::new(Self {
            state: Mutex::new(ClusterState::default()),
            change_seq: AtomicU64::new(0),
            applied_seq: AtomicU64::new(0),
            reconcile_count: AtomicU64::new(0),
            apply_delay,
            custom,
            snapshot_tx,
            snapshot_rx,
        })
    }

    /// The currently published snapshot (atomic read, no lock).
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// A receiver on the publication slot, for readers that resolve the
    /// snapshot themselves (the TLS terminator).
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_rx.clone()
    }

    /// Number of reconciles performed since startup.
    pub fn reconcile_count(&self) -> u64 {
        self.reconcile_count.load(Ordering::Relaxed)
    }

    /// Mutate the indexes under the config lock and request a reconcile.
    pub fn update(self: &Arc<Self>, mutate: impl FnOnce(&mut ClusterState)) {
        {
            let mut state = self.state.lock().expect("config lock poisoned");
            mutate(&mut state);
        }
        self.notify_changed();
    }

    /// Request a reconcile without mutating anything (resync tick).
    pub fn notify_changed(self: &Arc<Self>) {
        let seq = self.change_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let core = self.clone();
        tokio::spawn(async move { core.apply_change(seq).await });
    }

    /// Deferred apply: wait out the quiet window, then reconcile once for
    /// every change that landed inside it.
    async fn apply_change(&self, seq: u64) {
        tokio::time::sleep(self.apply_delay).await;

        if self.applied_seq.load(Ordering::SeqCst) >= seq {
            return; // a later task already applied this change
        }

        let state = self.state.lock().expect("config lock poisoned");

        if self.applied_seq.load(Ordering::SeqCst) >= seq {
            return;
        }

        let snapshot = reconcile::build_snapshot(&state, &self.custom);
        self.snapshot_tx.send_replace(Arc::new(snapshot));
        self.reconcile_count.fetch_add(1, Ordering::Relaxed);

        // Mark the *current* sequence applied: events that landed during the
        // sleep mutated the indexes we just read.
        self.applied_seq
            .store(self.change_seq.load(Ordering::SeqCst), Ordering::SeqCst);

        debug!(
            applied = self.applied_seq.load(Ordering::SeqCst),
            reconciles = self.reconcile_count.load(Ordering::Relaxed),
            "configuration applied"
        );
    }
}
