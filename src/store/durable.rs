use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedRwLockReadGuard, RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::{EntityStore, InMemoryStore, StoreError};

#[cfg(test)]
pub(crate) struct HeldWriter {
    wal: Wal,
    rx: mpsc::Receiver<WalCommand>,
}

#[cfg(test)]
impl HeldWriter {
    /// Start writing, queued commands first.
    pub(crate) fn resume(self) {
        tokio::spawn(wal_writer_loop(self.wal, self.rx));
    }
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }
                commit_batch(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// A claimed row waiting for its WAL append to be acknowledged.
enum Pending {
    Resource(Resource),
    Reservation(Reservation),
}

impl Pending {
    fn event(&self) -> Event {
        match self {
            Pending::Resource(r) => Event::from(r),
            Pending::Reservation(r) => Event::from(r),
        }
    }

    /// Resource whose rows the outcome affects.
    fn resource_id(&self) -> Ulid {
        match self {
            Pending::Resource(r) => r.id,
            Pending::Reservation(r) => r.resource_id,
        }
    }

    fn commit(self, index: &InMemoryStore) {
        match self {
            Pending::Resource(r) => index.commit_resource(r),
            Pending::Reservation(r) => index.commit_reservation(r),
        }
    }

    fn release(self, index: &InMemoryStore) {
        match self {
            Pending::Resource(r) => index.release_resource(&r),
            Pending::Reservation(r) => index.release_reservation(&r),
        }
    }
}

/// [`InMemoryStore`] index made durable by a write-ahead log.
///
/// A row is claimed in the index, logged, and only then committed, so readers
/// never see a row the log does not hold. Must be opened inside a tokio
/// runtime: the WAL writer runs as a spawned task.
///
/// An append that outlives the storage timeout is still in the writer's
/// queue, so its claim is kept and settled in the background once the writer
/// answers. Until then the affected resource is in doubt and its reservation
/// list cannot be read.
pub struct DurableStore {
    index: Arc<InMemoryStore>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Appends hold it shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss an in-flight append.
    compaction: Arc<RwLock<()>>,
    /// Resource id -> number of timed-out appends not yet acknowledged.
    in_doubt: Arc<DashMap<Ulid, usize>>,
    storage_timeout: Duration,
}

impl DurableStore {
    pub fn open(wal_path: &Path, storage_timeout: Duration) -> io::Result<Self> {
        let (store, wal, wal_rx) = Self::open_detached(wal_path, storage_timeout)?;
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        Ok(store)
    }

    /// Replay the log and build the store, leaving the writer for the caller to start.
    fn open_detached(
        wal_path: &Path,
        storage_timeout: Duration,
    ) -> io::Result<(Self, Wal, mpsc::Receiver<WalCommand>)> {
        let events = Wal::replay(wal_path)?;
        let index = InMemoryStore::new();
        for event in &events {
            if let Err(e) = index.apply_event(event) {
                warn!(path = %wal_path.display(), "skipping inconsistent WAL record: {e}");
            }
        }
        info!(
            path = %wal_path.display(),
            resources = index.resource_count(),
            events = events.len(),
            "replayed WAL"
        );

        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        let store = Self {
            index: Arc::new(index),
            wal_tx,
            compaction: Arc::new(RwLock::new(())),
            in_doubt: Arc::new(DashMap::new()),
            storage_timeout,
        };
        Ok((store, wal, wal_rx))
    }

    /// Open with a writer that does nothing until [`HeldWriter::resume`].
    #[cfg(test)]
    pub(crate) fn open_held(wal_path: &Path, storage_timeout: Duration) -> io::Result<(Self, HeldWriter)> {
        let (store, wal, rx) = Self::open_detached(wal_path, storage_timeout)?;
        Ok((store, HeldWriter { wal, rx }))
    }

    /// Round-trip a command through the writer task, bounded by the storage timeout.
    async fn call_writer<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        let round_trip = async {
            self.wal_tx
                .send(make(tx))
                .await
                .map_err(|_| StoreError::Closed)?;
            rx.await.map_err(|_| StoreError::Closed)
        };
        tokio::time::timeout(self.storage_timeout, round_trip)
            .await
            .map_err(|_| StoreError::Timeout(self.storage_timeout))?
    }

    /// Log an already claimed row and commit or release it by the outcome.
    async fn log_claimed(&self, pending: Pending, shared: OwnedRwLockReadGuard<()>) -> Result<(), StoreError> {
        let deadline = tokio::time::Instant::now() + self.storage_timeout;
        let (tx, mut rx) = oneshot::channel();
        let command = WalCommand::Append {
            event: pending.event(),
            response: tx,
        };

        // A send dropped at the deadline never reaches the queue.
        match tokio::time::timeout_at(deadline, self.wal_tx.send(command)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                pending.release(&self.index);
                return Err(StoreError::Closed);
            }
            Err(_) => {
                pending.release(&self.index);
                return Err(StoreError::Timeout(self.storage_timeout));
            }
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(Ok(()))) => {
                pending.commit(&self.index);
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                pending.release(&self.index);
                Err(e.into())
            }
            Ok(Err(_)) => {
                pending.release(&self.index);
                Err(StoreError::Closed)
            }
            Err(_) => {
                self.settle_later(pending, rx, shared);
                Err(StoreError::Timeout(self.storage_timeout))
            }
        }
    }

    /// The append is queued and will be written whatever the caller does, so
    /// keep the claim and let the writer's answer decide.
    fn settle_later(
        &self,
        pending: Pending,
        rx: oneshot::Receiver<io::Result<()>>,
        shared: OwnedRwLockReadGuard<()>,
    ) {
        let resource_id = pending.resource_id();
        *self.in_doubt.entry(resource_id).or_insert(0) += 1;
        warn!(%resource_id, timeout = ?self.storage_timeout, "WAL append timed out, settling in background");

        let index = self.index.clone();
        let in_doubt = self.in_doubt.clone();
        tokio::spawn(async move {
            // Compaction waits for this append too.
            let _shared = shared;
            match rx.await {
                Ok(Ok(())) => pending.commit(&index),
                Ok(Err(e)) => {
                    warn!(%resource_id, "late WAL append failed: {e}");
                    pending.release(&index);
                }
                Err(_) => pending.release(&index),
            }
            if let Entry::Occupied(mut count) = in_doubt.entry(resource_id) {
                *count.get_mut() -= 1;
                if *count.get() == 0 {
                    count.remove();
                }
            }
            info!(%resource_id, "settled timed-out WAL append");
        });
    }

    /// Timed-out appends the writer has not answered yet.
    pub fn unsettled_appends(&self) -> usize {
        self.in_doubt.iter().map(|e| *e.value()).sum()
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.compaction.write().await;
        let events = self.index.snapshot_events();
        let count = events.len();
        self.call_writer(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(StoreError::from)?;
        info!(events = count, "compacted WAL");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.call_writer(|response| WalCommand::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}

#[async_trait]
impl EntityStore for DurableStore {
    async fn insert_resource(&self, resource: Resource) -> Result<(), StoreError> {
        let shared = self.compaction.clone().read_owned().await;
        self.index.claim_resource(&resource)?;
        self.log_claimed(Pending::Resource(resource), shared).await
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        let shared = self.compaction.clone().read_owned().await;
        self.index.claim_reservation(&reservation)?;
        self.log_claimed(Pending::Reservation(reservation), shared).await
    }

    async fn resource_by_id(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        Ok(self.index.get_resource(&id))
    }

    async fn all_resources(&self) -> Result<Vec<Resource>, StoreError> {
        Ok(self.index.list_resources())
    }

    async fn resources_by_name_prefix(&self, prefix: &str) -> Result<Vec<Resource>, StoreError> {
        Ok(self.index.find_resources_by_prefix(prefix))
    }

    async fn resource_count(&self) -> Result<usize, StoreError> {
        Ok(self.index.resource_count())
    }

    async fn reservations_by_resource(&self, resource_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        if self.in_doubt.contains_key(&resource_id) {
            return Err(StoreError::InDoubt(resource_id));
        }
        Ok(self.index.reservations_for(&resource_id))
    }

    async fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.index.list_reservations())
    }

    async fn reservation_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.index.get_reservation(&id))
    }
}
