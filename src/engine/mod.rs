mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use mutations::OverdueSweep;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::damage::{DamageAssessor, NoAssessment};
use crate::ledger::{CreditLedger, InMemoryLedger};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::pricing::{CostCalculator, PricingConfig};
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// The services the engine consumes but does not own.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub ledger: Arc<dyn CreditLedger>,
    pub pricing: PricingConfig,
    pub assessor: Arc<dyn DamageAssessor>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            ledger: Arc::new(InMemoryLedger::new()),
            pricing: PricingConfig::default(),
            assessor: Arc::new(NoAssessment),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// one fsync for the lot.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so partial bytes never leak into the
    // next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking service: one lock per resource, conflict check, credit
/// deduction and journal append all under that lock.
pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → resource id
    pub(super) booking_to_resource: DashMap<Ulid, Ulid>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) ledger: Arc<dyn CreditLedger>,
    pub(super) calculator: CostCalculator,
    pub(super) assessor: Arc<dyn DamageAssessor>,
    /// Shared by resource creation, exclusive for compaction, so a snapshot
    /// never misses a resource journaled while it was being taken.
    pub(super) catalog: RwLock<()>,
}

/// Apply an event directly to a ResourceState (caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, booking_map: &DashMap<Ulid, Ulid>) {
    match event {
        // Inserted at the DashMap level, not here
        Event::ResourceCreated { .. } => {}
        Event::ResourceStatusChanged { status, .. } => rs.info.status = *status,
        Event::ResourceLoanableChanged { loanable, .. } => rs.info.loanable = *loanable,
        Event::ResourceConditionSet { condition, .. } => rs.info.condition = Some(*condition),
        Event::ResourceReturnedToOwner { at, .. } => {
            if let Ownership::OnLoan { owner, .. } = &rs.info.ownership {
                rs.info.ownership = Ownership::ReturnedToOwner {
                    owner: owner.clone(),
                    at: *at,
                };
            }
            rs.info.loanable = false;
        }
        Event::BookingCreated { booking } => {
            booking_map.insert(booking.id, booking.resource_id);
            rs.insert_booking(booking.clone());
        }
        Event::BookingAdvanced { id, to, .. } => {
            if let Some(b) = rs.booking_mut(id) {
                b.state = *to;
                b.version += 1;
            }
        }
        Event::BookingCheckedOut {
            id,
            at,
            condition_out,
            ..
        } => {
            if let Some(b) = rs.booking_mut(id) {
                b.state = BookingState::CheckedOut;
                b.checked_out_at.get_or_insert(*at);
                b.condition_out = Some(*condition_out);
                b.version += 1;
            }
            if rs.info.status == OperationalStatus::Available {
                rs.info.status = OperationalStatus::CheckedOut;
            }
        }
        Event::BookingReturned {
            id,
            at,
            condition_in,
            damage_notes,
            ..
        } => {
            if let Some(b) = rs.booking_mut(id) {
                b.state = BookingState::Returned;
                b.returned_at = Some(*at);
                b.condition_in = Some(*condition_in);
                b.damage_notes = damage_notes.clone();
                b.version += 1;
            }
            rs.info.condition = Some(*condition_in);
            if rs.info.status == OperationalStatus::CheckedOut && !rs.gear_out(None) {
                rs.info.status = OperationalStatus::Available;
            }
        }
        Event::BookingOverdue { id, .. } => {
            if let Some(b) = rs.booking_mut(id) {
                b.state = BookingState::Overdue;
                b.version += 1;
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = rs.booking_mut(id) {
                b.state = BookingState::Cancelled;
                b.version += 1;
            }
        }
        Event::BookingRescheduled {
            id,
            span,
            free_units_used,
            paid_amount,
            ..
        } => {
            if let Some(b) = rs.booking_mut(id) {
                b.span = *span;
                b.free_units_used = *free_units_used;
                b.paid_amount = *paid_amount;
                b.version += 1;
            }
            rs.resort_booking(*id);
        }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        collaborators: Collaborators,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let Collaborators {
            clock,
            ledger,
            pricing,
            assessor,
        } = collaborators;
        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_resource: DashMap::new(),
            clock,
            ledger,
            calculator: CostCalculator::new(pricing),
            assessor,
            catalog: RwLock::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds; blocking_write would panic inside an async context.
        for event in &events {
            if let Event::ResourceCreated { resource } = event {
                let rs = ResourceState::new(resource.clone());
                engine.state.insert(resource.id, Arc::new(RwLock::new(rs)));
                continue;
            }
            let Some(entry) = engine.state.get(&event.resource_id()) else {
                warn!("replay: event for unknown resource {}", event.resource_id());
                continue;
            };
            let rs = entry.value().clone();
            drop(entry);
            match rs.try_write() {
                Ok(mut guard) => apply_to_resource(&mut guard, event, &engine.booking_to_resource),
                Err(_) => warn!("replay: resource {} unexpectedly locked", event.resource_id()),
            }
        }

        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn pricing(&self) -> &PricingConfig {
        self.calculator.config()
    }

    pub fn ledger(&self) -> &Arc<dyn CreditLedger> {
        &self.ledger
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_resource.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.booking_to_resource);
        self.notify.send(event);
        Ok(())
    }

    /// Lookup booking → resource, get resource, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let resource_id = self
            .get_resource_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        Ok(rs.write_owned().await)
    }
}
