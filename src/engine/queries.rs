use chrono::NaiveDate;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::pricing::CostBreakdown;

use super::availability::free_windows;
use super::conflict::{find_conflict, is_available};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let resource_id = self.get_resource_for_booking(&id)?;
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        guard.booking(&id).cloned()
    }

    pub async fn get_resource_info(&self, id: Ulid) -> Option<ResourceInfo> {
        let rs = self.get_resource(&id)?;
        let guard = rs.read().await;
        Some(guard.info.clone())
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            out.push(rs.read().await.info.clone());
        }
        out
    }

    pub async fn bookings_for_resource(&self, resource_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.bookings.clone())
    }

    /// Every booking touching the UTC calendar day, cancelled ones included.
    pub async fn bookings_on_date(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.overlapping(&Span::day(date)).cloned().collect())
    }

    pub async fn active_bookings_for_holder(&self, holder: &Holder) -> Vec<Booking> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.state.is_active() && b.holder == *holder)
                    .cloned(),
            );
        }
        out.sort_by_key(|b| b.span.start);
        out
    }

    /// Bookings past due right now, whether or not the sweep has marked them yet.
    pub async fn overdue_bookings(&self) -> Vec<Booking> {
        let now = self.now();
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter(|b| b.is_overdue(now)).cloned());
        }
        out.sort_by_key(|b| b.due_at());
        out
    }

    /// Does an active booking other than `exclude` overlap `span`?
    pub async fn has_conflict(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(find_conflict(&guard, &span, exclude, self.now()).is_some())
    }

    pub async fn is_available(&self, resource_id: Ulid, span: Span) -> Result<bool, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(is_available(&guard, &span, self.now()))
    }

    /// Alternatives for a rejected request: resources of the same kind (and
    /// category, if given) that could take `span` right now.
    pub async fn find_available_resources(
        &self,
        kind: ResourceKind,
        category: Option<&str>,
        span: Span,
    ) -> Vec<ResourceInfo> {
        let now = self.now();
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            if guard.info.kind != kind {
                continue;
            }
            if let Some(c) = category
                && guard.info.category.as_deref() != Some(c)
            {
                continue;
            }
            if is_available(&guard, &span, now) {
                out.push(guard.info.clone());
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn free_windows(
        &self,
        resource_id: Ulid,
        window: Span,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(free_windows(&guard, &window, min_duration, self.now()))
    }

    /// Borrowed gear whose agreed return date has passed.
    pub async fn resources_needing_return(&self) -> Vec<ResourceInfo> {
        let now = self.now();
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            if let Ownership::OnLoan {
                return_due: Some(due),
                ..
            } = guard.info.ownership
                && due < now
            {
                out.push(guard.info.clone());
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// Price preview without touching the ledger.
    pub async fn quote(&self, holder: &Holder, span: Span) -> Result<CostBreakdown, EngineError> {
        Ok(self.calculator.quote(self.ledger.as_ref(), holder, &span).await?)
    }

    /// Rewrite the WAL as a snapshot of current state. Resource creation is
    /// held off and every resource stays read-locked until the rewrite lands,
    /// so no write slips in between.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rs) = self.get_resource(&id) {
                guards.push(rs.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ResourceCreated {
                resource: guard.info.clone(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
