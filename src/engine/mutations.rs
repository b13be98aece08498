use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::ledger::CreditType;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::pricing::CostBreakdown;

use super::conflict::{check_admits, check_no_conflict, validate_span};
use super::lifecycle::{check_version, return_path, transition_event, Handoff, PICKUP_PATH};
use super::{Engine, EngineError};

/// Outcome of one overdue pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverdueSweep {
    pub marked: usize,
    pub already_overdue: usize,
    pub failed: usize,
}

fn validate_terms(holder: &Holder, terms: &BookingTerms) -> Result<(), EngineError> {
    if let Holder::Guest(name) = holder
        && name.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("guest name too long"));
    }
    if let Some(ref n) = terms.notes
        && n.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

fn count_rejection<T>(result: Result<T, EngineError>) -> Result<T, EngineError> {
    if let Err(ref e) = result {
        metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "reason" => e.label())
            .increment(1);
    }
    result
}

impl Engine {
    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, info: ResourceInfo) -> Result<(), EngineError> {
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if info.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN)
            || info.category.as_ref().is_some_and(|c| c.len() > MAX_NAME_LEN)
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        let _catalog = self.catalog.read().await;
        if self.state.contains_key(&info.id) {
            return Err(EngineError::AlreadyExists(info.id));
        }

        let id = info.id;
        let event = Event::ResourceCreated {
            resource: info.clone(),
        };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(ResourceState::new(info))));
        metrics::gauge!(observability::RESOURCES_ACTIVE).set(self.state.len() as f64);
        self.notify.send(&event);
        info!("resource {id} created");
        Ok(())
    }

    /// Staff-controlled status. `CheckedOut` follows bookings and is refused
    /// here; asking for `Available` while gear is out keeps `CheckedOut`.
    pub async fn set_resource_status(
        &self,
        id: Ulid,
        status: OperationalStatus,
    ) -> Result<(), EngineError> {
        if status == OperationalStatus::CheckedOut {
            return Err(EngineError::DerivedStatus(status));
        }
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        let status = if status == OperationalStatus::Available && guard.gear_out(None) {
            OperationalStatus::CheckedOut
        } else {
            status
        };
        let event = Event::ResourceStatusChanged { id, status };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("resource {id} status -> {status}");
        Ok(())
    }

    pub async fn set_loanable(&self, id: Ulid, loanable: bool) -> Result<(), EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        let event = Event::ResourceLoanableChanged { id, loanable };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn set_condition(&self, id: Ulid, condition: Condition) -> Result<(), EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        let event = Event::ResourceConditionSet { id, condition };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Hand borrowed gear back to its owner. Independent of the booking state
    /// machine, but refused while any booking still claims the resource.
    pub async fn mark_returned_to_owner(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if !matches!(guard.info.ownership, Ownership::OnLoan { .. }) {
            return Err(EngineError::NotOnLoan(id));
        }
        if guard.bookings.iter().any(|b| b.state.is_active()) {
            return Err(EngineError::HasActiveBookings(id));
        }
        let event = Event::ResourceReturnedToOwner { id, at: self.now() };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("resource {id} returned to owner");
        Ok(guard.info.clone())
    }

    // ── Booking creation ─────────────────────────────────────

    /// Reserve `resource_id` for `span`. Conflict check, credit deduction and
    /// journal append all happen under the resource's write lock.
    pub async fn create_booking(
        &self,
        resource_id: Ulid,
        holder: Holder,
        span: Span,
        terms: BookingTerms,
    ) -> Result<Booking, EngineError> {
        count_rejection(self.try_create_booking(resource_id, holder, span, terms).await)
    }

    async fn try_create_booking(
        &self,
        resource_id: Ulid,
        holder: Holder,
        span: Span,
        terms: BookingTerms,
    ) -> Result<Booking, EngineError> {
        validate_terms(&holder, &terms)?;
        validate_span(&span, self.pricing())?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        self.insert_booking_locked(&mut guard, holder, span, terms).await
    }

    /// Walk-up loan: a booking from now until `due_at`, taken straight
    /// through preparation and pickup to `CheckedOut`.
    pub async fn checkout_to_member(
        &self,
        resource_id: Ulid,
        holder: Holder,
        due_at: Ms,
        condition_out: Condition,
        terms: BookingTerms,
    ) -> Result<Booking, EngineError> {
        count_rejection(
            self.try_checkout_to_member(resource_id, holder, due_at, condition_out, terms)
                .await,
        )
    }

    async fn try_checkout_to_member(
        &self,
        resource_id: Ulid,
        holder: Holder,
        due_at: Ms,
        condition_out: Condition,
        terms: BookingTerms,
    ) -> Result<Booking, EngineError> {
        validate_terms(&holder, &terms)?;
        let span = Span::try_new(self.now(), due_at)?;
        validate_span(&span, self.pricing())?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        let mut booking = self.insert_booking_locked(&mut guard, holder, span, terms).await?;
        for to in PICKUP_PATH {
            let handoff = Handoff {
                condition: Some(condition_out),
                damage_notes: None,
            };
            booking = self.advance_locked(&mut guard, booking.id, to, handoff).await?;
        }
        Ok(booking)
    }

    async fn insert_booking_locked(
        &self,
        rs: &mut ResourceState,
        holder: Holder,
        span: Span,
        terms: BookingTerms,
    ) -> Result<Booking, EngineError> {
        if rs.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many bookings on resource"));
        }
        check_admits(rs)?;
        check_no_conflict(rs, &span, None, self.now())?;

        let id = Ulid::new();
        let cost = self.charge(&holder, &span, id).await?;
        let booking = Booking {
            id,
            resource_id: rs.id(),
            holder,
            span,
            state: BookingState::Requested,
            checked_out_at: None,
            returned_at: None,
            condition_out: None,
            condition_in: None,
            damage_notes: None,
            security_deposit: terms.security_deposit,
            rental_fee: terms.rental_fee,
            free_units_used: cost.free_blocks,
            paid_amount: cost.cost_cents,
            notes: terms.notes,
            created_at: self.now(),
            version: 0,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        if let Err(e) = self.persist_and_apply(rs, &event).await {
            self.refund_units(&booking.holder, cost.free_blocks, "booking was not recorded")
                .await;
            return Err(e);
        }
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            "booking {id} on {} for {} {}: {} free blocks, {} cents",
            booking.resource_id, booking.holder, booking.span, cost.free_blocks, cost.cost_cents
        );
        Ok(booking)
    }

    // ── Credit movements ─────────────────────────────────────

    async fn charge(
        &self,
        holder: &Holder,
        span: &Span,
        booking_id: Ulid,
    ) -> Result<CostBreakdown, EngineError> {
        let cost = self
            .calculator
            .quote(self.ledger.as_ref(), holder, span)
            .await?;
        if let Some(member) = holder.member_id()
            && cost.free_blocks > 0
        {
            self.ledger
                .deduct(
                    member,
                    cost.free_blocks,
                    &CreditType::FreeHours,
                    &format!("booking {booking_id}"),
                )
                .await?;
            metrics::counter!(observability::CREDIT_BLOCKS_DEDUCTED_TOTAL)
                .increment(u64::from(cost.free_blocks));
        }
        Ok(cost)
    }

    async fn refund_units(&self, holder: &Holder, blocks: u32, reason: &str) {
        let Some(member) = holder.member_id() else { return };
        if blocks == 0 {
            return;
        }
        if let Err(e) = self
            .ledger
            .refund(member, blocks, &CreditType::FreeHours, reason)
            .await
        {
            warn!("failed to refund {blocks} blocks to {member}: {e}");
        }
    }

    /// Take back blocks that were refunded ahead of an operation that then failed.
    async fn restore_units(&self, holder: &Holder, blocks: u32, reason: &str) {
        let Some(member) = holder.member_id() else { return };
        if blocks == 0 {
            return;
        }
        if let Err(e) = self
            .ledger
            .deduct(member, blocks, &CreditType::FreeHours, reason)
            .await
        {
            warn!("failed to restore {blocks} blocks for {member}: {e}");
        }
    }

    // ── Transitions ──────────────────────────────────────────

    async fn advance_locked(
        &self,
        rs: &mut ResourceState,
        id: Ulid,
        to: BookingState,
        handoff: Handoff,
    ) -> Result<Booking, EngineError> {
        let current = rs.booking(&id).ok_or(EngineError::NotFound(id))?;
        let from = current.state;
        let event = transition_event(current, to, self.now(), handoff)?;
        self.persist_and_apply(rs, &event).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        debug!("booking {id}: {from} -> {to}");
        rs.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Guarded single-step transition of a booking the caller read earlier.
    /// Guards run against the stored booking first, so a cancel on gear that
    /// has since been checked out reports that, not a version mismatch.
    async fn transition(
        &self,
        seen: &Booking,
        to: BookingState,
        handoff: Handoff,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(&seen.id).await?;
        let current = guard.booking(&seen.id).ok_or(EngineError::NotFound(seen.id))?;
        let event = transition_event(current, to, self.now(), handoff)?;
        check_version(current, seen)?;
        let from = current.state;
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        debug!("booking {}: {from} -> {to}", seen.id);
        guard
            .booking(&seen.id)
            .cloned()
            .ok_or(EngineError::NotFound(seen.id))
    }

    pub async fn start_preparing(&self, seen: &Booking) -> Result<Booking, EngineError> {
        self.transition(seen, BookingState::StaffPreparing, Handoff::default())
            .await
    }

    pub async fn mark_ready(&self, seen: &Booking) -> Result<Booking, EngineError> {
        self.transition(seen, BookingState::ReadyForPickup, Handoff::default())
            .await
    }

    pub async fn checkout(
        &self,
        seen: &Booking,
        condition_out: Condition,
    ) -> Result<Booking, EngineError> {
        let handoff = Handoff {
            condition: Some(condition_out),
            damage_notes: None,
        };
        self.transition(seen, BookingState::CheckedOut, handoff).await
    }

    pub async fn schedule_dropoff(&self, seen: &Booking) -> Result<Booking, EngineError> {
        self.transition(seen, BookingState::DropoffScheduled, Handoff::default())
            .await
    }

    /// The holder missed the drop-off; the gear stays checked out.
    pub async fn reschedule_dropoff(&self, seen: &Booking) -> Result<Booking, EngineError> {
        self.transition(seen, BookingState::CheckedOut, Handoff::default())
            .await
    }

    pub async fn begin_return_processing(&self, seen: &Booking) -> Result<Booking, EngineError> {
        self.transition(seen, BookingState::StaffProcessingReturn, Handoff::default())
            .await
    }

    /// Cancel a booking that has not been picked up. Consumed credit goes back.
    pub async fn cancel(&self, seen: &Booking) -> Result<Booking, EngineError> {
        let booking = self
            .transition(seen, BookingState::Cancelled, Handoff::default())
            .await?;
        self.refund_units(
            &booking.holder,
            booking.free_units_used,
            &format!("booking {} cancelled", booking.id),
        )
        .await;
        info!("booking {} cancelled", booking.id);
        Ok(booking)
    }

    /// Take the gear back in: walks whatever is left of the return chain,
    /// records `condition_in` on the booking and the resource, then lets the
    /// damage assessor pull the resource from circulation.
    pub async fn process_return(
        &self,
        seen: &Booking,
        condition_in: Condition,
        damage_notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        if damage_notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("damage notes too long"));
        }
        let mut guard = self.resolve_booking_write(&seen.id).await?;
        let current = guard.booking(&seen.id).ok_or(EngineError::NotFound(seen.id))?;
        let path = return_path(current.state).ok_or(EngineError::IllegalStateTransition {
            booking_id: seen.id,
            from: current.state,
            to: BookingState::Returned,
        })?;
        check_version(current, seen)?;

        let mut booking = None;
        for &to in path {
            let handoff = if to == BookingState::Returned {
                Handoff {
                    condition: Some(condition_in),
                    damage_notes: damage_notes.clone(),
                }
            } else {
                Handoff::default()
            };
            booking = Some(self.advance_locked(&mut guard, seen.id, to, handoff).await?);
        }
        let booking = booking.ok_or(EngineError::NotFound(seen.id))?;

        if let Some(status) =
            self.assessor
                .assess(&guard.info, condition_in, damage_notes.as_deref())
            && status != guard.info.status
        {
            let event = Event::ResourceStatusChanged {
                id: guard.id(),
                status,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            info!("resource {} moved to {status} after return", guard.id());
        }
        info!("booking {} returned in {condition_in:?} condition", booking.id);
        Ok(booking)
    }

    /// Move a booking that has not been picked up to a new span. Checked
    /// against every other booking on the resource; the old credit
    /// consumption is refunded and the new one charged.
    pub async fn reschedule(&self, seen: &Booking, span: Span) -> Result<Booking, EngineError> {
        validate_span(&span, self.pricing())?;
        let mut guard = self.resolve_booking_write(&seen.id).await?;
        let current = guard
            .booking(&seen.id)
            .cloned()
            .ok_or(EngineError::NotFound(seen.id))?;
        if current.checked_out_at.is_some() {
            return Err(EngineError::CannotRescheduleAfterCheckout(current.id));
        }
        if current.state.is_terminal() {
            return Err(EngineError::IllegalStateTransition {
                booking_id: current.id,
                from: current.state,
                to: BookingState::Requested,
            });
        }
        check_version(&current, seen)?;
        check_admits(&guard)?;
        check_no_conflict(&guard, &span, Some(current.id), self.now())?;

        let reason = format!("booking {} rescheduled", current.id);
        self.refund_units(&current.holder, current.free_units_used, &reason)
            .await;
        let cost = match self.charge(&current.holder, &span, current.id).await {
            Ok(cost) => cost,
            Err(e) => {
                self.restore_units(&current.holder, current.free_units_used, &reason)
                    .await;
                return Err(e);
            }
        };

        let event = Event::BookingRescheduled {
            id: current.id,
            resource_id: current.resource_id,
            span,
            free_units_used: cost.free_blocks,
            paid_amount: cost.cost_cents,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.refund_units(&current.holder, cost.free_blocks, &reason)
                .await;
            self.restore_units(&current.holder, current.free_units_used, &reason)
                .await;
            return Err(e);
        }
        info!("booking {} moved from {} to {span}", current.id, current.span);
        guard
            .booking(&current.id)
            .cloned()
            .ok_or(EngineError::NotFound(current.id))
    }

    // ── Sweep ────────────────────────────────────────────────

    /// Materialize the overdue predicate for one booking. `Ok(false)` when
    /// there was nothing to do, which makes repeated sweeps harmless.
    pub async fn mark_booking_overdue(&self, id: Ulid) -> Result<bool, EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let now = self.now();
        let current = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if !current.needs_overdue_mark(now) {
            return Ok(false);
        }
        let event = transition_event(current, BookingState::Overdue, now, Handoff::default())?;
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::SWEEP_OVERDUE_MARKED_TOTAL).increment(1);
        info!("booking {id} is overdue");
        Ok(true)
    }

    /// Mark every checked-out booking past its due time as overdue.
    /// Failures are logged and counted; the pass continues.
    pub async fn mark_overdue(&self) -> OverdueSweep {
        let now = self.now();
        let mut report = OverdueSweep::default();
        let mut candidates = Vec::new();

        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.read().await;
            for b in &guard.bookings {
                if b.needs_overdue_mark(now) {
                    candidates.push(b.id);
                } else if b.state == BookingState::Overdue {
                    report.already_overdue += 1;
                }
            }
        }

        for id in candidates {
            match self.mark_booking_overdue(id).await {
                Ok(true) => report.marked += 1,
                Ok(false) => report.already_overdue += 1,
                Err(e) => {
                    warn!("overdue sweep skipped booking {id}: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
