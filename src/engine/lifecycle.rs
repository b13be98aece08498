use crate::model::*;

use super::EngineError;

/// What a caller hands over with a transition.
#[derive(Debug, Clone, Default)]
pub(crate) struct Handoff {
    pub condition: Option<Condition>,
    pub damage_notes: Option<String>,
}

/// Reject writes computed from an outdated read of the booking.
pub(crate) fn check_version(current: &Booking, seen: &Booking) -> Result<(), EngineError> {
    if current.version != seen.version {
        return Err(EngineError::StaleBooking {
            booking_id: current.id,
            seen: seen.version,
            current: current.version,
        });
    }
    Ok(())
}

/// The one guard every cancel path goes through. Possession outranks the
/// state table, so this is checked before legality.
pub(crate) fn check_cancellable(booking: &Booking) -> Result<(), EngineError> {
    if booking.checked_out_at.is_some() {
        return Err(EngineError::CannotCancelAfterCheckout(booking.id));
    }
    check_legal(booking, BookingState::Cancelled)
}

pub(crate) fn check_legal(booking: &Booking, to: BookingState) -> Result<(), EngineError> {
    if booking.state.can_transition_to(to) {
        return Ok(());
    }
    Err(EngineError::IllegalStateTransition {
        booking_id: booking.id,
        from: booking.state,
        to,
    })
}

/// Run every guard for `booking -> to` and build the event that records it.
pub(crate) fn transition_event(
    booking: &Booking,
    to: BookingState,
    at: Ms,
    handoff: Handoff,
) -> Result<Event, EngineError> {
    if to == BookingState::Cancelled {
        check_cancellable(booking)?;
        return Ok(Event::BookingCancelled {
            id: booking.id,
            resource_id: booking.resource_id,
            at,
            refunded_units: booking.free_units_used,
        });
    }
    check_legal(booking, to)?;

    let missing = || EngineError::MissingCondition {
        booking_id: booking.id,
        state: to,
    };
    let event = match to {
        // First possession stamps and records condition; re-entry after a
        // rescheduled drop-off keeps both.
        BookingState::CheckedOut if booking.checked_out_at.is_none() => Event::BookingCheckedOut {
            id: booking.id,
            resource_id: booking.resource_id,
            at,
            condition_out: handoff.condition.ok_or_else(missing)?,
        },
        BookingState::CheckedOut if booking.condition_out.is_none() && handoff.condition.is_none() => {
            return Err(missing());
        }
        BookingState::Returned => Event::BookingReturned {
            id: booking.id,
            resource_id: booking.resource_id,
            at,
            condition_in: handoff.condition.ok_or_else(missing)?,
            damage_notes: handoff.damage_notes,
        },
        BookingState::Overdue => Event::BookingOverdue {
            id: booking.id,
            resource_id: booking.resource_id,
            at,
        },
        _ => Event::BookingAdvanced {
            id: booking.id,
            resource_id: booking.resource_id,
            to,
            at,
        },
    };
    Ok(event)
}

/// The remaining legal path from `from` to `Returned`, or `None` if the
/// booking is not in possession.
pub(crate) fn return_path(from: BookingState) -> Option<&'static [BookingState]> {
    use BookingState::*;
    match from {
        CheckedOut | Overdue => Some(&[DropoffScheduled, StaffProcessingReturn, Returned]),
        DropoffScheduled => Some(&[StaffProcessingReturn, Returned]),
        StaffProcessingReturn => Some(&[Returned]),
        _ => None,
    }
}

/// The legal path a fresh booking walks to reach `CheckedOut`.
pub(crate) const PICKUP_PATH: [BookingState; 3] = [
    BookingState::StaffPreparing,
    BookingState::ReadyForPickup,
    BookingState::CheckedOut,
];
