use thiserror::Error;
use ulid::Ulid;

use crate::ledger::LedgerError;
use crate::model::{BookingState, InvalidSpan, OperationalStatus, Span};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("resource {resource_id} is unavailable (loanable: {loanable}, status: {status})")]
    UnavailableResource {
        resource_id: Ulid,
        loanable: bool,
        status: OperationalStatus,
    },

    #[error("resource {resource_id} is already booked for {span} by booking {conflicting}")]
    SchedulingConflict {
        resource_id: Ulid,
        span: Span,
        conflicting: Ulid,
    },

    #[error("booking {booking_id}: illegal transition {from} -> {to}")]
    IllegalStateTransition {
        booking_id: Ulid,
        from: BookingState,
        to: BookingState,
    },

    #[error("booking {0}: equipment already checked out, it must be returned instead")]
    CannotCancelAfterCheckout(Ulid),

    #[error("booking {0}: equipment already checked out, the interval can no longer change")]
    CannotRescheduleAfterCheckout(Ulid),

    #[error("insufficient credit for {member}: needed {requested} blocks, {available} available")]
    InsufficientCredit {
        member: Ulid,
        requested: u32,
        available: u32,
    },

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("booking {booking_id}: entering {state} requires a recorded condition")]
    MissingCondition {
        booking_id: Ulid,
        state: BookingState,
    },

    #[error("booking {booking_id} changed since it was read (version {seen}, now {current})")]
    StaleBooking {
        booking_id: Ulid,
        seen: u64,
        current: u64,
    },

    #[error("status {0} is derived from bookings and cannot be set directly")]
    DerivedStatus(OperationalStatus),

    #[error("resource {0} is not on loan to the organization")]
    NotOnLoan(Ulid),

    #[error("resource {0} still has active bookings")]
    HasActiveBookings(Ulid),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl From<InvalidSpan> for EngineError {
    fn from(e: InvalidSpan) -> Self {
        EngineError::InvalidInterval(e.to_string())
    }
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientCredit {
                member,
                requested,
                available,
            } => EngineError::InsufficientCredit {
                member,
                requested,
                available,
            },
            LedgerError::Backend(msg) => EngineError::Ledger(msg),
        }
    }
}

impl EngineError {
    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::UnavailableResource { .. } => "unavailable_resource",
            EngineError::SchedulingConflict { .. } => "scheduling_conflict",
            EngineError::IllegalStateTransition { .. } => "illegal_state_transition",
            EngineError::CannotCancelAfterCheckout(_) => "cannot_cancel_after_checkout",
            EngineError::CannotRescheduleAfterCheckout(_) => "cannot_reschedule_after_checkout",
            EngineError::InsufficientCredit { .. } => "insufficient_credit",
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::MissingCondition { .. } => "missing_condition",
            EngineError::StaleBooking { .. } => "stale_booking",
            EngineError::DerivedStatus(_) => "derived_status",
            EngineError::NotOnLoan(_) => "not_on_loan",
            EngineError::HasActiveBookings(_) => "has_active_bookings",
            EngineError::Ledger(_) => "ledger",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
