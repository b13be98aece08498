use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// `NaiveDate::num_days_from_ce()` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid interval [{start}, {end}): end must be after start")]
pub struct InvalidSpan {
    pub start: Ms,
    pub end: Ms,
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Result<Self, InvalidSpan> {
        if end <= start {
            return Err(InvalidSpan { start, end });
        }
        Ok(Self { start, end })
    }

    /// The UTC calendar day `[00:00, 24:00)` containing `date`.
    pub fn day(date: NaiveDate) -> Self {
        let start = (i64::from(date.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE) * DAY_MS;
        Self::new(start, start + DAY_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn on_date(&self, date: NaiveDate) -> bool {
        self.overlaps(&Span::day(date))
    }

}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Who holds a booking: a member account or a walk-in guest known only by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Holder {
    Registered(Ulid),
    Guest(String),
}

impl Holder {
    pub fn member_id(&self) -> Option<Ulid> {
        match self {
            Holder::Registered(id) => Some(*id),
            Holder::Guest(_) => None,
        }
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::Registered(id) => write!(f, "member {id}"),
            Holder::Guest(name) => write!(f, "guest {name:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Space,
    Equipment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationalStatus {
    Available,
    Maintenance,
    Retired,
    /// Set by checkout, cleared by return.
    CheckedOut,
}

impl OperationalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationalStatus::Available => "available",
            OperationalStatus::Maintenance => "maintenance",
            OperationalStatus::Retired => "retired",
            OperationalStatus::CheckedOut => "checked_out",
        }
    }
}

impl fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical condition recorded at handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Condition {
    Excellent,
    Good,
    Fair,
    Poor,
    Damaged,
}

/// Who owns the resource. Gear lent *to* the organization must go back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    Owned,
    OnLoan { owner: String, return_due: Option<Ms> },
    ReturnedToOwner { owner: String, at: Ms },
}

// ── Booking state machine ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingState {
    Requested,
    StaffPreparing,
    ReadyForPickup,
    CheckedOut,
    Overdue,
    DropoffScheduled,
    StaffProcessingReturn,
    Returned,
    Cancelled,
}

impl BookingState {
    /// The legal successors of each state. Anything not listed is rejected.
    pub fn allowed_targets(self) -> &'static [BookingState] {
        use BookingState::*;
        match self {
            Requested => &[StaffPreparing, Cancelled],
            StaffPreparing => &[ReadyForPickup, Cancelled],
            ReadyForPickup => &[CheckedOut, Cancelled],
            CheckedOut => &[DropoffScheduled, Overdue],
            Overdue => &[DropoffScheduled],
            DropoffScheduled => &[StaffProcessingReturn, CheckedOut],
            StaffProcessingReturn => &[Returned],
            Returned | Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, to: BookingState) -> bool {
        self.allowed_targets().contains(&to)
    }

    /// Active bookings hold their interval against the resource.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingState::Returned | BookingState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingState::Requested => "requested",
            BookingState::StaffPreparing => "staff_preparing",
            BookingState::ReadyForPickup => "ready_for_pickup",
            BookingState::CheckedOut => "checked_out",
            BookingState::Overdue => "overdue",
            BookingState::DropoffScheduled => "dropoff_scheduled",
            BookingState::StaffProcessingReturn => "staff_processing_return",
            BookingState::Returned => "returned",
            BookingState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claim by a holder on one resource for one span.
///
/// `span.start` is the reservation start, `span.end` the due time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub holder: Holder,
    pub span: Span,
    pub state: BookingState,
    pub checked_out_at: Option<Ms>,
    pub returned_at: Option<Ms>,
    pub condition_out: Option<Condition>,
    pub condition_in: Option<Condition>,
    pub damage_notes: Option<String>,
    /// Cents.
    pub security_deposit: Option<i64>,
    /// Cents.
    pub rental_fee: Option<i64>,
    /// Credit blocks consumed at creation (or last reschedule).
    pub free_units_used: u32,
    /// Cents charged for the hours credit did not cover.
    pub paid_amount: i64,
    pub notes: Option<String>,
    pub created_at: Ms,
    /// Bumped on every mutation; used to reject writes based on a stale read.
    pub version: u64,
}

impl Booking {
    pub fn reserved_from(&self) -> Ms {
        self.span.start
    }

    pub fn due_at(&self) -> Ms {
        self.span.end
    }

    /// The gear has left and has not come back.
    pub fn in_possession(&self) -> bool {
        self.checked_out_at.is_some() && self.returned_at.is_none()
    }

    /// The time the booking actually claims. Gear still out at or past its
    /// due time keeps the resource through `now` inclusive.
    pub fn occupied_span(&self, now: Ms) -> Span {
        if self.in_possession() && now >= self.span.end {
            Span::new(self.span.start, now.saturating_add(1))
        } else {
            self.span
        }
    }

    /// Checked out, past due, and not yet marked overdue by the sweep.
    pub fn needs_overdue_mark(&self, now: Ms) -> bool {
        self.state == BookingState::CheckedOut && self.due_at() < now && self.returned_at.is_none()
    }

    pub fn is_overdue(&self, now: Ms) -> bool {
        self.needs_overdue_mark(now)
            || (self.state == BookingState::Overdue && self.returned_at.is_none())
    }

    /// Whole days past due, zero when not overdue.
    pub fn days_overdue(&self, now: Ms) -> u32 {
        if !self.is_overdue(now) || now <= self.due_at() {
            return 0;
        }
        u32::try_from((now - self.due_at()) / DAY_MS).unwrap_or(u32::MAX)
    }
}

/// Optional money and notes attached when a booking is made.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingTerms {
    /// Cents.
    pub security_deposit: Option<i64>,
    /// Cents.
    pub rental_fee: Option<i64>,
    pub notes: Option<String>,
}

/// Static attributes of a resource, as created and as reported by queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub kind: ResourceKind,
    pub category: Option<String>,
    /// Administrative kill switch, independent of `status`.
    pub loanable: bool,
    pub status: OperationalStatus,
    pub condition: Option<Condition>,
    pub ownership: Ownership,
}

impl ResourceInfo {
    pub fn new(id: Ulid, kind: ResourceKind) -> Self {
        Self {
            id,
            name: None,
            kind,
            category: None,
            loanable: true,
            status: OperationalStatus::Available,
            condition: None,
            ownership: Ownership::Owned,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub info: ResourceInfo,
    /// All bookings ever made on this resource, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(info: ResourceInfo) -> Self {
        Self {
            info,
            bookings: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.info.id
    }

    /// Administrative check only; overlapping claims are checked separately.
    /// `CheckedOut` still admits claims on other intervals.
    pub fn admits_bookings(&self) -> bool {
        self.info.loanable
            && matches!(
                self.info.status,
                OperationalStatus::Available | OperationalStatus::CheckedOut
            )
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Remove and re-insert so the sort order follows a changed span.
    pub fn resort_booking(&mut self, id: Ulid) {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            let booking = self.bookings.remove(pos);
            self.insert_booking(booking);
        }
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.state.is_active())
    }

    /// Any booking other than `except` whose gear is out right now.
    pub fn gear_out(&self, except: Option<Ulid>) -> bool {
        self.bookings
            .iter()
            .any(|b| Some(b.id) != except && b.in_possession())
    }

    /// Active bookings claiming part of `query` once overrun loans are
    /// stretched to `now`.
    pub fn occupying(&self, query: &Span, now: Ms) -> impl Iterator<Item = &Booking> {
        let overrun = self
            .bookings
            .iter()
            .filter(move |b| b.in_possession() && b.span.end <= now)
            .filter(move |b| b.occupied_span(now).overlaps(query));
        self.active_overlapping(query)
            .chain(overrun.filter(move |b| !b.span.overlaps(query)))
    }
}

/// The event types: flat, no nesting beyond snapshots. This is both the
/// journal record format and the notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        resource: ResourceInfo,
    },
    ResourceStatusChanged {
        id: Ulid,
        status: OperationalStatus,
    },
    ResourceLoanableChanged {
        id: Ulid,
        loanable: bool,
    },
    ResourceConditionSet {
        id: Ulid,
        condition: Condition,
    },
    ResourceReturnedToOwner {
        id: Ulid,
        at: Ms,
    },
    BookingCreated {
        booking: Booking,
    },
    /// A transition that stamps nothing (preparation, drop-off scheduling, ...).
    BookingAdvanced {
        id: Ulid,
        resource_id: Ulid,
        to: BookingState,
        at: Ms,
    },
    BookingCheckedOut {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
        condition_out: Condition,
    },
    BookingReturned {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
        condition_in: Condition,
        damage_notes: Option<String>,
    },
    BookingOverdue {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
        refunded_units: u32,
    },
    BookingRescheduled {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        free_units_used: u32,
        paid_amount: i64,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceCreated { resource } => resource.id,
            Event::ResourceStatusChanged { id, .. }
            | Event::ResourceLoanableChanged { id, .. }
            | Event::ResourceConditionSet { id, .. }
            | Event::ResourceReturnedToOwner { id, .. } => *id,
            Event::BookingCreated { booking } => booking.resource_id,
            Event::BookingAdvanced { resource_id, .. }
            | Event::BookingCheckedOut { resource_id, .. }
            | Event::BookingReturned { resource_id, .. }
            | Event::BookingOverdue { resource_id, .. }
            | Event::BookingCancelled { resource_id, .. }
            | Event::BookingRescheduled { resource_id, .. } => *resource_id,
        }
    }
}
