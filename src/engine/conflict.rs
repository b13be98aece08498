use ulid::Ulid;

use crate::model::*;
use crate::pricing::PricingConfig;

use super::EngineError;

pub(crate) fn validate_span(span: &Span, pricing: &PricingConfig) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.end <= span.start {
        return Err(EngineError::InvalidInterval(format!(
            "end {} is not after start {}",
            span.end, span.start
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    if let Some(min) = pricing.min_duration_ms
        && span.duration_ms() < min
    {
        return Err(EngineError::InvalidInterval(format!(
            "duration {}ms is shorter than the minimum {min}ms",
            span.duration_ms()
        )));
    }
    if let Some(max) = pricing.max_duration_ms
        && span.duration_ms() > max
    {
        return Err(EngineError::InvalidInterval(format!(
            "duration {}ms is longer than the maximum {max}ms",
            span.duration_ms()
        )));
    }
    Ok(())
}

/// Administrative status outranks scheduling: a resource that is not
/// loanable, or is in maintenance or retired, refuses every interval.
pub(crate) fn check_admits(rs: &ResourceState) -> Result<(), EngineError> {
    if rs.admits_bookings() {
        return Ok(());
    }
    Err(EngineError::UnavailableResource {
        resource_id: rs.id(),
        loanable: rs.info.loanable,
        status: rs.info.status,
    })
}

/// First active booking claiming part of `span`, ignoring `exclude`. Gear
/// kept past its due time still claims the resource up to `now`.
pub(crate) fn find_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
    now: Ms,
) -> Option<Ulid> {
    rs.occupying(span, now)
        .find(|b| Some(b.id) != exclude)
        .map(|b| b.id)
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
    now: Ms,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, exclude, now) {
        Some(conflicting) => Err(EngineError::SchedulingConflict {
            resource_id: rs.id(),
            span: *span,
            conflicting,
        }),
        None => Ok(()),
    }
}

pub(crate) fn is_available(rs: &ResourceState, span: &Span, now: Ms) -> bool {
    rs.admits_bookings() && find_conflict(rs, span, None, now).is_none()
}
