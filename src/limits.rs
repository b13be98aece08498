use crate::model::Ms;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// No single booking may claim a resource for more than a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 86_400_000;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 86_400_000;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
