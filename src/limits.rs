use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Longest single reservation: 366 days.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_REQUESTERS: usize = 1_000_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 10_000;
pub const MAX_IN_CLAUSE_IDS: usize = 1_000;

pub const MAX_CATEGORY_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
