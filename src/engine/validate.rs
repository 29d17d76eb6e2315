use crate::limits::*;
use crate::model::*;

use super::BookingError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Turn a requested `[start, end)` into a `Span`, or say why it is unusable.
/// Runs before any store access.
pub fn validate_interval(
    start: Option<Ms>,
    end: Option<Ms>,
    require_future: bool,
    now: Ms,
) -> Result<Span, BookingError> {
    let (Some(start), Some(end)) = (start, end) else {
        return Err(BookingError::InvalidInterval("start and end are required"));
    };
    let span = Span::try_new(start, end)
        .ok_or(BookingError::InvalidInterval("start must be before end"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(BookingError::InvalidInterval("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(BookingError::InvalidInterval("interval too long"));
    }
    // start > now implies end > now
    if require_future && span.start <= now {
        return Err(BookingError::InvalidInterval("interval must be in the future"));
    }
    Ok(span)
}
