use ulid::Ulid;

use crate::model::{ReservationStatus, ResourceStatus};

/// Every way a booking-engine operation can fail.
///
/// Business outcomes (`InvalidInterval` through `OverlapConflict`, plus the
/// lookup and transition errors) go straight back to the caller. `LockTimeout`
/// and `StorageFailure` are infrastructure failures; nothing is left
/// half-written when they occur, so the caller may resubmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    InvalidInterval(&'static str),
    RequesterNotFound(Ulid),
    ResourceNotFound(Ulid),
    ReservationNotFound(Ulid),
    ResourceUnavailable { id: Ulid, status: ResourceStatus },
    OverlapConflict(Ulid),
    AlreadyExists(Ulid),
    InvalidTransition { id: Ulid, status: ReservationStatus },
    NotOwner(Ulid),
    LockTimeout(Ulid),
    LimitExceeded(&'static str),
    StorageFailure(String),
}

impl BookingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::LockTimeout(_) | BookingError::StorageFailure(_))
    }

    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::InvalidInterval(_) => "invalid_interval",
            BookingError::RequesterNotFound(_) => "requester_not_found",
            BookingError::ResourceNotFound(_) => "resource_not_found",
            BookingError::ReservationNotFound(_) => "reservation_not_found",
            BookingError::ResourceUnavailable { .. } => "resource_unavailable",
            BookingError::OverlapConflict(_) => "overlap_conflict",
            BookingError::AlreadyExists(_) => "already_exists",
            BookingError::InvalidTransition { .. } => "invalid_transition",
            BookingError::NotOwner(_) => "not_owner",
            BookingError::LockTimeout(_) => "lock_timeout",
            BookingError::LimitExceeded(_) => "limit_exceeded",
            BookingError::StorageFailure(_) => "storage_failure",
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::InvalidInterval(why) => write!(f, "invalid interval: {why}"),
            BookingError::RequesterNotFound(id) => write!(f, "requester not found: {id}"),
            BookingError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            BookingError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            BookingError::ResourceUnavailable { id, status } => {
                write!(f, "resource {id} is not available (status {status})")
            }
            BookingError::OverlapConflict(id) => {
                write!(f, "overlaps active reservation: {id}")
            }
            BookingError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            BookingError::InvalidTransition { id, status } => {
                write!(f, "reservation {id} is {status}, expected ACTIVE")
            }
            BookingError::NotOwner(id) => {
                write!(f, "reservation {id} belongs to another requester")
            }
            BookingError::LockTimeout(id) => {
                write!(f, "timed out waiting for resource {id}")
            }
            BookingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            BookingError::StorageFailure(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}
