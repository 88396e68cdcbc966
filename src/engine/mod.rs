//! The reservation engine: availability resolution and the reservation
//! transaction, both running against an injected [`ScheduleStore`].

mod availability;
mod error;
mod request;
mod reserve;

pub use availability::free_capacity;
pub use error::EngineError;
pub use request::{AvailabilityQuery, ReservationDraft, ReserveRequest, parse_date, parse_timestamp, parse_ulid};

use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;

use crate::store::ScheduleStore;

pub struct Engine {
    store: Arc<dyn ScheduleStore>,
    /// Offset of the schedule's wall clock.
    tz: FixedOffset,
    /// Default deadline for a reservation to get through its lock.
    lock_timeout: Duration,
}

impl Engine {
    pub fn new(store: Arc<dyn ScheduleStore>, tz: FixedOffset, lock_timeout: Duration) -> Self {
        Self {
            store,
            tz,
            lock_timeout,
        }
    }

    pub fn tz(&self) -> &FixedOffset {
        &self.tz
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}
