use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::observability::RESOLVE_TOTAL;

use super::{AvailabilityQuery, Engine, EngineError};

/// Free capacity of `window` given how many confirmed reservations overlap
/// its span. `None` when nothing is left.
pub fn free_capacity(window: &AvailabilityWindow, confirmed: u32) -> Option<SlotAvailability> {
    let remaining = window.capacity.saturating_sub(confirmed);
    (remaining > 0).then_some(SlotAvailability {
        start_time: window.start_time,
        end_time: window.end_time,
        remaining_capacity: remaining,
    })
}

impl Engine {
    /// Validate a raw query, then resolve it.
    pub async fn availability(
        &self,
        query: &AvailabilityQuery,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        let (resource_id, date) = match query.validate() {
            Ok(v) => v,
            Err(e) => {
                metrics::counter!(RESOLVE_TOTAL, "outcome" => e.kind()).increment(1);
                return Err(e);
            }
        };
        self.resolve(resource_id, date).await
    }

    /// Windows of `resource_id` on `date` that still have room, by start
    /// time. Takes no locks; the answer is a snapshot.
    pub async fn resolve(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        let result = self.resolve_inner(resource_id, date).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(RESOLVE_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Err(e @ EngineError::Internal(_)) => {
                tracing::error!("resolve {resource_id} on {date} failed: {e}")
            }
            Err(e) => tracing::debug!("resolve {resource_id} on {date}: {e}"),
            Ok(slots) => tracing::debug!("resolve {resource_id} on {date}: {} open windows", slots.len()),
        }
        result
    }

    async fn resolve_inner(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        if self.store.find_bookable_resource(resource_id).await?.is_none() {
            return Err(EngineError::NotFound(resource_id));
        }

        let windows = self
            .store
            .windows_for_day(resource_id, day_of_week(date))
            .await?;
        let mut slots = Vec::with_capacity(windows.len());
        for window in &windows {
            let confirmed = self
                .store
                .count_confirmed_overlapping(resource_id, &window.on(date))
                .await?;
            slots.extend(free_capacity(window, confirmed));
        }
        Ok(slots)
    }
}
