use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use ulid::Ulid;

use crate::model::*;
use crate::observability::WINDOW_LOCK_WAIT_SECONDS;
use crate::store::{NewReservation, ScheduleTx, StoreError};

use super::state::WindowLock;
use super::StoreInner;

/// Transaction over a [`super::MemoryStore`].
///
/// The window guard is the row lock. The insert is staged and only becomes
/// visible at commit, which applies it before the guard is released. Dropping
/// the transaction discards the staged insert and releases the guard.
pub(super) struct MemoryTx {
    inner: Arc<StoreInner>,
    window_guard: Option<OwnedMutexGuard<WindowLock>>,
    pending: Option<Reservation>,
}

impl MemoryTx {
    pub(super) fn new(inner: Arc<StoreInner>) -> Self {
        Self {
            inner,
            window_guard: None,
            pending: None,
        }
    }
}

#[async_trait]
impl ScheduleTx for MemoryTx {
    async fn find_bookable_resource(&mut self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        Ok(self.inner.find_bookable_resource(id).await)
    }

    async fn lock_containing_window(
        &mut self,
        resource_id: Ulid,
        day_of_week: u8,
        span: &TimeSpan,
    ) -> Result<Option<AvailabilityWindow>, StoreError> {
        let Some(rs) = self.inner.get_resource(&resource_id) else {
            return Ok(None);
        };

        // A window removed while we queued on its lock comes back retired;
        // look again, the next lookup no longer sees it.
        loop {
            let (window, lock) = {
                let guard = rs.read().await;
                match guard.containing_window(day_of_week, span) {
                    Some(slot) => (slot.window.clone(), slot.lock.clone()),
                    None => return Ok(None),
                }
            };

            let wait_start = Instant::now();
            let window_guard = lock.lock_owned().await;
            metrics::histogram!(WINDOW_LOCK_WAIT_SECONDS).record(wait_start.elapsed().as_secs_f64());

            if window_guard.retired {
                continue;
            }
            self.window_guard = Some(window_guard);
            return Ok(Some(window));
        }
    }

    async fn count_confirmed_overlapping(
        &mut self,
        resource_id: Ulid,
        span: &TimeSpan,
    ) -> Result<u32, StoreError> {
        Ok(self.inner.count_confirmed_overlapping(resource_id, span).await)
    }

    async fn insert_reservation(&mut self, new: NewReservation) -> Result<Reservation, StoreError> {
        if self.window_guard.is_none() {
            return Err(StoreError::Misuse("insert without a window lock"));
        }
        if self.pending.is_some() {
            return Err(StoreError::Misuse("one reservation per transaction"));
        }
        let reservation = Reservation {
            id: new.id,
            resource_id: new.resource_id,
            customer_id: new.customer_id,
            span: new.span,
            status: ReservationStatus::Confirmed,
        };
        self.pending = Some(reservation.clone());
        Ok(reservation)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let Some(reservation) = self.pending.take() else {
            return Ok(());
        };
        let rs = self
            .inner
            .get_resource(&reservation.resource_id)
            .ok_or(StoreError::NotFound(reservation.resource_id))?;
        let event = Event::ReservationConfirmed {
            id: reservation.id,
            resource_id: reservation.resource_id,
            customer_id: reservation.customer_id,
            span: reservation.span,
        };

        let _gate = self.inner.gate().await;
        let mut guard = rs.write().await;
        self.inner.persist_and_apply(&mut guard, &event).await
        // window guard drops with `self`, after the reservation is visible
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
