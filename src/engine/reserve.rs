use std::time::{Duration, Instant};

use ulid::Ulid;

use crate::model::*;
use crate::observability::{RESERVATIONS_TOTAL, RESERVE_DURATION_SECONDS};
use crate::store::{NewReservation, ScheduleTx};

use super::{Engine, EngineError, ReservationDraft, ReserveRequest};

impl Engine {
    /// Validate a raw request, then reserve it under the default deadline.
    pub async fn submit(&self, request: &ReserveRequest) -> Result<Reservation, EngineError> {
        let draft = match request.validate(&self.tz) {
            Ok(d) => d,
            Err(e) => {
                metrics::counter!(RESERVATIONS_TOTAL, "outcome" => e.kind()).increment(1);
                tracing::debug!("reserve rejected: {e}");
                return Err(e);
            }
        };
        self.reserve(draft).await
    }

    pub async fn reserve(&self, draft: ReservationDraft) -> Result<Reservation, EngineError> {
        self.reserve_within(draft, self.lock_timeout).await
    }

    /// Lock the containing window, check capacity, insert, commit.
    ///
    /// `deadline` bounds everything up to and including the insert. When it
    /// expires the transaction is dropped, which releases the window lock
    /// and discards the insert. Commit is never interrupted.
    pub async fn reserve_within(
        &self,
        draft: ReservationDraft,
        deadline: Duration,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let resource_id = draft.resource_id();
        let span = draft.span();

        let result = self.run_reserve(draft, deadline).await;

        metrics::histogram!(RESERVE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);

        match &result {
            Ok(r) => tracing::debug!(
                "reserved {} on {resource_id} [{}, {}) for {}",
                r.id,
                span.start,
                span.end,
                r.customer_id
            ),
            Err(e @ EngineError::Internal(_)) => {
                tracing::error!("reserve on {resource_id} [{}, {}) failed: {e}", span.start, span.end)
            }
            Err(e) => tracing::debug!("reserve on {resource_id} [{}, {}): {e}", span.start, span.end),
        }
        result
    }

    async fn run_reserve(
        &self,
        draft: ReservationDraft,
        deadline: Duration,
    ) -> Result<Reservation, EngineError> {
        let (tx, reservation) = tokio::time::timeout(deadline, self.stage(draft))
            .await
            .map_err(|_| EngineError::lock_timeout())??;
        tx.commit().await?;
        Ok(reservation)
    }

    /// Everything before commit. On success the transaction comes back still
    /// holding the window lock with the insert pending.
    async fn stage(
        &self,
        draft: ReservationDraft,
    ) -> Result<(Box<dyn ScheduleTx>, Reservation), EngineError> {
        let mut tx = self.store.begin().await?;
        match check_and_insert(tx.as_mut(), draft).await {
            Ok(reservation) => Ok((tx, reservation)),
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("rollback after {} failed: {rollback_err}", e.kind());
                }
                Err(e)
            }
        }
    }
}

async fn check_and_insert(
    tx: &mut dyn ScheduleTx,
    draft: ReservationDraft,
) -> Result<Reservation, EngineError> {
    let resource_id = draft.resource_id();
    let span = draft.span();
    if tx.find_bookable_resource(resource_id).await?.is_none() {
        return Err(EngineError::NotFound(resource_id));
    }

    let day = day_of_week(span.date());
    let window = tx
        .lock_containing_window(resource_id, day, &span)
        .await?
        .ok_or(EngineError::OutOfRange)?;

    let confirmed = tx.count_confirmed_overlapping(resource_id, &span).await?;
    if confirmed >= window.capacity {
        return Err(EngineError::CapacityExceeded {
            capacity: window.capacity,
        });
    }

    let reservation = tx
        .insert_reservation(NewReservation {
            id: Ulid::new(),
            resource_id,
            customer_id: draft.customer_id().to_string(),
            span,
        })
        .await?;
    Ok(reservation)
}
