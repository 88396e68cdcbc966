//! Schedule Store boundary.
//!
//! The engine only talks to storage through [`ScheduleStore`] and the
//! [`ScheduleTx`] it hands out. A store must give `lock_containing_window`
//! exclusive-lock semantics scoped to one window: a second transaction that
//! asks for the same window waits until the first commits or rolls back,
//! while transactions on other windows proceed.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("store configuration error: {0}")]
    Config(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid window: {0}")]
    InvalidWindow(&'static str),
    #[error("window overlaps existing window {0}")]
    WindowOverlap(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("timed out waiting for a window lock")]
    LockTimeout,
    #[error("transaction misuse: {0}")]
    Misuse(&'static str),
}

/// Reservation about to be inserted; the store assigns nothing, the engine
/// has already chosen the id.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub customer_id: String,
    pub span: TimeSpan,
}

/// Read path plus the entry point to the atomic write unit.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// The resource if it exists and is bookable.
    async fn find_bookable_resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError>;

    /// All windows of `resource_id` on `day_of_week`, ordered by start time.
    async fn windows_for_day(
        &self,
        resource_id: Ulid,
        day_of_week: u8,
    ) -> Result<Vec<AvailabilityWindow>, StoreError>;

    /// Number of CONFIRMED reservations overlapping `span` (half-open).
    async fn count_confirmed_overlapping(
        &self,
        resource_id: Ulid,
        span: &TimeSpan,
    ) -> Result<u32, StoreError>;

    async fn begin(&self) -> Result<Box<dyn ScheduleTx>, StoreError>;
}

/// One atomic unit of work. Dropping an unfinished transaction rolls it back
/// and releases every lock it holds.
#[async_trait]
pub trait ScheduleTx: Send {
    async fn find_bookable_resource(&mut self, id: Ulid) -> Result<Option<Resource>, StoreError>;

    /// Exclusively lock the window of `resource_id` on `day_of_week` whose
    /// span on `span`'s date contains `span` (boundaries inclusive).
    async fn lock_containing_window(
        &mut self,
        resource_id: Ulid,
        day_of_week: u8,
        span: &TimeSpan,
    ) -> Result<Option<AvailabilityWindow>, StoreError>;

    async fn count_confirmed_overlapping(
        &mut self,
        resource_id: Ulid,
        span: &TimeSpan,
    ) -> Result<u32, StoreError>;

    async fn insert_reservation(&mut self, new: NewReservation) -> Result<Reservation, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Catalog management and listings. Owned by operators and the gateway,
/// never called by the engine.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn create_resource(&self, resource: Resource) -> Result<(), StoreError>;

    async fn set_bookable(&self, id: Ulid, is_bookable: bool) -> Result<(), StoreError>;

    async fn add_window(&self, window: AvailabilityWindow) -> Result<(), StoreError>;

    /// Returns the owning resource id.
    async fn remove_window(&self, id: Ulid) -> Result<Ulid, StoreError>;

    async fn list_bookable_resources(&self) -> Result<Vec<Resource>, StoreError>;

    async fn list_windows(&self, resource_id: Ulid) -> Result<Vec<AvailabilityWindow>, StoreError>;

    /// Reservations (any status) whose booking date is `date`, by start.
    async fn reservations_on(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// CONFIRMED -> CANCELLED. Storage primitive for the cancellation workflow.
    async fn cancel_reservation(&self, id: Ulid) -> Result<(), StoreError>;
}

/// Validate a window's own fields; overlap with siblings is checked by the store.
pub(crate) fn check_window(window: &AvailabilityWindow) -> Result<(), StoreError> {
    if window.day_of_week > 6 {
        return Err(StoreError::InvalidWindow("day_of_week must be 0..=6"));
    }
    if window.start_time >= window.end_time {
        return Err(StoreError::InvalidWindow("start_time must be before end_time"));
    }
    if window.capacity == 0 {
        return Err(StoreError::InvalidWindow("capacity must be positive"));
    }
    Ok(())
}
