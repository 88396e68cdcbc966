//! PostgreSQL-backed Schedule Store.
//!
//! The window row lock is a real `SELECT ... FOR UPDATE`; the transaction
//! runs with `lock_timeout` so a stuck holder surfaces as
//! [`StoreError::LockTimeout`] instead of an unbounded wait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{check_window, Catalog, NewReservation, ScheduleStore, ScheduleTx, StoreError};

const SCHEMA: &str = include_str!("../../migrations/001_schedule.sql");

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
    lock_timeout: Duration,
}

impl PgStore {
    /// Build the pool and check that the database answers.
    pub async fn connect(
        database_url: &str,
        max_connections: usize,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let mut cfg = Config::new();
        cfg.url = Some(database_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(max_connections));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Config(e.to_string()))?;

        let client = pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;
        tracing::info!("connected to postgres schedule store");
        Ok(Self { pool, lock_timeout })
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(())
    }
}

fn parse_id(s: &str) -> Result<Ulid, StoreError> {
    Ulid::from_string(s).map_err(|e| StoreError::Corrupt(format!("bad id {s:?}: {e}")))
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

fn resource_from_row(row: &Row) -> Result<Resource, StoreError> {
    Ok(Resource {
        id: parse_id(row.try_get("id")?)?,
        name: row.try_get("name")?,
        is_bookable: row.try_get("is_bookable")?,
    })
}

fn window_from_row(row: &Row) -> Result<AvailabilityWindow, StoreError> {
    let day: i16 = row.try_get("day_of_week")?;
    let capacity: i32 = row.try_get("capacity")?;
    Ok(AvailabilityWindow {
        id: parse_id(row.try_get("id")?)?,
        resource_id: parse_id(row.try_get("resource_id")?)?,
        day_of_week: u8::try_from(day)
            .map_err(|_| StoreError::Corrupt(format!("day_of_week {day}")))?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        capacity: u32::try_from(capacity)
            .map_err(|_| StoreError::Corrupt(format!("capacity {capacity}")))?,
    })
}

fn reservation_from_row(row: &Row) -> Result<Reservation, StoreError> {
    let status: &str = row.try_get("status")?;
    Ok(Reservation {
        id: parse_id(row.try_get("id")?)?,
        resource_id: parse_id(row.try_get("resource_id")?)?,
        customer_id: row.try_get("customer_id")?,
        span: TimeSpan {
            start: row.try_get("start_datetime")?,
            end: row.try_get("end_datetime")?,
        },
        status: ReservationStatus::parse(status)
            .ok_or_else(|| StoreError::Corrupt(format!("status {status:?}")))?,
    })
}

async fn find_bookable(client: &Client, id: Ulid) -> Result<Option<Resource>, StoreError> {
    let row = client
        .query_opt(
            "SELECT id, name, is_bookable FROM resources WHERE id = $1 AND is_bookable",
            &[&id.to_string()],
        )
        .await?;
    row.as_ref().map(resource_from_row).transpose()
}

async fn count_overlapping(client: &Client, resource_id: Ulid, span: &TimeSpan) -> Result<u32, StoreError> {
    let row = client
        .query_one(
            "SELECT COUNT(*) FROM reservations \
             WHERE resource_id = $1 AND status = 'CONFIRMED' \
               AND start_datetime < $2 AND end_datetime > $3",
            &[&resource_id.to_string(), &span.end, &span.start],
        )
        .await?;
    let n: i64 = row.try_get(0)?;
    Ok(n as u32)
}

async fn resource_exists(client: &Client, id: Ulid) -> Result<bool, StoreError> {
    let row = client
        .query_opt("SELECT 1 FROM resources WHERE id = $1", &[&id.to_string()])
        .await?;
    Ok(row.is_some())
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn find_bookable_resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        let client = self.pool.get().await?;
        find_bookable(&client, id).await
    }

    async fn windows_for_day(
        &self,
        resource_id: Ulid,
        day_of_week: u8,
    ) -> Result<Vec<AvailabilityWindow>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, resource_id, day_of_week, start_time, end_time, capacity \
                 FROM availability_windows \
                 WHERE resource_id = $1 AND day_of_week = $2 \
                 ORDER BY start_time",
                &[&resource_id.to_string(), &(day_of_week as i16)],
            )
            .await?;
        rows.iter().map(window_from_row).collect()
    }

    async fn count_confirmed_overlapping(
        &self,
        resource_id: Ulid,
        span: &TimeSpan,
    ) -> Result<u32, StoreError> {
        let client = self.pool.get().await?;
        count_overlapping(&client, resource_id, span).await
    }

    async fn begin(&self) -> Result<Box<dyn ScheduleTx>, StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute("BEGIN").await?;
        // From here on dropping `tx` rolls back.
        let tx = PgTx {
            client: Some(client),
            window_locked: false,
            inserted: false,
        };
        tx.client()?
            .batch_execute(&format!(
                "SET LOCAL lock_timeout = {}",
                self.lock_timeout.as_millis()
            ))
            .await?;
        Ok(Box::new(tx))
    }
}

/// One database transaction on a pooled connection. `client` is `None` once
/// the transaction has been committed or rolled back.
struct PgTx {
    client: Option<Object>,
    window_locked: bool,
    inserted: bool,
}

impl PgTx {
    fn client(&self) -> Result<&Object, StoreError> {
        self.client
            .as_ref()
            .ok_or(StoreError::Misuse("transaction already finished"))
    }

    async fn finish(mut self: Box<Self>, statement: &str) -> Result<(), StoreError> {
        let client = self
            .client
            .take()
            .ok_or(StoreError::Misuse("transaction already finished"))?;
        let result = client.batch_execute(statement).await;
        if let Err(e) = result {
            // Connection state unknown; keep it out of the pool.
            drop(Object::take(client));
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = client.batch_execute("ROLLBACK").await;
                    if let Err(e) = result {
                        tracing::warn!("rollback of abandoned transaction failed: {e}");
                        drop(Object::take(client));
                    }
                });
            }
            Err(_) => drop(Object::take(client)),
        }
    }
}

#[async_trait]
impl ScheduleTx for PgTx {
    async fn find_bookable_resource(&mut self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        find_bookable(self.client()?, id).await
    }

    async fn lock_containing_window(
        &mut self,
        resource_id: Ulid,
        day_of_week: u8,
        span: &TimeSpan,
    ) -> Result<Option<AvailabilityWindow>, StoreError> {
        let date: NaiveDate = span.date();
        let result = self
            .client()?
            .query_opt(
                "SELECT id, resource_id, day_of_week, start_time, end_time, capacity \
                 FROM availability_windows \
                 WHERE resource_id = $1 AND day_of_week = $2 \
                   AND ($3::date + start_time) <= $4 \
                   AND $5 <= ($3::date + end_time) \
                 ORDER BY start_time \
                 LIMIT 1 \
                 FOR UPDATE",
                &[
                    &resource_id.to_string(),
                    &(day_of_week as i16),
                    &date,
                    &span.start,
                    &span.end,
                ],
            )
            .await;
        let row = match result {
            Ok(row) => row,
            Err(e) if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) => {
                return Err(StoreError::LockTimeout);
            }
            Err(e) => return Err(e.into()),
        };
        let window = row.as_ref().map(window_from_row).transpose()?;
        self.window_locked = window.is_some();
        Ok(window)
    }

    async fn count_confirmed_overlapping(
        &mut self,
        resource_id: Ulid,
        span: &TimeSpan,
    ) -> Result<u32, StoreError> {
        count_overlapping(self.client()?, resource_id, span).await
    }

    async fn insert_reservation(&mut self, new: NewReservation) -> Result<Reservation, StoreError> {
        if !self.window_locked {
            return Err(StoreError::Misuse("insert without a window lock"));
        }
        if self.inserted {
            return Err(StoreError::Misuse("one reservation per transaction"));
        }
        self.client()?
            .execute(
                "INSERT INTO reservations \
                 (id, resource_id, customer_id, booking_date, start_datetime, end_datetime, status) \
                 VALUES ($1, $2, $3, $4, $5, $6, 'CONFIRMED')",
                &[
                    &new.id.to_string(),
                    &new.resource_id.to_string(),
                    &new.customer_id,
                    &new.span.date(),
                    &new.span.start,
                    &new.span.end,
                ],
            )
            .await?;
        self.inserted = true;
        Ok(Reservation {
            id: new.id,
            resource_id: new.resource_id,
            customer_id: new.customer_id,
            span: new.span,
            status: ReservationStatus::Confirmed,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK").await
    }
}

#[async_trait]
impl Catalog for PgStore {
    async fn create_resource(&self, resource: Resource) -> Result<(), StoreError> {
        if let Some(ref n) = resource.name
            && n.len() > MAX_NAME_LEN
        {
            return Err(StoreError::LimitExceeded("resource name too long"));
        }
        let client = self.pool.get().await?;
        let count: i64 = client
            .query_one("SELECT COUNT(*) FROM resources", &[])
            .await?
            .try_get(0)?;
        if count as usize >= MAX_RESOURCES {
            return Err(StoreError::LimitExceeded("too many resources"));
        }
        let result = client
            .execute(
                "INSERT INTO resources (id, name, is_bookable) VALUES ($1, $2, $3)",
                &[&resource.id.to_string(), &resource.name, &resource.is_bookable],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists(resource.id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_bookable(&self, id: Ulid, is_bookable: bool) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let n = client
            .execute(
                "UPDATE resources SET is_bookable = $2 WHERE id = $1",
                &[&id.to_string(), &is_bookable],
            )
            .await?;
        if n == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn add_window(&self, window: AvailabilityWindow) -> Result<(), StoreError> {
        check_window(&window)?;
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let resource_id = window.resource_id.to_string();

        // Serializes window edits per resource.
        let locked = tx
            .query_opt("SELECT 1 FROM resources WHERE id = $1 FOR UPDATE", &[&resource_id])
            .await?;
        if locked.is_none() {
            return Err(StoreError::NotFound(window.resource_id));
        }

        let count: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM availability_windows WHERE resource_id = $1",
                &[&resource_id],
            )
            .await?
            .try_get(0)?;
        if count as usize >= MAX_WINDOWS_PER_RESOURCE {
            return Err(StoreError::LimitExceeded("too many windows on resource"));
        }

        let day = window.day_of_week as i16;
        let overlap = tx
            .query_opt(
                "SELECT id FROM availability_windows \
                 WHERE resource_id = $1 AND day_of_week = $2 \
                   AND start_time < $4 AND $3 < end_time \
                 LIMIT 1",
                &[&resource_id, &day, &window.start_time, &window.end_time],
            )
            .await?;
        if let Some(row) = overlap {
            return Err(StoreError::WindowOverlap(parse_id(row.try_get(0)?)?));
        }

        let result = tx
            .execute(
                "INSERT INTO availability_windows \
                 (id, resource_id, day_of_week, start_time, end_time, capacity) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &window.id.to_string(),
                    &resource_id,
                    &day,
                    &window.start_time,
                    &window.end_time,
                    &(window.capacity as i32),
                ],
            )
            .await;
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(StoreError::AlreadyExists(window.id)),
            Err(e) => return Err(e.into()),
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_window(&self, id: Ulid) -> Result<Ulid, StoreError> {
        let client = self.pool.get().await?;
        // DELETE waits on the row lock of any booking in flight.
        let row = client
            .query_opt(
                "DELETE FROM availability_windows WHERE id = $1 RETURNING resource_id",
                &[&id.to_string()],
            )
            .await?
            .ok_or(StoreError::NotFound(id))?;
        parse_id(row.try_get(0)?)
    }

    async fn list_bookable_resources(&self) -> Result<Vec<Resource>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, name, is_bookable FROM resources WHERE is_bookable ORDER BY id",
                &[],
            )
            .await?;
        rows.iter().map(resource_from_row).collect()
    }

    async fn list_windows(&self, resource_id: Ulid) -> Result<Vec<AvailabilityWindow>, StoreError> {
        let client = self.pool.get().await?;
        if !resource_exists(&client, resource_id).await? {
            return Err(StoreError::NotFound(resource_id));
        }
        let rows = client
            .query(
                "SELECT id, resource_id, day_of_week, start_time, end_time, capacity \
                 FROM availability_windows WHERE resource_id = $1 \
                 ORDER BY day_of_week, start_time",
                &[&resource_id.to_string()],
            )
            .await?;
        rows.iter().map(window_from_row).collect()
    }

    async fn reservations_on(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, StoreError> {
        let client = self.pool.get().await?;
        if !resource_exists(&client, resource_id).await? {
            return Err(StoreError::NotFound(resource_id));
        }
        let rows = client
            .query(
                "SELECT id, resource_id, customer_id, start_datetime, end_datetime, status \
                 FROM reservations WHERE resource_id = $1 AND booking_date = $2 \
                 ORDER BY start_datetime LIMIT $3",
                &[&resource_id.to_string(), &date, &(MAX_LISTED_RESERVATIONS as i64)],
            )
            .await?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn cancel_reservation(&self, id: Ulid) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let key = id.to_string();
        let n = client
            .execute(
                "UPDATE reservations SET status = 'CANCELLED' WHERE id = $1 AND status = 'CONFIRMED'",
                &[&key],
            )
            .await?;
        if n > 0 {
            return Ok(());
        }
        let exists = client
            .query_opt("SELECT 1 FROM reservations WHERE id = $1", &[&key])
            .await?;
        match exists {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(id)),
        }
    }
}
