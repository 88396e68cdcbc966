//! In-process Schedule Store.
//!
//! Every resource lives behind its own `RwLock`; every availability window
//! carries its own async mutex which plays the part of the row lock. The
//! optional WAL makes the store durable across restarts.

mod state;
mod tx;
mod writer;

pub use state::{ResourceState, SharedResourceState};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{check_window, Catalog, ScheduleStore, ScheduleTx, StoreError};
use state::{apply_to_resource, snapshot_events};
use tx::MemoryTx;
use writer::{wal_writer_loop, WalCommand};

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

pub(super) struct StoreInner {
    resources: DashMap<Ulid, SharedResourceState>,
    /// Reverse lookups: window / reservation id → resource id.
    window_index: DashMap<Ulid, Ulid>,
    reservation_index: DashMap<Ulid, Ulid>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Mutations hold this shared across persist + apply; compaction holds it
    /// exclusively so no write lands between its snapshot and the file swap.
    commit_gate: RwLock<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store, nothing is written to disk.
    pub fn new() -> Self {
        Self::with_parts(DashMap::new(), DashMap::new(), DashMap::new(), None)
    }

    /// Durable store backed by the WAL at `wal_path`. Replays existing events
    /// and spawns the group-commit writer, so it must run inside a Tokio runtime.
    pub fn open(wal_path: &Path) -> std::io::Result<Self> {
        let events = crate::wal::Wal::replay(wal_path)?;
        let wal = crate::wal::Wal::open(wal_path)?;

        let mut states: HashMap<Ulid, ResourceState> = HashMap::new();
        let window_index = DashMap::new();
        let reservation_index = DashMap::new();
        let mut skipped = 0usize;

        for event in &events {
            if let Event::ResourceCreated { id, name, is_bookable } = event {
                states.insert(
                    *id,
                    ResourceState::new(Resource {
                        id: *id,
                        name: name.clone(),
                        is_bookable: *is_bookable,
                    }),
                );
                continue;
            }
            let Some(rs) = states.get_mut(&event.resource_id()) else {
                skipped += 1;
                continue;
            };
            if !apply_to_resource(rs, event) {
                skipped += 1;
                continue;
            }
            index_event(&window_index, &reservation_index, event);
        }
        if skipped > 0 {
            tracing::warn!("WAL {}: skipped {skipped} dangling events", wal_path.display());
        }
        tracing::info!(
            "replayed {} events from {} ({} resources)",
            events.len(),
            wal_path.display(),
            states.len()
        );

        let resources = DashMap::new();
        for (id, rs) in states {
            resources.insert(id, Arc::new(RwLock::new(rs)));
        }

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self::with_parts(resources, window_index, reservation_index, Some(wal_tx)))
    }

    fn with_parts(
        resources: DashMap<Ulid, SharedResourceState>,
        window_index: DashMap<Ulid, Ulid>,
        reservation_index: DashMap<Ulid, Ulid>,
        wal_tx: Option<mpsc::Sender<WalCommand>>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                resources,
                window_index,
                reservation_index,
                wal_tx,
                commit_gate: RwLock::new(()),
            }),
        }
    }

    pub fn resource_count(&self) -> usize {
        self.inner.resources.len()
    }

    /// Rewrite the WAL with just the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.inner.wal_tx else {
            return Ok(());
        };
        let _gate = self.inner.commit_gate.write().await;

        let mut states: Vec<(Ulid, SharedResourceState)> = self
            .inner
            .resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);

        let mut events = Vec::new();
        for (_, rs) in states {
            let guard = rs.read().await;
            snapshot_events(&guard, &mut events);
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.inner.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl StoreInner {
    pub(super) fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Write an event to the WAL via the group-commit writer. No-op when volatile.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Shared hold on the commit gate. Always taken before a resource write
    /// lock, never after.
    pub(super) async fn gate(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// WAL-append then apply. The caller holds the gate and the resource
    /// write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event);
        index_event(&self.window_index, &self.reservation_index, event);
        Ok(())
    }

    pub(super) async fn find_bookable_resource(&self, id: Ulid) -> Option<Resource> {
        let rs = self.get_resource(&id)?;
        let guard = rs.read().await;
        guard.resource.is_bookable.then(|| guard.resource.clone())
    }

    pub(super) async fn count_confirmed_overlapping(&self, resource_id: Ulid, span: &TimeSpan) -> u32 {
        match self.get_resource(&resource_id) {
            Some(rs) => rs.read().await.count_confirmed_overlapping(span),
            None => 0,
        }
    }
}

fn index_event(windows: &DashMap<Ulid, Ulid>, reservations: &DashMap<Ulid, Ulid>, event: &Event) {
    match event {
        Event::WindowAdded { window } => {
            windows.insert(window.id, window.resource_id);
        }
        Event::WindowRemoved { id, .. } => {
            windows.remove(id);
        }
        Event::ReservationConfirmed { id, resource_id, .. } => {
            reservations.insert(*id, *resource_id);
        }
        _ => {}
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn find_bookable_resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        Ok(self.inner.find_bookable_resource(id).await)
    }

    async fn windows_for_day(
        &self,
        resource_id: Ulid,
        day_of_week: u8,
    ) -> Result<Vec<AvailabilityWindow>, StoreError> {
        let Some(rs) = self.inner.get_resource(&resource_id) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        Ok(guard
            .windows_on(day_of_week)
            .map(|s| s.window.clone())
            .collect())
    }

    async fn count_confirmed_overlapping(
        &self,
        resource_id: Ulid,
        span: &TimeSpan,
    ) -> Result<u32, StoreError> {
        Ok(self.inner.count_confirmed_overlapping(resource_id, span).await)
    }

    async fn begin(&self) -> Result<Box<dyn ScheduleTx>, StoreError> {
        Ok(Box::new(MemoryTx::new(self.inner.clone())))
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn create_resource(&self, resource: Resource) -> Result<(), StoreError> {
        if self.inner.resources.len() >= MAX_RESOURCES {
            return Err(StoreError::LimitExceeded("too many resources"));
        }
        if let Some(ref n) = resource.name
            && n.len() > MAX_NAME_LEN
        {
            return Err(StoreError::LimitExceeded("resource name too long"));
        }
        if self.inner.resources.contains_key(&resource.id) {
            return Err(StoreError::AlreadyExists(resource.id));
        }

        let event = Event::ResourceCreated {
            id: resource.id,
            name: resource.name.clone(),
            is_bookable: resource.is_bookable,
        };
        let _gate = self.inner.gate().await;
        self.inner.wal_append(&event).await?;
        self.inner
            .resources
            .insert(resource.id, Arc::new(RwLock::new(ResourceState::new(resource))));
        Ok(())
    }

    async fn set_bookable(&self, id: Ulid, is_bookable: bool) -> Result<(), StoreError> {
        let rs = self.inner.get_resource(&id).ok_or(StoreError::NotFound(id))?;
        let _gate = self.inner.gate().await;
        let mut guard = rs.write().await;
        if guard.resource.is_bookable == is_bookable {
            return Ok(());
        }
        let event = Event::BookableChanged { id, is_bookable };
        self.inner.persist_and_apply(&mut guard, &event).await
    }

    async fn add_window(&self, window: AvailabilityWindow) -> Result<(), StoreError> {
        check_window(&window)?;
        if self.inner.window_index.contains_key(&window.id) {
            return Err(StoreError::AlreadyExists(window.id));
        }
        let rs = self
            .inner
            .get_resource(&window.resource_id)
            .ok_or(StoreError::NotFound(window.resource_id))?;
        let _gate = self.inner.gate().await;
        let mut guard = rs.write().await;
        if guard.windows.len() >= MAX_WINDOWS_PER_RESOURCE {
            return Err(StoreError::LimitExceeded("too many windows on resource"));
        }
        if let Some(existing) = guard
            .windows_on(window.day_of_week)
            .find(|s| s.window.overlaps_window(&window))
        {
            return Err(StoreError::WindowOverlap(existing.window.id));
        }

        let event = Event::WindowAdded { window };
        self.inner.persist_and_apply(&mut guard, &event).await
    }

    async fn remove_window(&self, id: Ulid) -> Result<Ulid, StoreError> {
        let resource_id = self
            .inner
            .window_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let rs = self
            .inner
            .get_resource(&resource_id)
            .ok_or(StoreError::NotFound(resource_id))?;

        let lock = {
            let guard = rs.read().await;
            guard
                .window_slot(id)
                .map(|s| s.lock.clone())
                .ok_or(StoreError::NotFound(id))?
        };
        // Wait out any transaction booking into this window.
        let mut window_guard = lock.lock_owned().await;
        if window_guard.retired {
            return Err(StoreError::NotFound(id));
        }

        let _gate = self.inner.gate().await;
        let mut guard = rs.write().await;
        let event = Event::WindowRemoved { id, resource_id };
        self.inner.persist_and_apply(&mut guard, &event).await?;
        window_guard.retired = true;
        Ok(resource_id)
    }

    async fn list_bookable_resources(&self) -> Result<Vec<Resource>, StoreError> {
        let states: Vec<SharedResourceState> =
            self.inner.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            if guard.resource.is_bookable {
                out.push(guard.resource.clone());
            }
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn list_windows(&self, resource_id: Ulid) -> Result<Vec<AvailabilityWindow>, StoreError> {
        let rs = self
            .inner
            .get_resource(&resource_id)
            .ok_or(StoreError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.windows.iter().map(|s| s.window.clone()).collect())
    }

    async fn reservations_on(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, StoreError> {
        let rs = self
            .inner
            .get_resource(&resource_id)
            .ok_or(StoreError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard
            .reservations
            .iter()
            .filter(|r| r.booking_date() == date)
            .take(MAX_LISTED_RESERVATIONS)
            .cloned()
            .collect())
    }

    async fn cancel_reservation(&self, id: Ulid) -> Result<(), StoreError> {
        let resource_id = self
            .inner
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let rs = self
            .inner
            .get_resource(&resource_id)
            .ok_or(StoreError::NotFound(resource_id))?;
        let _gate = self.inner.gate().await;
        let mut guard = rs.write().await;
        match guard.reservation_mut(id) {
            Some(r) if r.is_confirmed() => {}
            Some(_) => return Ok(()),
            None => return Err(StoreError::NotFound(id)),
        }
        let event = Event::ReservationCancelled { id, resource_id };
        self.inner.persist_and_apply(&mut guard, &event).await
    }
}
