use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Content of a window's exclusive lock. `retired` is set by the catalog
/// when the window is removed so that a transaction which was queued on the
/// lock does not book into a window that no longer exists.
#[derive(Debug, Default)]
pub struct WindowLock {
    pub retired: bool,
}

#[derive(Debug)]
pub struct WindowSlot {
    pub window: AvailabilityWindow,
    pub lock: Arc<Mutex<WindowLock>>,
}

#[derive(Debug)]
pub struct ResourceState {
    pub resource: Resource,
    /// Sorted by `(day_of_week, start_time)`.
    pub windows: Vec<WindowSlot>,
    /// All reservations (any status), sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            windows: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let key = (window.day_of_week, window.start_time);
        let pos = self
            .windows
            .binary_search_by_key(&key, |s| (s.window.day_of_week, s.window.start_time))
            .unwrap_or_else(|e| e);
        self.windows.insert(
            pos,
            WindowSlot {
                window,
                lock: Arc::new(Mutex::new(WindowLock::default())),
            },
        );
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<WindowSlot> {
        let pos = self.windows.iter().position(|s| s.window.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn window_slot(&self, id: Ulid) -> Option<&WindowSlot> {
        self.windows.iter().find(|s| s.window.id == id)
    }

    /// Windows of one weekday, in start-time order.
    pub fn windows_on(&self, day_of_week: u8) -> impl Iterator<Item = &WindowSlot> {
        self.windows
            .iter()
            .filter(move |s| s.window.day_of_week == day_of_week)
    }

    /// The window on `span`'s weekday whose span on that date contains `span`.
    pub fn containing_window(&self, day_of_week: u8, span: &TimeSpan) -> Option<&WindowSlot> {
        let date = span.date();
        self.windows_on(day_of_week)
            .find(|s| s.window.on(date).contains_span(span))
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps `query`.
    /// Everything at index >= the partition point starts at or after
    /// `query.end` and cannot overlap.
    pub fn overlapping(&self, query: &TimeSpan) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn count_confirmed_overlapping(&self, query: &TimeSpan) -> u32 {
        self.overlapping(query).filter(|r| r.is_confirmed()).count() as u32
    }
}

/// Apply an event to a resource (caller holds the write lock). Returns false
/// when the event refers to something the resource does not have.
pub fn apply_to_resource(rs: &mut ResourceState, event: &Event) -> bool {
    match event {
        Event::BookableChanged { is_bookable, .. } => {
            rs.resource.is_bookable = *is_bookable;
            true
        }
        Event::WindowAdded { window } => {
            rs.insert_window(window.clone());
            true
        }
        Event::WindowRemoved { id, .. } => rs.remove_window(*id).is_some(),
        Event::ReservationConfirmed {
            id,
            resource_id,
            customer_id,
            span,
        } => {
            rs.insert_reservation(Reservation {
                id: *id,
                resource_id: *resource_id,
                customer_id: customer_id.clone(),
                span: *span,
                status: ReservationStatus::Confirmed,
            });
            true
        }
        Event::ReservationCancelled { id, .. } => match rs.reservation_mut(*id) {
            Some(r) => {
                r.status = ReservationStatus::Cancelled;
                true
            }
            None => false,
        },
        // Handled at the map level.
        Event::ResourceCreated { .. } => true,
    }
}

/// Events that recreate `rs` from nothing.
pub fn snapshot_events(rs: &ResourceState, out: &mut Vec<Event>) {
    out.push(Event::ResourceCreated {
        id: rs.resource.id,
        name: rs.resource.name.clone(),
        is_bookable: rs.resource.is_bookable,
    });
    for slot in &rs.windows {
        out.push(Event::WindowAdded {
            window: slot.window.clone(),
        });
    }
    for r in &rs.reservations {
        out.push(Event::ReservationConfirmed {
            id: r.id,
            resource_id: r.resource_id,
            customer_id: r.customer_id.clone(),
            span: r.span,
        });
        if r.status == ReservationStatus::Cancelled {
            out.push(Event::ReservationCancelled {
                id: r.id,
                resource_id: r.resource_id,
            });
        }
    }
}
