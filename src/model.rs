use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open interval `[start, end)` of schedule-local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeSpan {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "TimeSpan start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &TimeSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: NaiveDateTime) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`, boundaries inclusive.
    pub fn contains_span(&self, other: &TimeSpan) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Calendar date of the start instant.
    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }
}

/// Day of week with Sunday = 0, as stored in `day_of_week` columns.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: Option<String>,
    pub is_bookable: bool,
}

/// Recurring weekly range during which a resource accepts reservations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub resource_id: Ulid,
    /// 0 = Sunday .. 6 = Saturday.
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
}

impl AvailabilityWindow {
    /// The absolute span this window covers on `date`.
    pub fn on(&self, date: NaiveDate) -> TimeSpan {
        TimeSpan::new(date.and_time(self.start_time), date.and_time(self.end_time))
    }

    pub fn overlaps_window(&self, other: &AvailabilityWindow) -> bool {
        self.day_of_week == other.day_of_week
            && self.start_time < other.end_time
            && other.start_time < self.end_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONFIRMED" => Some(ReservationStatus::Confirmed),
            "CANCELLED" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub customer_id: String,
    pub span: TimeSpan,
    pub status: ReservationStatus,
}

impl Reservation {
    pub fn booking_date(&self) -> NaiveDate {
        self.span.date()
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

/// Free capacity of one window on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAvailability {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub remaining_capacity: u32,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        is_bookable: bool,
    },
    BookableChanged {
        id: Ulid,
        is_bookable: bool,
    },
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationConfirmed {
        id: Ulid,
        resource_id: Ulid,
        customer_id: String,
        span: TimeSpan,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceCreated { id, .. } | Event::BookableChanged { id, .. } => *id,
            Event::WindowAdded { window } => window.resource_id,
            Event::WindowRemoved { resource_id, .. }
            | Event::ReservationConfirmed { resource_id, .. }
            | Event::ReservationCancelled { resource_id, .. } => *resource_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M").unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    #[test]
    fn span_basics() {
        let s = TimeSpan::new(at("2024-01-01", "10:00"), at("2024-01-01", "11:00"));
        assert_eq!(s.duration(), chrono::Duration::hours(1));
        assert!(s.contains_instant(at("2024-01-01", "10:00")));
        assert!(s.contains_instant(at("2024-01-01", "10:59")));
        assert!(!s.contains_instant(at("2024-01-01", "11:00"))); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = TimeSpan::new(at("2024-01-01", "10:00"), at("2024-01-01", "11:00"));
        let b = TimeSpan::new(at("2024-01-01", "10:30"), at("2024-01-01", "11:30"));
        let c = TimeSpan::new(at("2024-01-01", "11:00"), at("2024-01-01", "12:00"));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contains_span_is_inclusive() {
        let outer = TimeSpan::new(at("2024-01-01", "09:00"), at("2024-01-01", "17:00"));
        let inner = TimeSpan::new(at("2024-01-01", "10:00"), at("2024-01-01", "11:00"));
        let partial = TimeSpan::new(at("2024-01-01", "16:00"), at("2024-01-01", "17:01"));
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn day_of_week_starts_on_sunday() {
        // 2024-01-07 was a Sunday, 2024-01-01 a Monday.
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2024, 1, 7).unwrap()), 0);
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()), 1);
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2024, 1, 6).unwrap()), 6);
    }

    #[test]
    fn window_on_date() {
        let w = AvailabilityWindow {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            day_of_week: 1,
            start_time: t("09:00"),
            end_time: t("12:00"),
            capacity: 2,
        };
        let span = w.on(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(span.start, at("2024-01-01", "09:00"));
        assert_eq!(span.end, at("2024-01-01", "12:00"));
    }

    #[test]
    fn windows_overlap_only_on_same_day() {
        let mk = |day, s, e| AvailabilityWindow {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            day_of_week: day,
            start_time: t(s),
            end_time: t(e),
            capacity: 1,
        };
        assert!(mk(1, "09:00", "12:00").overlaps_window(&mk(1, "11:00", "13:00")));
        assert!(!mk(1, "09:00", "12:00").overlaps_window(&mk(1, "12:00", "13:00")));
        assert!(!mk(1, "09:00", "12:00").overlaps_window(&mk(2, "09:00", "12:00")));
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in [ReservationStatus::Confirmed, ReservationStatus::Cancelled] {
            assert_eq!(ReservationStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ReservationStatus::parse("confirmed"), None);
    }
}
