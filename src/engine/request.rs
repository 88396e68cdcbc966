//! Raw request shapes and their validation.
//!
//! Everything here runs before the store is touched. Timestamps end up as
//! schedule-local wall-clock values: an explicit offset is converted to the
//! schedule offset, a naive timestamp is taken as already local.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::TimeSpan;

use super::EngineError;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Availability lookup as it arrives from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityQuery {
    pub resource_id: Option<String>,
    pub date: Option<String>,
}

/// Reservation attempt as it arrives from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReserveRequest {
    pub resource_id: Option<String>,
    pub customer_id: Option<String>,
    pub start_datetime: Option<String>,
    pub end_datetime: Option<String>,
}

/// A reservation request that passed validation. Only [`ReservationDraft::new`]
/// builds one, so `start < end` and a usable customer id always hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDraft {
    resource_id: Ulid,
    customer_id: String,
    span: TimeSpan,
}

impl ReservationDraft {
    pub fn new(
        resource_id: Ulid,
        customer_id: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Self, EngineError> {
        let customer_id = customer_id.trim();
        if customer_id.is_empty() {
            return Err(EngineError::validation("customer_id required"));
        }
        if customer_id.len() > MAX_CUSTOMER_ID_LEN {
            return Err(EngineError::validation(format!(
                "customer_id longer than {MAX_CUSTOMER_ID_LEN} bytes"
            )));
        }
        if start >= end {
            return Err(EngineError::validation("start_datetime must be before end_datetime"));
        }
        Ok(Self {
            resource_id,
            customer_id: customer_id.to_string(),
            span: TimeSpan::new(start, end),
        })
    }

    pub fn resource_id(&self) -> Ulid {
        self.resource_id
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn span(&self) -> TimeSpan {
        self.span
    }
}

impl AvailabilityQuery {
    pub fn validate(&self) -> Result<(Ulid, NaiveDate), EngineError> {
        let missing = missing_fields(&[("resource_id", &self.resource_id), ("date", &self.date)]);
        if !missing.is_empty() {
            return Err(EngineError::validation(format!("{} required", missing.join(", "))));
        }
        let resource_id = parse_ulid("resource_id", present(&self.resource_id))?;
        let date = parse_date(present(&self.date))?;
        Ok((resource_id, date))
    }
}

impl ReserveRequest {
    pub fn validate(&self, tz: &FixedOffset) -> Result<ReservationDraft, EngineError> {
        let missing = missing_fields(&[
            ("resource_id", &self.resource_id),
            ("customer_id", &self.customer_id),
            ("start_datetime", &self.start_datetime),
            ("end_datetime", &self.end_datetime),
        ]);
        if !missing.is_empty() {
            return Err(EngineError::validation(format!("{} required", missing.join(", "))));
        }

        // Spans no single window can hold are left to the engine, which
        // reports them as out of range once the resource is known.
        let resource_id = parse_ulid("resource_id", present(&self.resource_id))?;
        let start = parse_timestamp(present(&self.start_datetime), tz)?;
        let end = parse_timestamp(present(&self.end_datetime), tz)?;
        ReservationDraft::new(resource_id, present(&self.customer_id), start, end)
    }
}

/// Names of fields that are absent or blank.
fn missing_fields(fields: &[(&'static str, &Option<String>)]) -> Vec<&'static str> {
    fields
        .iter()
        .filter(|(_, v)| v.as_deref().is_none_or(|s| s.trim().is_empty()))
        .map(|(name, _)| *name)
        .collect()
}

/// Trimmed value of a field already known to be present.
fn present(field: &Option<String>) -> &str {
    field.as_deref().map(str::trim).unwrap_or_default()
}

pub fn parse_ulid(field: &str, s: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(s).map_err(|_| EngineError::validation(format!("{field} is not a valid id: {s:?}")))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| EngineError::validation(format!("invalid date {s:?}, expected YYYY-MM-DD")))
}

/// Parse a timestamp into schedule-local time.
pub fn parse_timestamp(s: &str, tz: &FixedOffset) -> Result<NaiveDateTime, EngineError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(tz).naive_local());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| {
            EngineError::validation(format!("invalid datetime {s:?}, use ISO 8601"))
        })
}
