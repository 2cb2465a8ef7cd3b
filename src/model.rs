use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::*;

/// Unix seconds. The only time type.
pub type Timestamp = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted bounds.
    pub fn try_new(start: Timestamp, end: Timestamp) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_secs(&self) -> Timestamp {
        self.end - self.start
    }

    /// Half-open intersection: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Timestamp) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
}

/// A booking request that has already passed boundary validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewReservation {
    resource_id: Ulid,
    span: Span,
}

impl NewReservation {
    pub fn new(resource_id: Ulid, start: Timestamp, end: Timestamp) -> Result<Self, EngineError> {
        let span = Span::try_new(start, end)?;
        if span.start < MIN_VALID_TIMESTAMP || span.end > MAX_VALID_TIMESTAMP {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { resource_id, span })
    }

    pub fn parse(resource_id: &str, start: Timestamp, end: Timestamp) -> Result<Self, EngineError> {
        Self::new(parse_id(resource_id)?, start, end)
    }

    pub fn resource_id(&self) -> Ulid {
        self.resource_id
    }

    pub fn span(&self) -> Span {
        self.span
    }
}

/// Parse a client-supplied identifier.
pub fn parse_id(raw: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(raw.trim()).map_err(|_| EngineError::InvalidId(raw.to_string()))
}

/// Resource names are non-blank and fit the name column.
pub fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidName("name must not be blank"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::InvalidName("name too long"));
    }
    Ok(())
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
    },
    ReservationCreated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
    },
}

impl From<&Resource> for Event {
    fn from(r: &Resource) -> Self {
        Event::ResourceCreated {
            id: r.id,
            name: r.name.clone(),
        }
    }
}

impl From<&Reservation> for Event {
    fn from(r: &Reservation) -> Self {
        Event::ReservationCreated {
            id: r.id,
            resource_id: r.resource_id,
            span: r.span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_secs(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_overlap_nested_and_identical() {
        let outer = Span::new(1577293360, 1578293360);
        let inner = Span::new(1577800000, 1577900000);
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
        assert!(outer.overlaps(&outer));
    }

    #[test]
    fn span_overlap_single_second() {
        let a = Span::new(100, 201);
        let b = Span::new(200, 300);
        assert!(a.overlaps(&b));
    }

    #[test]
    fn span_try_new_rejects_degenerate() {
        assert!(matches!(
            Span::try_new(10, 10),
            Err(EngineError::InvalidInterval { start: 10, end: 10 })
        ));
        assert!(matches!(
            Span::try_new(20, 10),
            Err(EngineError::InvalidInterval { .. })
        ));
        assert_eq!(Span::try_new(10, 20).unwrap(), Span::new(10, 20));
    }

    #[test]
    fn new_reservation_range_checks() {
        let rid = Ulid::new();
        assert!(NewReservation::new(rid, 0, 10).is_err());
        assert!(NewReservation::new(rid, 1, MAX_VALID_TIMESTAMP + 1).is_err());
        let ok = NewReservation::new(rid, 1, MAX_VALID_TIMESTAMP).unwrap();
        assert_eq!(ok.resource_id(), rid);
        assert_eq!(ok.span(), Span::new(1, MAX_VALID_TIMESTAMP));
    }

    #[test]
    fn new_reservation_parse_rejects_bad_id() {
        let err = NewReservation::parse("not-a-ulid", 10, 20).unwrap_err();
        assert!(matches!(err, EngineError::InvalidId(ref s) if s == "not-a-ulid"));
    }

    #[test]
    fn new_reservation_parse_checks_id_before_interval() {
        let err = NewReservation::parse("nope", 20, 10).unwrap_err();
        assert!(matches!(err, EngineError::InvalidId(_)));
    }

    #[test]
    fn parse_id_roundtrips_display() {
        let id = Ulid::new();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
        assert!(parse_id("").is_err());
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("room 1").is_ok());
        assert!(matches!(validate_name(""), Err(EngineError::InvalidName(_))));
        assert!(matches!(validate_name("   "), Err(EngineError::InvalidName(_))));
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(matches!(
            validate_name(&"x".repeat(MAX_NAME_LEN + 1)),
            Err(EngineError::InvalidName("name too long"))
        ));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            span: Span::new(1577293360, 1578293360),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
