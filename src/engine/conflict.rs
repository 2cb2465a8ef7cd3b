use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Reservations in `sorted` (ordered by `span.start`) that overlap `query`.
/// Everything at or past the partition point starts at or after `query.end`
/// and cannot overlap.
pub(crate) fn overlapping<'a>(sorted: &'a [Reservation], query: &Span) -> impl Iterator<Item = &'a Reservation> {
    let right_bound = sorted.partition_point(|r| r.span.start < query.end);
    let query = *query;
    sorted[..right_bound].iter().filter(move |r| r.span.overlaps(&query))
}

pub(crate) fn check_no_conflict(resource_id: Ulid, existing: &[Reservation], span: &Span) -> Result<(), EngineError> {
    match overlapping(existing, span).next() {
        Some(hit) => Err(EngineError::ResourceUnavailable {
            resource_id,
            conflicting: hit.id,
        }),
        None => Ok(()),
    }
}
