use crate::model::Timestamp;

/// Resource names are stored as at most 30 bytes.
pub const MAX_NAME_LEN: usize = 30;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;

pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;

/// A zero timestamp is treated as missing, so valid instants start at 1.
pub const MIN_VALID_TIMESTAMP: Timestamp = 1;

/// 9999-12-31T23:59:59Z
pub const MAX_VALID_TIMESTAMP: Timestamp = 253_402_300_799;

pub const MAX_TENANTS: usize = 1024;

pub const MAX_TENANT_NAME_LEN: usize = 63;
