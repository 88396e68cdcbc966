/// Max resources held by one store.
pub const MAX_RESOURCES: usize = 100_000;

/// Max availability windows per resource (7 days x 96 quarter-hours).
pub const MAX_WINDOWS_PER_RESOURCE: usize = 672;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_CUSTOMER_ID_LEN: usize = 128;

/// Upper bound on rows returned by a single reservation listing.
pub const MAX_LISTED_RESERVATIONS: usize = 10_000;
