/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Leading component of generated subscription names
pub const DEFAULT_SUBSCRIPTION_PREFIX: &str = "sub";

/// Number of rows returned by "most recent" queries when no limit is given
pub const DEFAULT_RECENT_LIMIT: u32 = 10;

/// Upper bound on rows returned by a single "most recent" query
pub const MAX_RECENT_LIMIT: u32 = 1000;
