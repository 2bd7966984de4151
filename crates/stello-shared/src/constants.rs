//! Shared constants.

/// Separator between the two participant ids inside a conversation key.
///
/// Ids containing this character are rejected at derivation time, so the
/// separator can never be ambiguous.
pub const KEY_SEPARATOR: char = ':';

/// Username of the bootstrap administrator account.
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";

/// Email of the bootstrap administrator account.
pub const DEFAULT_ADMIN_EMAIL: &str = "admin@stelloscope.com";

/// Capacity of the backend change feed.
///
/// A subscriber that falls further behind than this observes a lagged
/// receive and must re-query from its cursor.
pub const CHANGE_FEED_CAPACITY: usize = 256;
