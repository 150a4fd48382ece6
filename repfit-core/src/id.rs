//! Client-side entity identifiers.
//!
//! Entities created while offline get a temporary id of the form
//! `local_<uuid-v4>`. The reserved prefix is what distinguishes them from ids
//! handed out by the server, which never start with it.

use uuid::Uuid;

/// Prefix reserved for client-generated ids.
pub const TEMP_ID_PREFIX: &str = "local_";

/// Generate a fresh temporary id.
pub fn new_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4().simple())
}

/// True if the id was generated on this client and not yet confirmed by the server.
pub fn is_temporary(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}
