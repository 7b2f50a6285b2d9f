use ulid::Ulid;

/// Prefix carried by every session id.
pub const SESSION_PREFIX: &str = "ses";

/// Generates a new session id (`ses_` followed by a lowercase ULID).
///
/// # Examples
/// ```
/// let id = together_common::id::new_session_id();
/// assert!(together_common::id::is_session_id(&id));
/// ```
pub fn new_session_id() -> String {
    format!("{}_{}", SESSION_PREFIX, Ulid::new().to_string().to_lowercase())
}

/// Cheap shape check used before a session id is used to build backplane keys.
///
/// Accepts anything made of ASCII alphanumerics, `-` and `_` up to 64 bytes, so
/// ids minted by older deployments (plain UUIDs) keep working.
pub fn is_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
