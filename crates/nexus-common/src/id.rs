/// Generate a fresh opaque id for sessions, tool servers, etc.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a short hex id for correlating one in-flight request in logs.
pub fn new_request_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    let bytes = uuid.as_bytes();
    format!(
        "{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}
