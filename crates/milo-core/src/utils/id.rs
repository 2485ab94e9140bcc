// Document and token identifiers, generated with nanoid.

/// Generate a 21-character document id.
pub fn generate_id() -> String {
    nanoid::nanoid!()
}

/// Generate an id with a custom length (session tokens use 32).
pub fn generate_id_with_length(len: usize) -> String {
    nanoid::nanoid!(len)
}

/// Placeholder id for records that are never persisted.
pub fn temporary_id() -> String {
    format!("temp_{}", generate_id())
}
