// Utility functions: id generation and timestamp helpers.

pub mod id;
pub mod time;

pub use id::{generate_id, temporary_id};
pub use time::{from_millis, parse_timestamp};
