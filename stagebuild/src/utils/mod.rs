//! Utility functions for timestamps, stage-root filesystem handling,
//! environment expansion and child processes.

pub mod env;
pub mod fs;
pub mod process;
pub mod timestamps;

pub use timestamps::{iso_timestamp, Timestamp};

/// Generates a random v4 UUID.
#[must_use]
pub fn generate_uuid() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uuid_is_valid() {
        let id = generate_uuid();
        assert_eq!(id.get_version_num(), 4);
    }
}
