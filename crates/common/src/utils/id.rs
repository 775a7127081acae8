use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use uuid::Uuid;

/// Generate a unique request identifier
/// Format: "req_" prefix + UUID v4
pub fn generate_request_id() -> String {
    format!("req_{}", Uuid::new_v4())
}

/// Generate a debug name for a shared memory region
/// Format: "relay-body-" + 12 lowercase alphanumeric characters
///
/// The name shows up under /proc/<pid>/fd, which is all it is for.
pub fn generate_region_name() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(|c| c.to_ascii_lowercase())
        .map(char::from)
        .collect();
    format!("relay-body-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_request_id_format() {
        let request_id = generate_request_id();

        let uuid_part = request_id.strip_prefix("req_").expect("missing req_ prefix");
        let uuid = Uuid::parse_str(uuid_part).unwrap();
        assert_eq!(uuid.get_version_num(), 4);
    }

    #[test]
    fn test_generate_request_id_uniqueness() {
        let mut ids = HashSet::new();

        // Generate 1000 request IDs and check they're all unique
        for _ in 0..1000 {
            let id = generate_request_id();
            assert!(ids.insert(id), "Generated duplicate request ID");
        }
    }

    #[test]
    fn test_generate_region_name_format() {
        let name = generate_region_name();

        let suffix = name.strip_prefix("relay-body-").expect("missing prefix");
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(suffix.chars().all(|c| !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_generate_region_name_uniqueness() {
        let mut names = HashSet::new();

        for _ in 0..1000 {
            let name = generate_region_name();
            assert!(names.insert(name), "Generated duplicate region name");
        }
    }
}
