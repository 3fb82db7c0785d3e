//! Actor naming rules
//!
//! An actor has a base name, unique within its process, and a fully
//! qualified name `base@domain` that is unique across a routing domain.
//! Base names must be non-empty ASCII and must not contain '@'.

/// Qualify `name` with `domain`, unless it is already qualified
pub fn full_name(name: &str, domain: &str) -> String {
    if name.contains('@') {
        name.to_string()
    } else {
        format!("{}@{}", name, domain)
    }
}

/// The domain part of a qualified name, if any
pub fn domain_of(name: &str) -> Option<&str> {
    name.split_once('@').map(|(_, domain)| domain)
}

/// The base part of a (possibly qualified) name
pub fn base_name(name: &str) -> &str {
    name.split_once('@').map(|(base, _)| base).unwrap_or(name)
}

/// Is this a legal unqualified actor name?
pub fn is_valid_base_name(name: &str) -> bool {
    !name.is_empty() && name.is_ascii() && !name.contains('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualification() {
        assert_eq!(full_name("worker", "local"), "worker@local");
        assert_eq!(full_name("worker@other", "local"), "worker@other");
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(domain_of("worker@local"), Some("local"));
        assert_eq!(domain_of("worker"), None);
        assert_eq!(base_name("worker@local"), "worker");
        assert_eq!(base_name("worker"), "worker");
    }

    #[test]
    fn base_name_validity() {
        assert!(is_valid_base_name("worker-1"));
        assert!(!is_valid_base_name(""));
        assert!(!is_valid_base_name("worker@local"));
        assert!(!is_valid_base_name("wörker"));
    }
}
