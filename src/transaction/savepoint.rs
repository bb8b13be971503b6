//! Savepoint naming.

use ulid::Ulid;

/// Default prefix of generated savepoint names.
pub const DEFAULT_SAVEPOINT_PREFIX: &str = "sp";

/// Names savepoints as `<prefix>_<root id>_<depth>`.
///
/// The root id is unique per root frame, so two roots that happen to be open
/// at the same time on different connections never share a name. Siblings at
/// the same depth reuse a name; the previous one is always released or rolled
/// back first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavepointNamer {
    prefix: String,
}

impl SavepointNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Generate a fresh root id: a lowercase ULID.
    pub fn root_id() -> String {
        Ulid::new().to_string().to_lowercase()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Savepoint name for `depth` inside root `root_id`.
    pub fn name_for(&self, root_id: &str, depth: usize) -> String {
        format!("{}_{}_{}", self.prefix, root_id, depth)
    }
}

impl Default for SavepointNamer {
    fn default() -> Self {
        Self::new(DEFAULT_SAVEPOINT_PREFIX)
    }
}

/// Whether `s` can be used unquoted as a savepoint identifier.
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_deterministic() {
        let namer = SavepointNamer::default();
        assert_eq!(namer.name_for("abc", 2), "sp_abc_2");
        assert_eq!(namer.name_for("abc", 2), namer.name_for("abc", 2));
        assert_ne!(namer.name_for("abc", 2), namer.name_for("abd", 2));
        assert_ne!(namer.name_for("abc", 2), namer.name_for("abc", 3));
    }

    #[test]
    fn test_root_ids_are_unique_identifiers() {
        let a = SavepointNamer::root_id();
        let b = SavepointNamer::root_id();
        assert_ne!(a, b);
        assert!(is_identifier(&SavepointNamer::default().name_for(&a, 1)));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("sp"));
        assert!(is_identifier("_txnest"));
        assert!(!is_identifier("1sp"));
        assert!(!is_identifier("sp-1"));
        assert!(!is_identifier(""));
    }
}
