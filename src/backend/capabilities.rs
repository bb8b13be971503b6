//! Capability descriptors.
//!
//! A [`Capabilities`] value is the only thing the coordinator knows about a
//! backend. Everything backend specific (statement spelling, savepoint
//! support, what happens on a nested call the backend cannot honour) is read
//! from this table; call sites never branch on the backend's name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::isolation::IsolationLevel;

/// Placeholder substituted with the savepoint name in savepoint templates.
const NAME_PLACEHOLDER: &str = "{name}";

/// What a backend without savepoint support does with a nested call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestedFallback {
    /// Fail the nested call with `NestingUnsupported`.
    #[default]
    Reject,
    /// Run the nested body inside the enclosing frame, without a boundary.
    ///
    /// A cancelled nested call returns `Aborted` at once, but its body is
    /// left running and keeps writing through the enclosing frame until
    /// that frame closes. Nothing can undo those writes short of failing
    /// the enclosing frame.
    Passthrough,
}

/// How the coordinator maps a nested `transaction()` call for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestingPolicy {
    /// Open a savepoint per nested frame.
    Savepoint,
    /// Reuse the enclosing frame.
    Passthrough,
    /// Refuse to nest.
    Reject,
}

/// Where the isolation statement goes relative to the begin statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationPlacement {
    /// Issued before `BEGIN` (MySQL, SQL Server, SQLite pragmas).
    BeforeBegin,
    /// Issued right after `BEGIN` (PostgreSQL).
    #[default]
    AfterBegin,
    /// The isolation statement itself opens the transaction (Oracle).
    ReplacesBegin,
}

/// Isolation statements a backend understands.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IsolationSyntax {
    /// Placement relative to the begin statement.
    #[serde(default)]
    pub placement: IsolationPlacement,
    /// Statement per supported level. Missing levels are unsupported.
    #[serde(default)]
    pub statements: BTreeMap<IsolationLevel, String>,
}

impl IsolationSyntax {
    /// `SET TRANSACTION ISOLATION LEVEL <level>` for the given levels.
    pub fn standard(placement: IsolationPlacement, levels: &[IsolationLevel]) -> Self {
        let statements = levels
            .iter()
            .map(|level| {
                (*level, format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()))
            })
            .collect();
        Self { placement, statements }
    }
}

/// Savepoint statement templates. `{name}` is replaced by the savepoint name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavepointTemplates {
    pub begin: String,
    /// Absent on backends that have no release statement (SQL Server, Oracle).
    #[serde(default)]
    pub release: Option<String>,
    pub rollback_to: String,
}

impl SavepointTemplates {
    /// The ANSI `SAVEPOINT` / `RELEASE SAVEPOINT` / `ROLLBACK TO SAVEPOINT` triple.
    pub fn ansi() -> Self {
        Self {
            begin: "SAVEPOINT {name}".to_string(),
            release: Some("RELEASE SAVEPOINT {name}".to_string()),
            rollback_to: "ROLLBACK TO SAVEPOINT {name}".to_string(),
        }
    }
}

/// Rendered savepoint statements for one savepoint name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavepointStatements {
    pub begin: String,
    pub release: Option<String>,
    pub rollback_to: String,
}

/// Static description of a backend's transaction primitives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Diagnostic label used in logs.
    pub name: String,
    /// Whether nested `transaction()` calls are meaningful on this backend.
    pub supports_nested_transactions: bool,
    /// Policy for nested calls when no savepoint support is available.
    #[serde(default)]
    pub nested_fallback: NestedFallback,
    pub begin: String,
    pub commit: String,
    pub rollback: String,
    /// Savepoint syntax; `None` means the backend has no savepoints.
    #[serde(default)]
    pub savepoints: Option<SavepointTemplates>,
    #[serde(default)]
    pub isolation: IsolationSyntax,
}

impl Capabilities {
    /// PostgreSQL (also CockroachDB): ANSI savepoints, isolation after begin.
    pub fn postgres() -> Self {
        Self {
            name: "postgres".to_string(),
            supports_nested_transactions: true,
            nested_fallback: NestedFallback::Reject,
            begin: "START TRANSACTION".to_string(),
            commit: "COMMIT".to_string(),
            rollback: "ROLLBACK".to_string(),
            savepoints: Some(SavepointTemplates::ansi()),
            isolation: IsolationSyntax::standard(
                IsolationPlacement::AfterBegin,
                &IsolationLevel::ALL,
            ),
        }
    }

    /// MySQL / MariaDB: the isolation statement applies to the next transaction.
    pub fn mysql() -> Self {
        Self {
            name: "mysql".to_string(),
            isolation: IsolationSyntax::standard(
                IsolationPlacement::BeforeBegin,
                &IsolationLevel::ALL,
            ),
            ..Self::postgres()
        }
    }

    /// SQLite: only READ UNCOMMITTED and SERIALIZABLE, through a pragma.
    pub fn sqlite() -> Self {
        let mut statements = BTreeMap::new();
        statements.insert(
            IsolationLevel::ReadUncommitted,
            "PRAGMA read_uncommitted = true".to_string(),
        );
        statements.insert(
            IsolationLevel::Serializable,
            "PRAGMA read_uncommitted = false".to_string(),
        );
        Self {
            name: "sqlite".to_string(),
            begin: "BEGIN TRANSACTION".to_string(),
            isolation: IsolationSyntax {
                placement: IsolationPlacement::BeforeBegin,
                statements,
            },
            ..Self::postgres()
        }
    }

    /// SQL Server: `SAVE TRANSACTION`, no release statement.
    pub fn mssql() -> Self {
        Self {
            name: "mssql".to_string(),
            supports_nested_transactions: true,
            nested_fallback: NestedFallback::Reject,
            begin: "BEGIN TRANSACTION".to_string(),
            commit: "COMMIT".to_string(),
            rollback: "ROLLBACK".to_string(),
            savepoints: Some(SavepointTemplates {
                begin: "SAVE TRANSACTION {name}".to_string(),
                release: None,
                rollback_to: "ROLLBACK TRANSACTION {name}".to_string(),
            }),
            isolation: IsolationSyntax::standard(
                IsolationPlacement::BeforeBegin,
                &IsolationLevel::ALL,
            ),
        }
    }

    /// Oracle: transactions start implicitly; savepoints have no release.
    pub fn oracle() -> Self {
        Self {
            name: "oracle".to_string(),
            supports_nested_transactions: true,
            nested_fallback: NestedFallback::Reject,
            begin: "SET TRANSACTION READ WRITE".to_string(),
            commit: "COMMIT".to_string(),
            rollback: "ROLLBACK".to_string(),
            savepoints: Some(SavepointTemplates {
                begin: "SAVEPOINT {name}".to_string(),
                release: None,
                rollback_to: "ROLLBACK TO SAVEPOINT {name}".to_string(),
            }),
            isolation: IsolationSyntax::standard(
                IsolationPlacement::ReplacesBegin,
                &[IsolationLevel::ReadCommitted, IsolationLevel::Serializable],
            ),
        }
    }

    /// Cloud Spanner: flat transactions only, nesting is rejected.
    pub fn spanner() -> Self {
        Self {
            name: "spanner".to_string(),
            supports_nested_transactions: false,
            nested_fallback: NestedFallback::Reject,
            begin: "BEGIN TRANSACTION".to_string(),
            commit: "COMMIT".to_string(),
            rollback: "ROLLBACK".to_string(),
            savepoints: None,
            isolation: IsolationSyntax::default(),
        }
    }

    /// Drop savepoint support, keeping everything else.
    pub fn without_savepoints(mut self) -> Self {
        self.savepoints = None;
        self
    }

    /// Set whether nested calls are meaningful at all.
    pub fn with_nested_transactions(mut self, value: bool) -> Self {
        self.supports_nested_transactions = value;
        self
    }

    /// Set the fallback used for nested calls without savepoints.
    pub fn with_nested_fallback(mut self, fallback: NestedFallback) -> Self {
        self.nested_fallback = fallback;
        self
    }

    pub fn supports_savepoints(&self) -> bool {
        self.savepoints.is_some()
    }

    pub fn supports_nested_transactions(&self) -> bool {
        self.supports_nested_transactions
    }

    /// Whether `level` can be passed to this backend.
    pub fn supports_isolation(&self, level: IsolationLevel) -> bool {
        self.isolation.statements.contains_key(&level)
    }

    /// How a nested call is mapped on this backend.
    ///
    /// Savepoints are used when the backend both nests and has savepoints. A
    /// backend that nests without savepoints tolerates flat re-entrancy. A
    /// backend that does not nest at all follows its declared fallback.
    pub fn nesting_policy(&self) -> NestingPolicy {
        match (self.supports_nested_transactions, self.supports_savepoints()) {
            (true, true) => NestingPolicy::Savepoint,
            (true, false) => NestingPolicy::Passthrough,
            (false, _) => match self.nested_fallback {
                NestedFallback::Reject => NestingPolicy::Reject,
                NestedFallback::Passthrough => NestingPolicy::Passthrough,
            },
        }
    }

    /// Render the savepoint triple for `name`, if savepoints are supported.
    pub fn savepoint_syntax(&self, name: &str) -> Option<SavepointStatements> {
        self.savepoints.as_ref().map(|t| SavepointStatements {
            begin: t.begin.replace(NAME_PLACEHOLDER, name),
            release: t.release.as_ref().map(|r| r.replace(NAME_PLACEHOLDER, name)),
            rollback_to: t.rollback_to.replace(NAME_PLACEHOLDER, name),
        })
    }

    /// Statements that open a root transaction.
    ///
    /// Levels the backend does not list are left out; the caller decides
    /// whether to warn about it.
    pub fn begin_statements(&self, isolation: Option<IsolationLevel>) -> Vec<String> {
        let set = isolation.and_then(|level| self.isolation.statements.get(&level));
        match (set, self.isolation.placement) {
            (None, _) => vec![self.begin.clone()],
            (Some(set), IsolationPlacement::BeforeBegin) => {
                vec![set.clone(), self.begin.clone()]
            }
            (Some(set), IsolationPlacement::AfterBegin) => {
                vec![self.begin.clone(), set.clone()]
            }
            (Some(set), IsolationPlacement::ReplacesBegin) => vec![set.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nesting_policy_table() {
        assert_eq!(Capabilities::postgres().nesting_policy(), NestingPolicy::Savepoint);
        assert_eq!(Capabilities::spanner().nesting_policy(), NestingPolicy::Reject);
        assert_eq!(
            Capabilities::postgres().without_savepoints().nesting_policy(),
            NestingPolicy::Passthrough
        );
        assert_eq!(
            Capabilities::spanner()
                .with_nested_fallback(NestedFallback::Passthrough)
                .nesting_policy(),
            NestingPolicy::Passthrough
        );
        // A backend that declares no nesting never opens savepoints.
        assert_eq!(
            Capabilities::sqlite().with_nested_transactions(false).nesting_policy(),
            NestingPolicy::Reject
        );
    }

    #[test]
    fn test_savepoint_syntax() {
        let sp = Capabilities::postgres().savepoint_syntax("sp_abc_1").unwrap();
        assert_eq!(sp.begin, "SAVEPOINT sp_abc_1");
        assert_eq!(sp.release.as_deref(), Some("RELEASE SAVEPOINT sp_abc_1"));
        assert_eq!(sp.rollback_to, "ROLLBACK TO SAVEPOINT sp_abc_1");

        let sp = Capabilities::mssql().savepoint_syntax("sp_abc_2").unwrap();
        assert_eq!(sp.begin, "SAVE TRANSACTION sp_abc_2");
        assert_eq!(sp.release, None);
        assert_eq!(sp.rollback_to, "ROLLBACK TRANSACTION sp_abc_2");

        assert!(Capabilities::spanner().savepoint_syntax("x").is_none());
    }

    #[test]
    fn test_begin_statement_placement() {
        let level = Some(IsolationLevel::Serializable);
        assert_eq!(
            Capabilities::postgres().begin_statements(level),
            vec!["START TRANSACTION", "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"]
        );
        assert_eq!(
            Capabilities::mysql().begin_statements(level),
            vec!["SET TRANSACTION ISOLATION LEVEL SERIALIZABLE", "START TRANSACTION"]
        );
        assert_eq!(
            Capabilities::oracle().begin_statements(level),
            vec!["SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"]
        );
        assert_eq!(
            Capabilities::sqlite().begin_statements(Some(IsolationLevel::ReadUncommitted)),
            vec!["PRAGMA read_uncommitted = true", "BEGIN TRANSACTION"]
        );
        assert_eq!(Capabilities::postgres().begin_statements(None), vec!["START TRANSACTION"]);
    }

    #[test]
    fn test_unsupported_isolation_is_dropped() {
        let sqlite = Capabilities::sqlite();
        assert!(!sqlite.supports_isolation(IsolationLevel::ReadCommitted));
        assert_eq!(
            sqlite.begin_statements(Some(IsolationLevel::ReadCommitted)),
            vec!["BEGIN TRANSACTION"]
        );
    }

    #[test]
    fn test_descriptor_from_json() {
        let json = r#"{
            "name": "custom",
            "supports_nested_transactions": false,
            "nested_fallback": "passthrough",
            "begin": "BEGIN",
            "commit": "COMMIT",
            "rollback": "ROLLBACK"
        }"#;
        let caps: Capabilities = serde_json::from_str(json).unwrap();
        assert!(!caps.supports_savepoints());
        assert_eq!(caps.nesting_policy(), NestingPolicy::Passthrough);

        let round = serde_json::to_string(&Capabilities::sqlite()).unwrap();
        let back: Capabilities = serde_json::from_str(&round).unwrap();
        assert_eq!(back, Capabilities::sqlite());
    }
}
