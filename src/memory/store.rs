//! Table storage with savepoint snapshots.

use std::collections::BTreeMap;

use serde_json::Value;

use super::parser::MemoryStatement;
use crate::connection::{ConnectionError, ConnectionResult};

/// A stored row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct Tables(BTreeMap<String, Vec<Row>>);

impl Tables {
    fn create(&mut self, sql: &str, name: String) -> ConnectionResult<u64> {
        if self.0.contains_key(&name) {
            return Err(ConnectionError::statement(
                sql,
                format!("table {} already exists", name),
            ));
        }
        self.0.insert(name, Vec::new());
        Ok(0)
    }

    fn table_mut(&mut self, sql: &str, name: &str) -> ConnectionResult<&mut Vec<Row>> {
        self.0
            .get_mut(name)
            .ok_or_else(|| ConnectionError::statement(sql, format!("no such table: {}", name)))
    }

    fn insert(
        &mut self,
        sql: &str,
        table: &str,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    ) -> ConnectionResult<u64> {
        let target = self.table_mut(sql, table)?;
        let count = rows.len() as u64;
        target.extend(
            rows.into_iter()
                .map(|values| columns.iter().cloned().zip(values).collect::<Row>()),
        );
        Ok(count)
    }

    fn delete(
        &mut self,
        sql: &str,
        table: &str,
        filter: Option<(String, Value)>,
    ) -> ConnectionResult<u64> {
        let target = self.table_mut(sql, table)?;
        let before = target.len();
        match filter {
            Some((column, value)) => target.retain(|row| row.get(&column) != Some(&value)),
            None => target.clear(),
        }
        Ok((before - target.len()) as u64)
    }
}

#[derive(Debug)]
struct OpenTransaction {
    working: Tables,
    savepoints: Vec<(String, Tables)>,
}

/// Committed state plus at most one open transaction.
///
/// Savepoints snapshot the working copy. Rolling back to a savepoint keeps
/// the savepoint (as SQL does); releasing it drops it and every later one.
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    committed: Tables,
    tx: Option<OpenTransaction>,
}

impl MemoryStore {
    pub(crate) fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    pub(crate) fn savepoint_names(&self) -> Vec<String> {
        self.tx
            .as_ref()
            .map(|tx| tx.savepoints.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn committed_rows(&self, table: &str) -> Vec<Row> {
        self.committed.0.get(table).cloned().unwrap_or_default()
    }

    pub(crate) fn apply(&mut self, sql: &str, statement: MemoryStatement) -> ConnectionResult<u64> {
        match statement {
            MemoryStatement::Begin => {
                if self.tx.is_some() {
                    return Err(ConnectionError::statement(
                        sql,
                        "there is already a transaction in progress",
                    ));
                }
                self.tx = Some(OpenTransaction {
                    working: self.committed.clone(),
                    savepoints: Vec::new(),
                });
                Ok(0)
            }
            MemoryStatement::Commit => {
                self.committed = self.take_tx(sql)?.working;
                Ok(0)
            }
            MemoryStatement::Rollback => {
                self.take_tx(sql)?;
                Ok(0)
            }
            MemoryStatement::Savepoint(name) => {
                let tx = self.tx_mut(sql)?;
                let snapshot = tx.working.clone();
                tx.savepoints.push((name, snapshot));
                Ok(0)
            }
            MemoryStatement::Release(name) => {
                let tx = self.tx_mut(sql)?;
                let index = find_savepoint(tx, sql, &name)?;
                tx.savepoints.truncate(index);
                Ok(0)
            }
            MemoryStatement::RollbackTo(name) => {
                let tx = self.tx_mut(sql)?;
                let index = find_savepoint(tx, sql, &name)?;
                tx.savepoints.truncate(index + 1);
                tx.working = tx.savepoints[index].1.clone();
                Ok(0)
            }
            MemoryStatement::Session => Ok(0),
            MemoryStatement::CreateTable(name) => self.tables_mut().create(sql, name),
            MemoryStatement::Insert {
                table,
                columns,
                rows,
            } => self.tables_mut().insert(sql, &table, columns, rows),
            MemoryStatement::Delete { table, filter } => {
                self.tables_mut().delete(sql, &table, filter)
            }
        }
    }

    /// Writes go to the working copy inside a transaction, else autocommit.
    fn tables_mut(&mut self) -> &mut Tables {
        match self.tx.as_mut() {
            Some(tx) => &mut tx.working,
            None => &mut self.committed,
        }
    }

    fn tx_mut(&mut self, sql: &str) -> ConnectionResult<&mut OpenTransaction> {
        self.tx
            .as_mut()
            .ok_or_else(|| ConnectionError::statement(sql, "no transaction is active"))
    }

    fn take_tx(&mut self, sql: &str) -> ConnectionResult<OpenTransaction> {
        self.tx
            .take()
            .ok_or_else(|| ConnectionError::statement(sql, "no transaction is active"))
    }
}

fn find_savepoint(tx: &OpenTransaction, sql: &str, name: &str) -> ConnectionResult<usize> {
    tx.savepoints
        .iter()
        .rposition(|(existing, _)| existing == name)
        .ok_or_else(|| ConnectionError::statement(sql, format!("no such savepoint: {}", name)))
}
