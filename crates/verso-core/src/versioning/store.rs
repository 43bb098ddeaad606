//! Versioned store: copy-on-write saves and version-aware reads.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use super::chain::{self, check_entries, ChainEntry, VersionChain};
use crate::config::ArchiveStrategy;
use crate::db::Database;
use crate::error::{ErrorCode, VersoError, VersoResult};
use crate::hooks::{ChangeKind, SaveHook};
use crate::schema::{
    quote, Schema, BOOKKEEPING_COLUMNS, COLUMN_MODEL_ID, COLUMN_ROW_ID, COLUMN_VERSION,
};
use crate::scope::{Query, ReadMode};
use crate::types::{Filter, Payload, Record, RecordKey, VersionRow};

/// How a save classifies the change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SaveMode {
    /// Patch when only allowlisted fields changed, otherwise version.
    #[default]
    Auto,
    /// Always patch the current row in place.
    Minor,
    /// Always create a new version, even without changes.
    Major,
}

/// What a save did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SaveOutcome {
    /// First version of a new entity was inserted.
    Created,
    /// A new version was written and the prior state archived.
    Versioned {
        archived_row_id: RecordKey,
        previous_version: u32,
    },
    /// The current row was patched in place.
    Patched,
    /// Nothing changed; nothing was written.
    Unchanged,
}

/// Result of a successful save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRecord {
    /// The row now holding the record's state.
    pub row: VersionRow,
    pub outcome: SaveOutcome,
}

impl SavedRecord {
    pub fn is_new_version(&self) -> bool {
        matches!(self.outcome, SaveOutcome::Versioned { .. })
    }
}

/// Trait for versioned record storage.
pub trait VersionedStore: Send + Sync {
    /// Schema of the table this store manages.
    fn schema(&self) -> &Schema;

    /// Save a record, classifying the change automatically.
    fn save(&self, record: &mut Record) -> VersoResult<SavedRecord> {
        self.save_with(record, SaveMode::Auto)
    }

    /// Save a record as an in-place patch.
    fn save_minor(&self, record: &mut Record) -> VersoResult<SavedRecord> {
        self.save_with(record, SaveMode::Minor)
    }

    /// Save a record with an explicit mode.
    ///
    /// On error the record is left exactly as it was.
    fn save_with(&self, record: &mut Record, mode: SaveMode) -> VersoResult<SavedRecord>;

    /// Rows matching a query.
    fn find(&self, query: &Query) -> VersoResult<Vec<VersionRow>>;

    /// Number of rows matching a query.
    fn count(&self, query: &Query) -> VersoResult<u64>;

    /// First row matching a query.
    fn first(&self, query: &Query) -> VersoResult<Option<VersionRow>> {
        Ok(self.find(&query.clone().limit(1))?.into_iter().next())
    }

    /// The current row of an entity.
    fn find_current(&self, model_id: &RecordKey) -> VersoResult<Option<VersionRow>> {
        let mut rows = self.find(&Query::current().filter(model_filter(model_id)))?;
        if rows.len() > 1 {
            return Err(VersoError::invariant(
                self.schema().table(),
                model_id,
                format!("{} rows are flagged current", rows.len()),
            ));
        }
        if rows.is_empty() && !self.find_all_versions(model_id)?.is_empty() {
            return Err(VersoError::invariant(
                self.schema().table(),
                model_id,
                "no row is flagged current",
            ));
        }
        Ok(rows.pop())
    }

    /// Every version of an entity, oldest first.
    fn find_all_versions(&self, model_id: &RecordKey) -> VersoResult<Vec<VersionRow>> {
        self.find(&Query::with_history().filter(model_filter(model_id)))
    }

    /// Archived versions of an entity, oldest first.
    fn find_only_old(&self, model_id: &RecordKey) -> VersoResult<Vec<VersionRow>> {
        self.find(&Query::only_history().filter(model_filter(model_id)))
    }

    /// One version of an entity, visible under `mode`.
    fn find_version(
        &self,
        model_id: &RecordKey,
        version: u32,
        mode: ReadMode,
    ) -> VersoResult<Option<VersionRow>> {
        self.first(
            &Query::new(mode)
                .filter(model_filter(model_id))
                .filter(Filter::eq(COLUMN_VERSION, version)),
        )
    }

    /// A row by physical key, visible under `mode`.
    fn find_by_row_id(
        &self,
        row_id: &RecordKey,
        mode: ReadMode,
    ) -> VersoResult<Option<VersionRow>> {
        self.first(&Query::new(mode).filter(Filter::eq(COLUMN_ROW_ID, row_id.to_json())))
    }

    /// The whole chain of an entity.
    fn load_chain(&self, model_id: &RecordKey) -> VersoResult<VersionChain> {
        let rows = self.find_all_versions(model_id)?;
        if rows.is_empty() {
            return Err(VersoError::not_found(format!(
                "No rows for '{}' in table '{}'",
                model_id,
                self.schema().table()
            )));
        }
        Ok(VersionChain::new(model_id.clone(), rows))
    }
}

fn model_filter(model_id: &RecordKey) -> Filter {
    Filter::eq(COLUMN_MODEL_ID, model_id.to_json())
}

/// A chain that failed validation during an audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainViolation {
    pub model_id: RecordKey,
    pub message: String,
}

/// Result of scanning every chain in a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub chains_checked: usize,
    pub violations: Vec<ChainViolation>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Columns for one insert.
struct NewRow<'a> {
    row_id: Option<RecordKey>,
    model_id: Option<RecordKey>,
    version: u32,
    is_current: bool,
    previous_row_id: Option<RecordKey>,
    next_row_id: Option<RecordKey>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    payload: &'a Payload,
}

/// SQLite-backed versioned store for one table.
#[derive(Clone)]
pub struct SqliteVersionedStore {
    db: Database,
    schema: Arc<Schema>,
    archive: ArchiveStrategy,
    hooks: Vec<Arc<dyn SaveHook>>,
}

impl SqliteVersionedStore {
    pub(crate) fn new(db: Database, schema: Schema, archive: ArchiveStrategy) -> Self {
        Self {
            db,
            schema: Arc::new(schema),
            archive,
            hooks: Vec::new(),
        }
    }

    /// Register a pre-save hook. Hooks run in registration order.
    pub fn with_hook(mut self, hook: Arc<dyn SaveHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Override the archival strategy from the database config.
    pub fn with_archive_strategy(mut self, strategy: ArchiveStrategy) -> Self {
        self.archive = strategy;
        self
    }

    pub fn archive_strategy(&self) -> ArchiveStrategy {
        self.archive
    }

    /// Check every chain in the table. Nothing is repaired.
    pub fn audit(&self) -> VersoResult<AuditReport> {
        let conn = self.db.lock()?;
        let model_ids: Vec<RecordKey> = {
            let sql = format!(
                "SELECT DISTINCT model_id FROM {} WHERE model_id IS NOT NULL ORDER BY model_id",
                self.schema.quoted_table()
            );
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<RecordKey>, _>>()?;
            ids
        };

        let mut report = AuditReport::default();
        for model_id in model_ids {
            report.chains_checked += 1;
            if let Err(err) = self.check_chain(&conn, &model_id) {
                warn!(
                    table = %self.schema.table(),
                    model_id = %model_id,
                    error = %err,
                    "Chain failed audit"
                );
                report.violations.push(ChainViolation {
                    model_id,
                    message: err.to_string(),
                });
            }
        }

        info!(
            table = %self.schema.table(),
            chains = report.chains_checked,
            violations = report.violations.len(),
            "Audit finished"
        );
        Ok(report)
    }

    fn run_saving_hooks(&self, kind: ChangeKind, record: &Record) -> VersoResult<()> {
        for hook in &self.hooks {
            hook.saving(kind, record)?;
        }
        Ok(())
    }

    fn run_updating_hooks(&self, kind: ChangeKind, record: &Record) -> VersoResult<()> {
        for hook in &self.hooks {
            hook.updating(kind, record)?;
        }
        Ok(())
    }

    fn row_to_version(&self, row: &rusqlite::Row<'_>) -> VersoResult<VersionRow> {
        let version: i64 = row.get(2)?;
        let version = u32::try_from(version)
            .map_err(|_| VersoError::parse(format!("Version {} is out of range", version)))?;

        let mut payload = Payload::new();
        for (offset, def) in self.schema.fields().iter().enumerate() {
            let raw = row.get_ref(BOOKKEEPING_COLUMNS.len() + offset)?;
            payload.insert(def.name.clone(), def.field_type.from_sql(raw)?);
        }

        Ok(VersionRow {
            table: self.schema.table().to_string(),
            row_id: row.get(0)?,
            model_id: row.get(1)?,
            version,
            is_current: row.get(3)?,
            previous_row_id: row.get(4)?,
            next_row_id: row.get(5)?,
            created_at: parse_timestamp(&row.get::<_, String>(6)?)?,
            updated_at: parse_timestamp(&row.get::<_, String>(7)?)?,
            payload,
        })
    }

    fn query_rows(
        &self,
        conn: &Connection,
        sql: &str,
        params: &[SqlValue],
    ) -> VersoResult<Vec<VersionRow>> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(self.row_to_version(row)?);
        }
        Ok(out)
    }

    fn load_row(&self, conn: &Connection, row_id: &RecordKey) -> VersoResult<VersionRow> {
        let sql = format!(
            "SELECT {} FROM {} WHERE row_id = ?",
            self.schema.select_columns(),
            self.schema.quoted_table()
        );
        self.query_rows(conn, &sql, &[row_id.to_sql_value()])?
            .pop()
            .ok_or_else(|| {
                VersoError::not_found(format!(
                    "No row '{}' in table '{}'",
                    row_id,
                    self.schema.table()
                ))
            })
    }

    /// Current rows of an entity, highest version first.
    fn load_current_rows(
        &self,
        conn: &Connection,
        model_id: &RecordKey,
    ) -> VersoResult<Vec<VersionRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE model_id = ? AND is_current = 1 ORDER BY version DESC",
            self.schema.select_columns(),
            self.schema.quoted_table()
        );
        self.query_rows(conn, &sql, &[model_id.to_sql_value()])
    }

    fn max_version(&self, conn: &Connection, model_id: &RecordKey) -> VersoResult<u32> {
        let sql = format!(
            "SELECT COALESCE(MAX(version), 0) FROM {} WHERE model_id = ?",
            self.schema.quoted_table()
        );
        let max: i64 = conn.query_row(&sql, [model_id], |row| row.get(0))?;
        u32::try_from(max)
            .map_err(|_| VersoError::parse(format!("Version {} is out of range", max)))
    }

    fn check_chain(&self, conn: &Connection, model_id: &RecordKey) -> VersoResult<()> {
        let sql = format!(
            "SELECT row_id, version, is_current, previous_row_id, next_row_id FROM {} \
             WHERE model_id = ? ORDER BY version ASC",
            self.schema.quoted_table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map([model_id], |row| {
                Ok(ChainEntry {
                    row_id: row.get(0)?,
                    version: row.get(1)?,
                    is_current: row.get(2)?,
                    previous_row_id: row.get(3)?,
                    next_row_id: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        check_entries(self.schema.table(), model_id, &entries).map_err(|err| {
            warn!(
                table = %self.schema.table(),
                model_id = %model_id,
                error = %err,
                "Chain invariant violated"
            );
            err
        })
    }

    fn insert_row(&self, conn: &Connection, row: NewRow<'_>) -> VersoResult<RecordKey> {
        let columns: Vec<String> = BOOKKEEPING_COLUMNS
            .iter()
            .copied()
            .chain(self.schema.fields().iter().map(|f| f.name.as_str()))
            .map(quote)
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.schema.quoted_table(),
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );

        let key = |k: Option<&RecordKey>| k.map_or(SqlValue::Null, RecordKey::to_sql_value);
        let mut params = vec![
            key(row.row_id.as_ref()),
            key(row.model_id.as_ref()),
            SqlValue::Integer(i64::from(row.version)),
            SqlValue::Integer(i64::from(row.is_current)),
            key(row.previous_row_id.as_ref()),
            key(row.next_row_id.as_ref()),
            SqlValue::Text(row.created_at.to_rfc3339()),
            SqlValue::Text(row.updated_at.to_rfc3339()),
        ];
        params.extend(self.schema.payload_values(row.payload)?);

        conn.execute(&sql, params_from_iter(params.iter()))?;

        Ok(match row.row_id {
            Some(id) => id,
            None => RecordKey::Int(conn.last_insert_rowid()),
        })
    }

    /// Demote every current row of the entity other than `keep`.
    fn demote_strays(
        &self,
        conn: &Connection,
        model_id: &RecordKey,
        keep: &RecordKey,
    ) -> VersoResult<()> {
        let sql = format!(
            "UPDATE {} SET is_current = 0 WHERE model_id = ? AND is_current = 1 AND row_id <> ?",
            self.schema.quoted_table()
        );
        let demoted = conn.execute(&sql, [model_id, keep])?;
        if demoted > 0 {
            warn!(
                table = %self.schema.table(),
                model_id = %model_id,
                demoted,
                "Demoted stray current rows"
            );
        }
        Ok(())
    }

    fn set_link(
        &self,
        conn: &Connection,
        column: &str,
        row_id: &RecordKey,
        target: &RecordKey,
    ) -> VersoResult<()> {
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE row_id = ?",
            self.schema.quoted_table(),
            quote(column)
        );
        conn.execute(&sql, [target, row_id])?;
        Ok(())
    }

    fn conflict(&self, conn: &Connection, expected: &VersionRow) -> VersoError {
        let found = self
            .load_current_rows(conn, &expected.model_id)
            .ok()
            .and_then(|rows| rows.first().map(|r| r.version));
        if found.is_none() && self.max_version(conn, &expected.model_id).unwrap_or(0) > 0 {
            warn!(
                table = %self.schema.table(),
                model_id = %expected.model_id,
                "Entity has no current row"
            );
            return VersoError::invariant(
                self.schema.table(),
                &expected.model_id,
                "no row is flagged current",
            );
        }
        warn!(
            table = %self.schema.table(),
            model_id = %expected.model_id,
            expected = expected.version,
            found = ?found,
            "Concurrent version conflict"
        );
        VersoError::ConcurrentVersionConflict {
            table: self.schema.table().to_string(),
            model_id: expected.model_id.to_string(),
            expected: expected.version,
            found,
        }
    }

    /// The current row as stored, provided it is still the version the
    /// caller loaded.
    fn fresh_current(&self, conn: &Connection, expected: &VersionRow) -> VersoResult<VersionRow> {
        match self.load_current_rows(conn, &expected.model_id)?.into_iter().next() {
            Some(fresh) if fresh.row_id == expected.row_id && fresh.version == expected.version => {
                Ok(fresh)
            }
            _ => Err(self.conflict(conn, expected)),
        }
    }

    fn create(&self, record: &Record) -> VersoResult<VersionRow> {
        self.db.immediate(|tx| {
            let now = Utc::now();
            let row_id = chain::new_row_id(self.schema.key_strategy());
            let model_id = chain::assign_model_id(self.schema.model_id_strategy(), row_id.as_ref());

            let row_id = self.insert_row(
                tx,
                NewRow {
                    row_id,
                    model_id: model_id.clone(),
                    version: 1,
                    is_current: true,
                    previous_row_id: None,
                    next_row_id: None,
                    created_at: now,
                    updated_at: now,
                    payload: record.payload(),
                },
            )?;

            let model_id = match model_id {
                Some(id) => id,
                None => {
                    let sql = format!(
                        "UPDATE {} SET model_id = ?1 WHERE row_id = ?1",
                        self.schema.quoted_table()
                    );
                    tx.execute(&sql, [&row_id])?;
                    row_id.clone()
                }
            };

            self.check_chain(tx, &model_id)?;
            self.load_row(tx, &row_id)
        })
    }

    fn patch(
        &self,
        record: &Record,
        persisted: &VersionRow,
        changed: &BTreeSet<String>,
    ) -> VersoResult<VersionRow> {
        self.db.immediate(|tx| {
            let mut assignments = Vec::with_capacity(changed.len() + 1);
            let mut params = Vec::with_capacity(changed.len() + 3);
            for field in changed {
                let def = self
                    .schema
                    .field_def(field)
                    .ok_or_else(|| VersoError::unknown_field(self.schema.table(), field))?;
                assignments.push(format!("{} = ?", quote(field)));
                params.push(
                    def.field_type
                        .to_sql(field, record.get(field).unwrap_or(&Value::Null))?,
                );
            }
            assignments.push("updated_at = ?".to_string());
            params.push(SqlValue::Text(Utc::now().to_rfc3339()));
            params.push(persisted.row_id.to_sql_value());
            params.push(SqlValue::Integer(i64::from(persisted.version)));

            let sql = format!(
                "UPDATE {} SET {} WHERE row_id = ? AND version = ? AND is_current = 1",
                self.schema.quoted_table(),
                assignments.join(", ")
            );
            if tx.execute(&sql, params_from_iter(params.iter()))? == 0 {
                return Err(self.conflict(tx, persisted));
            }

            self.load_row(tx, &persisted.row_id)
        })
    }

    /// Major edit keeping the current row's physical key.
    fn copy_on_archive(
        &self,
        record: &Record,
        persisted: &VersionRow,
        changed: &BTreeSet<String>,
    ) -> VersoResult<(VersionRow, RecordKey)> {
        self.db.immediate(|tx| {
            let fresh = self.fresh_current(tx, persisted)?;
            let next_version = self.max_version(tx, &fresh.model_id)? + 1;
            let payload = apply_changes(&fresh.payload, record, changed);

            let mut assignments: Vec<String> = self
                .schema
                .fields()
                .iter()
                .map(|f| format!("{} = ?", quote(&f.name)))
                .collect();
            assignments.push("version = ?".to_string());
            assignments.push("updated_at = ?".to_string());

            let mut params = self.schema.payload_values(&payload)?;
            params.push(SqlValue::Integer(i64::from(next_version)));
            params.push(SqlValue::Text(Utc::now().to_rfc3339()));
            params.push(fresh.row_id.to_sql_value());
            params.push(SqlValue::Integer(i64::from(fresh.version)));

            let sql = format!(
                "UPDATE {} SET {} WHERE row_id = ? AND version = ? AND is_current = 1",
                self.schema.quoted_table(),
                assignments.join(", ")
            );
            if tx.execute(&sql, params_from_iter(params.iter()))? == 0 {
                return Err(self.conflict(tx, persisted));
            }

            // The archive copy takes over the old version's slot in the chain.
            let archived = self.insert_row(
                tx,
                NewRow {
                    row_id: chain::new_row_id(self.schema.key_strategy()),
                    model_id: Some(fresh.model_id.clone()),
                    version: fresh.version,
                    is_current: false,
                    previous_row_id: fresh.previous_row_id.clone(),
                    next_row_id: Some(fresh.row_id.clone()),
                    created_at: fresh.created_at,
                    updated_at: fresh.updated_at,
                    payload: &fresh.payload,
                },
            )?;
            self.set_link(tx, "previous_row_id", &fresh.row_id, &archived)?;
            if let Some(previous) = &fresh.previous_row_id {
                self.set_link(tx, "next_row_id", previous, &archived)?;
            }

            self.demote_strays(tx, &fresh.model_id, &fresh.row_id)?;
            self.run_updating_hooks(ChangeKind::MajorEdit, record)?;
            self.check_chain(tx, &fresh.model_id)?;

            Ok((self.load_row(tx, &fresh.row_id)?, archived))
        })
    }

    /// Major edit moving the current state to a new physical row.
    fn promote_new_row(
        &self,
        record: &Record,
        persisted: &VersionRow,
        changed: &BTreeSet<String>,
    ) -> VersoResult<(VersionRow, RecordKey)> {
        self.db.immediate(|tx| {
            let fresh = self.fresh_current(tx, persisted)?;
            let next_version = self.max_version(tx, &fresh.model_id)? + 1;
            let payload = apply_changes(&fresh.payload, record, changed);

            let sql = format!(
                "UPDATE {} SET is_current = 0 WHERE row_id = ? AND version = ? AND is_current = 1",
                self.schema.quoted_table()
            );
            let guard = [
                fresh.row_id.to_sql_value(),
                SqlValue::Integer(i64::from(fresh.version)),
            ];
            let demoted = tx.execute(&sql, params_from_iter(guard.iter()))?;
            if demoted == 0 {
                return Err(self.conflict(tx, persisted));
            }

            let current = self.insert_row(
                tx,
                NewRow {
                    row_id: chain::new_row_id(self.schema.key_strategy()),
                    model_id: Some(fresh.model_id.clone()),
                    version: next_version,
                    is_current: true,
                    previous_row_id: Some(fresh.row_id.clone()),
                    next_row_id: None,
                    created_at: fresh.created_at,
                    updated_at: Utc::now(),
                    payload: &payload,
                },
            )?;
            self.set_link(tx, "next_row_id", &fresh.row_id, &current)?;

            self.demote_strays(tx, &fresh.model_id, &current)?;
            self.run_updating_hooks(ChangeKind::MajorEdit, record)?;
            self.check_chain(tx, &fresh.model_id)?;

            Ok((self.load_row(tx, &current)?, fresh.row_id))
        })
    }

    fn classify(
        &self,
        record: &Record,
        changed: &BTreeSet<String>,
        mode: SaveMode,
    ) -> Option<ChangeKind> {
        match mode {
            SaveMode::Major => Some(ChangeKind::MajorEdit),
            _ if changed.is_empty() => None,
            SaveMode::Minor => Some(ChangeKind::MinorPatch),
            SaveMode::Auto if !record.is_versioned() || self.schema.is_minor_change(changed) => {
                Some(ChangeKind::MinorPatch)
            }
            SaveMode::Auto => Some(ChangeKind::MajorEdit),
        }
    }
}

impl VersionedStore for SqliteVersionedStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn save_with(&self, record: &mut Record, mode: SaveMode) -> VersoResult<SavedRecord> {
        if record.table() != self.schema.table() {
            return Err(VersoError::IncompatibleSchema {
                left: record.table().to_string(),
                right: self.schema.table().to_string(),
            });
        }
        self.schema.check_payload(record.payload())?;

        // Work on a copy holding stored representations; `record` is only
        // touched once the write has succeeded.
        let mut staged = record.clone();
        staged.replace_payload(self.schema.normalize_payload(record.payload())?);

        let persisted = match staged.persisted() {
            Some(row) => row.clone(),
            None => {
                self.run_saving_hooks(ChangeKind::Create, &staged)?;
                let row = self.create(&staged)?;
                info!(
                    table = %self.schema.table(),
                    model_id = %row.model_id,
                    version = row.version,
                    "Created record"
                );
                staged.mark_persisted(row.clone());
                *record = staged;
                return Ok(SavedRecord {
                    row,
                    outcome: SaveOutcome::Created,
                });
            }
        };

        if !persisted.is_current {
            return Err(VersoError::validation_with_code(
                format!(
                    "Version {} of '{}' is archived and cannot be saved",
                    persisted.version, persisted.model_id
                ),
                ErrorCode::ValArchivedRow,
            ));
        }

        let changed = staged.changed_fields();
        let kind = match self.classify(&staged, &changed, mode) {
            Some(kind) => kind,
            None => {
                debug!(
                    table = %self.schema.table(),
                    model_id = %persisted.model_id,
                    version = persisted.version,
                    "No changes to save"
                );
                *record = staged;
                return Ok(SavedRecord {
                    row: persisted,
                    outcome: SaveOutcome::Unchanged,
                });
            }
        };

        self.run_saving_hooks(kind, &staged)?;

        let saved = if kind == ChangeKind::MinorPatch {
            let row = self.patch(&staged, &persisted, &changed)?;
            debug!(
                table = %self.schema.table(),
                model_id = %row.model_id,
                version = row.version,
                fields = ?changed,
                "Patched current row"
            );
            SavedRecord {
                row,
                outcome: SaveOutcome::Patched,
            }
        } else {
            let (row, archived_row_id) = match self.archive {
                ArchiveStrategy::CopyOnArchive => {
                    self.copy_on_archive(&staged, &persisted, &changed)?
                }
                ArchiveStrategy::PromoteNewRow => {
                    self.promote_new_row(&staged, &persisted, &changed)?
                }
            };
            info!(
                table = %self.schema.table(),
                model_id = %row.model_id,
                version = row.version,
                previous_version = persisted.version,
                "Saved new version"
            );
            SavedRecord {
                row,
                outcome: SaveOutcome::Versioned {
                    archived_row_id,
                    previous_version: persisted.version,
                },
            }
        };

        staged.mark_persisted(saved.row.clone());
        *record = staged;
        Ok(saved)
    }

    fn find(&self, query: &Query) -> VersoResult<Vec<VersionRow>> {
        let compiled = query.compile(&self.schema)?;
        let conn = self.db.lock()?;
        self.query_rows(&conn, &compiled.select_sql(&self.schema), &compiled.params)
    }

    fn count(&self, query: &Query) -> VersoResult<u64> {
        let compiled = query.compile(&self.schema)?;
        let conn = self.db.lock()?;
        let count: i64 = conn.query_row(
            &compiled.count_sql(&self.schema),
            params_from_iter(compiled.params.iter()),
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

/// The stored payload with the record's changed fields written over it.
/// Fields the caller left alone keep whatever is committed now.
fn apply_changes(base: &Payload, record: &Record, changed: &BTreeSet<String>) -> Payload {
    let mut payload = base.clone();
    for field in changed {
        payload.insert(
            field.clone(),
            record.get(field).cloned().unwrap_or(Value::Null),
        );
    }
    payload
}

fn parse_timestamp(raw: &str) -> VersoResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| VersoError::Parse {
            message: format!("Invalid timestamp '{}': {}", raw, e),
            code: ErrorCode::ParseTimestamp,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{MockSaveHook, Rejection};
    use crate::schema::FieldType;
    use crate::versioning::VersionDiffer;
    use serde_json::json;

    fn widgets() -> Schema {
        Schema::new("widgets")
            .required_field("name", FieldType::Text)
            .field("price", FieldType::Real)
            .field("stock", FieldType::Integer)
            .with_minor_fields(["stock"])
    }

    fn store() -> SqliteVersionedStore {
        Database::in_memory().unwrap().versioned(widgets()).unwrap()
    }

    #[test]
    fn test_create_mirrors_row_id() {
        let store = store();
        let mut record = Record::new("widgets").with("name", "A").with("price", 1.5);
        let saved = store.save(&mut record).unwrap();

        assert_eq!(saved.outcome, SaveOutcome::Created);
        assert_eq!(saved.row.version, 1);
        assert!(saved.row.is_current);
        assert_eq!(saved.row.model_id, saved.row.row_id);
        assert_eq!(record.version(), Some(1));
        assert_eq!(record.get("stock"), Some(&Value::Null));
    }

    #[test]
    fn test_major_edit_archives_prior_state() {
        let store = store();
        let mut record = Record::new("widgets").with("name", "A");
        store.save(&mut record).unwrap();
        let original_row_id = record.row_id().cloned().unwrap();

        record.set("name", "B").unwrap();
        let saved = store.save(&mut record).unwrap();

        assert!(saved.is_new_version());
        assert_eq!(saved.row.version, 2);
        // Copy-on-archive keeps the physical key of the current row
        assert_eq!(saved.row.row_id, original_row_id);

        let old = store.find_only_old(&saved.row.model_id).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].version, 1);
        assert_eq!(old[0].get_str("name"), Some("A"));
        assert_eq!(old[0].next_row_id.as_ref(), Some(&original_row_id));
        assert_eq!(saved.row.previous_row_id.as_ref(), Some(&old[0].row_id));
    }

    #[test]
    fn test_minor_edit_patches_in_place() {
        let store = store();
        let mut record = Record::new("widgets").with("name", "A").with("stock", 1);
        store.save(&mut record).unwrap();

        record.set("stock", 5).unwrap();
        let saved = store.save(&mut record).unwrap();
        assert_eq!(saved.outcome, SaveOutcome::Patched);
        assert_eq!(saved.row.version, 1);
        assert_eq!(saved.row.get("stock"), Some(&json!(5)));
        assert_eq!(store.count(&Query::with_history()).unwrap(), 1);
    }

    #[test]
    fn test_unchanged_save_writes_nothing() {
        let store = store();
        let mut record = Record::new("widgets").with("name", "A");
        store.save(&mut record).unwrap();
        let saved = store.save(&mut record).unwrap();
        assert_eq!(saved.outcome, SaveOutcome::Unchanged);
        assert_eq!(store.count(&Query::with_history()).unwrap(), 1);
    }

    #[test]
    fn test_forced_major_save_versions_without_changes() {
        let store = store();
        let mut record = Record::new("widgets").with("name", "A");
        store.save(&mut record).unwrap();
        let saved = store.save_with(&mut record, SaveMode::Major).unwrap();
        assert_eq!(saved.row.version, 2);
    }

    #[test]
    fn test_without_versioning_patches_any_field() {
        let store = store();
        let mut record = Record::new("widgets").with("name", "A").without_versioning();
        store.save(&mut record).unwrap();
        record.set("name", "B").unwrap();
        let saved = store.save(&mut record).unwrap();
        assert_eq!(saved.outcome, SaveOutcome::Patched);
        assert_eq!(saved.row.version, 1);
    }

    #[test]
    fn test_stale_record_conflicts() {
        let store = store();
        let mut first = Record::new("widgets").with("name", "A");
        store.save(&mut first).unwrap();
        let mut stale = first.clone();

        first.set("name", "B").unwrap();
        store.save(&mut first).unwrap();

        stale.set("name", "C").unwrap();
        let err = store.save(&mut stale).unwrap_err();
        match err {
            VersoError::ConcurrentVersionConflict {
                expected, found, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(found, Some(2));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // The failed record is untouched
        assert_eq!(stale.version(), Some(1));
        assert_eq!(stale.get("name"), Some(&json!("C")));
    }

    #[test]
    fn test_archived_rows_are_read_only() {
        let store = store();
        let mut record = Record::new("widgets").with("name", "A");
        store.save(&mut record).unwrap();
        record.set("name", "B").unwrap();
        store.save(&mut record).unwrap();

        let archived = store
            .find_version(record.model_id().unwrap(), 1, ReadMode::OnlyHistory)
            .unwrap()
            .unwrap();
        let mut archived = Record::from_row(archived);
        archived.set("name", "Z").unwrap();
        let err = store.save(&mut archived).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValArchivedRow);
    }

    #[test]
    fn test_schema_checks_run_before_writes() {
        let store = store();
        let mut wrong_table = Record::new("gadgets").with("name", "A");
        assert!(matches!(
            store.save(&mut wrong_table),
            Err(VersoError::IncompatibleSchema { .. })
        ));

        let mut bad = Record::new("widgets").with("colour", "red");
        assert_eq!(
            store.save(&mut bad).unwrap_err().code(),
            ErrorCode::ValUnknownField
        );
        assert_eq!(store.count(&Query::with_history()).unwrap(), 0);
    }

    #[test]
    fn test_saving_hook_veto_blocks_write() {
        let mut hook = MockSaveHook::new();
        hook.expect_saving()
            .returning(|kind, _| match kind {
                ChangeKind::Create => Ok(()),
                _ => Err(Rejection::new("frozen")),
            });
        hook.expect_updating().never();

        let store = store().with_hook(Arc::new(hook));
        let mut record = Record::new("widgets").with("name", "A");
        store.save(&mut record).unwrap();

        record.set("name", "B").unwrap();
        let err = store.save(&mut record).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValHookRejected);
        assert_eq!(store.count(&Query::with_history()).unwrap(), 1);
    }

    #[test]
    fn test_updating_hook_veto_rolls_back_archive() {
        let mut hook = MockSaveHook::new();
        hook.expect_saving().returning(|_, _| Ok(()));
        hook.expect_updating()
            .times(1)
            .returning(|_, _| Err(Rejection::new("no edits today")));

        let store = store().with_hook(Arc::new(hook));
        let mut record = Record::new("widgets").with("name", "A");
        store.save(&mut record).unwrap();

        record.set("name", "B").unwrap();
        let err = store.save(&mut record).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValHookRejected);

        let model_id = record.model_id().cloned().unwrap();
        let rows = store.find_all_versions(&model_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("name"), Some("A"));
        assert_eq!(record.version(), Some(1));
    }

    #[test]
    fn test_audit_reports_corrupted_chain() {
        let db = Database::in_memory().unwrap();
        let store = db.versioned(widgets()).unwrap();
        let mut record = Record::new("widgets").with("name", "A");
        store.save(&mut record).unwrap();
        let mut other = Record::new("widgets").with("name", "X");
        store.save(&mut other).unwrap();
        assert!(store.audit().unwrap().is_clean());

        // Break one chain behind the store's back
        db.lock()
            .unwrap()
            .execute("UPDATE widgets SET is_current = 0 WHERE row_id = 1", [])
            .unwrap();

        let report = store.audit().unwrap();
        assert_eq!(report.chains_checked, 2);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].model_id, RecordKey::Int(1));
    }

    #[test]
    fn test_find_current_flags_duplicate_current_rows() {
        let db = Database::in_memory().unwrap();
        let store = db.versioned(widgets()).unwrap();
        let mut record = Record::new("widgets").with("name", "A");
        store.save(&mut record).unwrap();
        record.set("name", "B").unwrap();
        store.save(&mut record).unwrap();

        db.lock()
            .unwrap()
            .execute("UPDATE widgets SET is_current = 1", [])
            .unwrap();

        let err = store.find_current(record.model_id().unwrap()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::VerInvariant);
    }

    #[test]
    fn test_find_current_flags_missing_current_row() {
        let db = Database::in_memory().unwrap();
        let store = db.versioned(widgets()).unwrap();
        let mut record = Record::new("widgets").with("name", "A");
        store.save(&mut record).unwrap();
        record.set("name", "B").unwrap();
        store.save(&mut record).unwrap();

        db.lock()
            .unwrap()
            .execute("UPDATE widgets SET is_current = 0", [])
            .unwrap();

        let model_id = record.model_id().cloned().unwrap();
        let err = store.find_current(&model_id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::VerInvariant);

        record.set("name", "C").unwrap();
        let err = store.save(&mut record).unwrap_err();
        assert_eq!(err.code(), ErrorCode::VerInvariant);

        assert!(store.find_current(&RecordKey::Int(99)).unwrap().is_none());
    }

    fn major_edit_keeps_interleaved_patch(strategy: ArchiveStrategy) {
        let store = store().with_archive_strategy(strategy);
        let mut record = Record::new("widgets").with("name", "A").with("stock", 1);
        store.save(&mut record).unwrap();

        let mut other = record.clone();
        other.set("stock", 5).unwrap();
        assert_eq!(store.save(&mut other).unwrap().outcome, SaveOutcome::Patched);

        record.set("name", "B").unwrap();
        let saved = store.save(&mut record).unwrap();
        assert_eq!(saved.row.version, 2);
        assert_eq!(saved.row.get("stock"), Some(&json!(5)));
        assert_eq!(record.get("stock"), Some(&json!(5)));

        let model_id = record.model_id().cloned().unwrap();
        let rows = store.find_all_versions(&model_id).unwrap();
        assert_eq!(rows.len(), 2);
        let diff = VersionDiffer::new().diff(&rows[0], &rows[1], &[]).unwrap();
        assert_eq!(diff.keys().collect::<Vec<_>>(), vec!["name"]);
    }

    #[test]
    fn test_major_edit_keeps_interleaved_patch_copy_on_archive() {
        major_edit_keeps_interleaved_patch(ArchiveStrategy::CopyOnArchive);
    }

    #[test]
    fn test_major_edit_keeps_interleaved_patch_promote_new_row() {
        major_edit_keeps_interleaved_patch(ArchiveStrategy::PromoteNewRow);
    }

    #[test]
    fn test_integer_for_real_field_is_not_a_change() {
        let store = store();
        let mut record = Record::new("widgets").with("name", "A").with("price", 2);
        store.save(&mut record).unwrap();
        assert_eq!(record.get("price"), Some(&json!(2.0)));

        record.set("price", 2).unwrap();
        let saved = store.save(&mut record).unwrap();
        assert_eq!(saved.outcome, SaveOutcome::Unchanged);
        assert!(!record.is_dirty());

        let model_id = record.model_id().cloned().unwrap();
        assert_eq!(store.find_all_versions(&model_id).unwrap().len(), 1);
    }
}
