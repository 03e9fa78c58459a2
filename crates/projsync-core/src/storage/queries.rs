use super::models::*;
use super::sqlite::Database;
use crate::hasher::ContentHash;
use crate::index::IndexEntry;
use crate::sync::{BackupRun, FileFailure, RunStatus, RunTrigger};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result, Row};
use std::path::Path;
use tracing::{debug, warn};

impl Database {
    // ── File Records ─────────────────────────────────────────────

    pub fn load_file_records(&self, scope: &str) -> Result<Vec<FileRecord>> {
        let mut stmt = self.connection().prepare(
            "SELECT path, size, modified_ns, content_hash, indexed \
             FROM file_record WHERE scope = ?1",
        )?;
        let records = stmt
            .query_map(params![scope], |row| {
                let hash: Option<String> = row.get(3)?;
                Ok(FileRecord {
                    path: row.get(0)?,
                    size: row.get::<_, i64>(1)? as u64,
                    modified: row.get(2)?,
                    content_hash: hash.and_then(|h| h.parse::<ContentHash>().ok()),
                    indexed: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        debug!("Loaded {} file records for scope '{}'", records.len(), scope);
        Ok(records)
    }

    pub fn upsert_file_record(&self, scope: &str, record: &FileRecord) -> Result<()> {
        self.connection()
            .prepare_cached(
                "INSERT INTO file_record (scope, path, size, modified_ns, content_hash, indexed) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(scope, path) DO UPDATE SET \
                     size = excluded.size, \
                     modified_ns = excluded.modified_ns, \
                     content_hash = excluded.content_hash, \
                     indexed = excluded.indexed",
            )?
            .execute(params![
                scope,
                record.path,
                record.size as i64,
                record.modified,
                record.content_hash.map(|h| h.to_hex()),
                record.indexed,
            ])?;
        Ok(())
    }

    pub fn delete_file_record(&self, scope: &str, path: &str) -> Result<bool> {
        let n = self.connection().execute(
            "DELETE FROM file_record WHERE scope = ?1 AND path = ?2",
            params![scope, path],
        )?;
        Ok(n > 0)
    }

    // ── Index Entries ────────────────────────────────────────────

    pub fn load_index_entries(&self) -> Result<Vec<IndexEntry>> {
        let mut stmt = self.connection().prepare(
            "SELECT path, content_hash, size, preview, last_indexed \
             FROM index_entry ORDER BY path",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (path, hash, size, preview, last_indexed) in rows {
            let content_hash = match hash.parse::<ContentHash>() {
                Ok(h) => h,
                Err(e) => {
                    warn!("Dropping index entry '{}' with unreadable hash: {}", path, e);
                    continue;
                }
            };
            entries.push(IndexEntry {
                path,
                content_hash,
                size: size as u64,
                preview,
                last_indexed: parse_timestamp(&last_indexed),
            });
        }
        Ok(entries)
    }

    /// Write the entry and replace its full-text row in one transaction.
    pub fn upsert_index_entry(&self, entry: &IndexEntry, body: &str) -> Result<()> {
        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO index_entry (path, content_hash, size, preview, last_indexed) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(path) DO UPDATE SET \
                 content_hash = excluded.content_hash, \
                 size = excluded.size, \
                 preview = excluded.preview, \
                 last_indexed = excluded.last_indexed",
            params![
                entry.path,
                entry.content_hash.to_hex(),
                entry.size as i64,
                entry.preview,
                entry.last_indexed.to_rfc3339(),
            ],
        )?;
        let rowid: i64 = tx.query_row(
            "SELECT rowid FROM index_entry WHERE path = ?1",
            params![entry.path],
            |row| row.get(0),
        )?;
        let name = Path::new(&entry.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tx.execute("DELETE FROM index_fts WHERE rowid = ?1", params![rowid])?;
        tx.execute(
            "INSERT INTO index_fts (rowid, path, name, body) VALUES (?1, ?2, ?3, ?4)",
            params![rowid, entry.path, name, body],
        )?;
        tx.commit()
    }

    pub fn delete_index_entry(&self, path: &str) -> Result<bool> {
        let tx = self.connection().unchecked_transaction()?;
        let n = delete_index_row(&tx, path)?;
        tx.commit()?;
        Ok(n > 0)
    }

    pub fn delete_index_entries(&self, paths: &[String]) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        for path in paths {
            count += delete_index_row(&tx, path)?;
        }
        tx.commit()?;
        Ok(count)
    }

    /// Paths and stored text of entries matching an FTS5 `MATCH` expression.
    pub fn search_index_text(&self, expr: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .connection()
            .prepare_cached("SELECT path, body FROM index_fts WHERE index_fts MATCH ?1")?;
        let rows = stmt
            .query_map(params![expr], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>>>()?;
        debug!("Full-text match '{}' returned {} rows", expr, rows.len());
        Ok(rows)
    }

    // ── Backup Runs ──────────────────────────────────────────────

    pub fn insert_backup_run(&self, run: &BackupRun) -> Result<i64> {
        let failures = serde_json::to_string(run.failures()).unwrap_or_else(|_| "[]".into());
        self.connection().execute(
            "INSERT INTO backup_run \
             (run_trigger, started_at, finished_at, status, files_copied, bytes_copied, \
              files_skipped, files_deleted, failures, abort_reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.trigger().as_str(),
                run.started_at().to_rfc3339(),
                run.finished_at().map(|t| t.to_rfc3339()),
                run.status().as_str(),
                run.files_copied() as i64,
                run.bytes_copied() as i64,
                run.files_skipped() as i64,
                run.files_deleted() as i64,
                failures,
                run.abort_reason(),
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    /// Keep the newest `keep` runs, evicting the oldest. Returns rows removed.
    pub fn prune_backup_runs(&self, keep: usize) -> Result<usize> {
        let removed = self.connection().execute(
            "DELETE FROM backup_run WHERE id NOT IN \
             (SELECT id FROM backup_run ORDER BY id DESC LIMIT ?1)",
            params![keep as i64],
        )?;
        if removed > 0 {
            debug!("Evicted {} old backup runs", removed);
        }
        Ok(removed)
    }

    /// Newest first.
    pub fn list_backup_runs(&self, limit: usize) -> Result<Vec<BackupRun>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, run_trigger, started_at, finished_at, status, files_copied, bytes_copied, \
                    files_skipped, files_deleted, failures, abort_reason \
             FROM backup_run ORDER BY id DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], backup_run_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(runs)
    }
}

fn backup_run_from_row(row: &Row<'_>) -> Result<BackupRun> {
    let trigger: String = row.get(1)?;
    let started_at: String = row.get(2)?;
    let finished_at: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let failures: String = row.get(9)?;
    let failures: Vec<FileFailure> = serde_json::from_str(&failures).unwrap_or_default();

    Ok(BackupRun {
        id: Some(row.get(0)?),
        trigger: RunTrigger::parse(&trigger),
        started_at: parse_timestamp(&started_at),
        finished_at: finished_at.as_deref().map(parse_timestamp),
        status: RunStatus::parse(&status),
        files_copied: row.get::<_, i64>(5)? as u64,
        bytes_copied: row.get::<_, i64>(6)? as u64,
        files_skipped: row.get::<_, i64>(7)? as u64,
        files_deleted: row.get::<_, i64>(8)? as u64,
        failures,
        abort_reason: row.get(10)?,
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn delete_index_row(conn: &Connection, path: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM index_fts WHERE rowid IN (SELECT rowid FROM index_entry WHERE path = ?1)",
        params![path],
    )?;
    conn.execute("DELETE FROM index_entry WHERE path = ?1", params![path])
}
