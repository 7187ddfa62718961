//! Kato persistence: SQLite store for account providers and task resource records.
//! Synchronous under a mutex; every call is a single short statement.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use kato_core::{AccountStore, Provider, RecordFilter, ResourceRecord, ResourceStore, TaskType};
use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

const RECORD_COLUMNS: &str =
    "task_id, task_type, ts, account_name, kind, name, namespace, api_group, resource, version, spinnaker_app";

pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// `KATO_DB_PATH`, else `~/.kato/kato.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KATO_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    /// Open (or create) the database at `path`; `":memory:"` gives a private
    /// in-memory store.
    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS providers (
                name           TEXT PRIMARY KEY,
                host           TEXT NOT NULL,
                ca_data        TEXT NOT NULL,
                bearer_token   TEXT,
                token_provider TEXT
            );
            CREATE TABLE IF NOT EXISTS task_resources (
                task_id       TEXT NOT NULL,
                task_type     TEXT NOT NULL,
                ts            INTEGER NOT NULL,
                account_name  TEXT NOT NULL,
                kind          TEXT NOT NULL,
                name          TEXT NOT NULL,
                namespace     TEXT NOT NULL,
                api_group     TEXT NOT NULL,
                resource      TEXT NOT NULL,
                version       TEXT NOT NULL,
                spinnaker_app TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_resources_task ON task_resources(task_id);
            CREATE INDEX IF NOT EXISTS idx_task_resources_app ON task_resources(spinnaker_app, account_name);",
        )
        .context("creating kato tables")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    /// Insert or replace the provider named `p.name`.
    pub fn put_provider(&self, p: &Provider) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO providers(name, host, ca_data, bearer_token, token_provider) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET host = excluded.host, ca_data = excluded.ca_data,
                 bearer_token = excluded.bearer_token, token_provider = excluded.token_provider",
            params![p.name, p.host, p.ca_data, p.bearer_token, p.token_provider],
        )
        .with_context(|| format!("storing provider {}", p.name))?;
        counter!("persist_provider_put_total", 1u64);
        Ok(())
    }

    pub fn delete_provider(&self, name: &str) -> Result<bool> {
        let n = self.conn()?.execute("DELETE FROM providers WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    pub fn list_providers(&self) -> Result<Vec<Provider>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT name, host, ca_data, bearer_token, token_provider FROM providers ORDER BY name")?;
        let rows = stmt.query_map([], provider_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("listing providers")
    }

    fn select_records(&self, where_clause: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<ResourceRecord>> {
        let started = Instant::now();
        let db = self.conn()?;
        let sql = format!("SELECT {} FROM task_resources WHERE {} ORDER BY ts, rowid", RECORD_COLUMNS, where_clause);
        let mut stmt = db.prepare(&sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_row(row)?);
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<Provider> {
    Ok(Provider {
        name: row.get(0)?,
        host: row.get(1)?,
        ca_data: row.get(2)?,
        bearer_token: row.get(3)?,
        token_provider: row.get(4)?,
    })
}

fn record_from_row(row: &Row<'_>) -> Result<ResourceRecord> {
    let task_type: String = row.get(1)?;
    Ok(ResourceRecord {
        task_id: row.get(0)?,
        task_type: TaskType::from_str(&task_type)?,
        timestamp: row.get(2)?,
        account_name: row.get(3)?,
        kind: row.get(4)?,
        name: row.get(5)?,
        namespace: row.get(6)?,
        api_group: row.get(7)?,
        resource: row.get(8)?,
        version: row.get(9)?,
        spinnaker_app: row.get(10)?,
    })
}

#[async_trait::async_trait]
impl AccountStore for SqliteStore {
    async fn get_provider(&self, name: &str) -> Result<Provider> {
        let db = self.conn()?;
        let found = db
            .query_row(
                "SELECT name, host, ca_data, bearer_token, token_provider FROM providers WHERE name = ?1",
                params![name],
                provider_from_row,
            )
            .optional()
            .with_context(|| format!("loading provider {}", name))?;
        found.ok_or_else(|| anyhow!("provider {} not found", name))
    }

    /// Accounts that hold resources recorded for `app`.
    async fn list_accounts_by_application(&self, app: &str) -> Result<Vec<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT DISTINCT account_name FROM task_resources WHERE spinnaker_app = ?1 ORDER BY account_name")?;
        let rows = stmt.query_map(params![app], |r| r.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("listing accounts by application")
    }
}

#[async_trait::async_trait]
impl ResourceStore for SqliteStore {
    async fn create_resource_record(&self, r: &ResourceRecord) -> Result<()> {
        let started = Instant::now();
        let db = self.conn()?;
        db.execute(
            &format!("INSERT INTO task_resources({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)", RECORD_COLUMNS),
            params![
                r.task_id,
                r.task_type.as_str(),
                r.timestamp,
                r.account_name,
                r.kind,
                r.name,
                r.namespace,
                r.api_group,
                r.resource,
                r.version,
                r.spinnaker_app
            ],
        )
        .with_context(|| format!("recording {} for task {}", r.manifest_name(), r.task_id))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        debug!(task_id = %r.task_id, kind = %r.kind, name = %r.name, "resource recorded");
        Ok(())
    }

    async fn list_resources_by_task_id(&self, task_id: &str) -> Result<Vec<ResourceRecord>> {
        self.select_records("task_id = ?1", &[&task_id])
    }

    async fn list_resources_by_fields(&self, f: &RecordFilter) -> Result<Vec<ResourceRecord>> {
        self.select_records(
            "(?1 IS NULL OR account_name = ?1) AND (?2 IS NULL OR kind = ?2)
             AND (?3 IS NULL OR namespace = ?3) AND (?4 IS NULL OR spinnaker_app = ?4)",
            &[&f.account_name, &f.kind, &f.namespace, &f.spinnaker_app],
        )
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kato");
        let _ = std::fs::create_dir_all(&p);
        p.push("kato.db");
        return p.to_string_lossy().to_string();
    }
    "kato.db".to_string()
}
