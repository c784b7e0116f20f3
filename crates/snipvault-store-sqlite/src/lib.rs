use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snipvault_core::{
    NewSnippetRecord, PrincipalId, Snippet, SnippetChanges, SnippetId, SnippetStore, StoreError,
};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const SNIPPETS_EXPORT_FILE: &str = "snippets.ndjson";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS snippets (
  id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL CHECK (length(trim(owner_id)) > 0),
  title TEXT NOT NULL CHECK (length(trim(title)) > 0),
  content TEXT NOT NULL CHECK (length(trim(content)) > 0),
  category TEXT,
  is_public INTEGER NOT NULL DEFAULT 0 CHECK (is_public IN (0, 1)),
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  CHECK (updated_at >= created_at)
);

CREATE INDEX IF NOT EXISTS idx_snippets_owner ON snippets(owner_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_snippets_owner_category ON snippets(owner_id, category);
";

const SNIPPET_COLUMNS: &str =
    "id, owner_id, title, content, category, is_public, created_at, updated_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_snippets: usize,
    pub skipped_existing_snippets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub snippet_count: i64,
    pub owner_count: i64,
    pub schema_status: SchemaStatus,
}

struct SnippetRow {
    id: String,
    owner_id: String,
    title: String,
    content: String,
    category: Option<String>,
    is_public: bool,
    created_at: i64,
    updated_at: i64,
}

impl SnippetRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            category: row.get(4)?,
            is_public: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_snippet(self) -> Result<Snippet> {
        let id = self
            .id
            .parse::<SnippetId>()
            .with_context(|| format!("invalid snippet id stored in database: {}", self.id))?;
        let owner_id = PrincipalId::parse(&self.owner_id)
            .ok_or_else(|| anyhow!("snippet {id} has a blank owner_id"))?;
        Ok(Snippet {
            id,
            owner_id,
            title: self.title,
            content: self.content,
            category: self.category,
            is_public: self.is_public,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl SqliteStore {
    /// Open a SQLite-backed snippet store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        tracing::debug!(path = %path.display(), "opened sqlite snippet store");
        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let (mut version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        if inferred_from_legacy {
            // Snippets table predates migration tracking.
            record_schema_version(&self.conn, version)?;
        }

        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)] {
            if version < target {
                self.apply_migration(target, sql)?;
                version = target;
            }
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration {version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration {version}"))?;
        tracing::info!(version, "applied schema migration");
        Ok(())
    }

    /// Insert a new snippet row and return its freshly assigned id.
    ///
    /// # Errors
    /// Returns an error when the row violates a table constraint or the write fails.
    pub fn insert_snippet(&mut self, record: &NewSnippetRecord) -> Result<SnippetId> {
        let id = SnippetId::new();
        let tx = self.conn.transaction().context("failed to start insert transaction")?;
        tx.execute(
            "INSERT INTO snippets(
                id, owner_id, title, content, category, is_public, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                record.owner_id.as_str(),
                record.title,
                record.content,
                record.category,
                record.is_public,
                record.created_at,
                record.updated_at,
            ],
        )
        .with_context(|| format!("failed to insert snippet {id}"))?;
        tx.commit().context("failed to commit snippet insert")?;
        Ok(id)
    }

    /// Persist a complete snippet, keeping its id and timestamps.
    ///
    /// # Errors
    /// Returns an error when the snippet is invalid, the id already exists, or the write fails.
    pub fn write_snippet(&mut self, snippet: &Snippet) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start write transaction")?;
        write_snippet_row(&tx, snippet)?;
        tx.commit().context("failed to commit snippet write")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn get_snippet(&self, id: SnippetId) -> Result<Option<Snippet>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {SNIPPET_COLUMNS} FROM snippets WHERE id = ?1"),
                params![id.to_string()],
                SnippetRow::from_row,
            )
            .optional()
            .with_context(|| format!("failed to load snippet {id}"))?;
        row.map(SnippetRow::into_snippet).transpose()
    }

    /// Every snippet owned by `owner`, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn list_by_owner(&self, owner: &PrincipalId) -> Result<Vec<Snippet>> {
        self.query_snippets(
            &format!(
                "SELECT {SNIPPET_COLUMNS} FROM snippets
                 WHERE owner_id = ?1
                 ORDER BY created_at DESC, id DESC"
            ),
            &[&owner.as_str()],
        )
    }

    /// Snippets owned by `owner` in exactly `category`, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn list_by_owner_in_category(
        &self,
        owner: &PrincipalId,
        category: &str,
    ) -> Result<Vec<Snippet>> {
        self.query_snippets(
            &format!(
                "SELECT {SNIPPET_COLUMNS} FROM snippets
                 WHERE owner_id = ?1 AND category = ?2
                 ORDER BY created_at DESC, id DESC"
            ),
            &[&owner.as_str(), &category],
        )
    }

    /// Every stored snippet across all owners, ordered by id. Maintenance use only.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn list_all(&self) -> Result<Vec<Snippet>> {
        self.query_snippets(&format!("SELECT {SNIPPET_COLUMNS} FROM snippets ORDER BY id"), &[])
    }

    fn query_snippets(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Snippet>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare snippet query")?;
        let rows = stmt.query_map(args, SnippetRow::from_row).context("failed to query snippets")?;

        let mut snippets = Vec::new();
        for row in rows {
            snippets.push(row.context("failed to read snippet row")?.into_snippet()?);
        }
        Ok(snippets)
    }

    /// Apply a partial update to an existing snippet inside one transaction.
    ///
    /// # Errors
    /// Returns an error when the snippet does not exist or the update fails.
    pub fn apply_changes(&mut self, id: SnippetId, changes: &SnippetChanges) -> Result<()> {
        // Take the write lock before reading so concurrent updaters queue on busy_timeout.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start update transaction")?;
        let row = tx
            .query_row(
                &format!("SELECT {SNIPPET_COLUMNS} FROM snippets WHERE id = ?1"),
                params![id.to_string()],
                SnippetRow::from_row,
            )
            .optional()
            .with_context(|| format!("failed to load snippet {id} for update"))?;
        let Some(row) = row else {
            return Err(anyhow!("no snippet stored under {id}"));
        };

        let mut snippet = row.into_snippet()?;
        changes.apply(&mut snippet);
        tx.execute(
            "UPDATE snippets
             SET title = ?2, content = ?3, category = ?4, is_public = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                id.to_string(),
                snippet.title,
                snippet.content,
                snippet.category,
                snippet.is_public,
                snippet.updated_at,
            ],
        )
        .with_context(|| format!("failed to update snippet {id}"))?;
        tx.commit().context("failed to commit snippet update")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the snippet does not exist or the delete fails.
    pub fn delete_snippet(&mut self, id: SnippetId) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start delete transaction")?;
        let removed = tx
            .execute("DELETE FROM snippets WHERE id = ?1", params![id.to_string()])
            .with_context(|| format!("failed to delete snippet {id}"))?;
        if removed == 0 {
            return Err(anyhow!("no snippet stored under {id}"));
        }
        tx.commit().context("failed to commit snippet delete")?;
        Ok(())
    }

    /// Export all snippets as NDJSON plus a manifest carrying per-file SHA-256 digests.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let snippets = self.list_all()?;
        let snippets_path = out_dir.join(SNIPPETS_EXPORT_FILE);
        let (sha256, records) = write_ndjson_file(&snippets_path, &snippets)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![ExportFileDigest {
                path: SNIPPETS_EXPORT_FILE.to_string(),
                sha256,
                records,
            }],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        tracing::info!(records, out_dir = %out_dir.display(), "exported snippet snapshot");
        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, parsing, duplicate handling,
    /// or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest_path = in_dir.join("manifest.json");
        let manifest = read_export_manifest(&manifest_path)?;
        validate_import_manifest(in_dir, &manifest)?;

        let snippets = read_ndjson_file::<Snippet>(&in_dir.join(SNIPPETS_EXPORT_FILE))?;
        let mut summary = ImportSummary { imported_snippets: 0, skipped_existing_snippets: 0 };

        // All rows land or none do.
        let tx = self.conn.transaction().context("failed to start import transaction")?;
        for snippet in &snippets {
            if snippet_exists(&tx, snippet.id)? {
                if skip_existing {
                    summary.skipped_existing_snippets += 1;
                    continue;
                }

                return Err(anyhow!("snippet already exists: {}", snippet.id));
            }
            write_snippet_row(&tx, snippet)?;
            summary.imported_snippets += 1;
        }
        tx.commit().context("failed to commit snapshot import")?;

        tracing::info!(
            imported = summary.imported_snippets,
            skipped = summary.skipped_existing_snippets,
            "imported snippet snapshot"
        );
        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check plus row-count and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let (snippet_count, owner_count) = if table_exists(&self.conn, "snippets")? {
            self.conn
                .query_row(
                    "SELECT COUNT(*), COUNT(DISTINCT owner_id) FROM snippets",
                    [],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .context("failed to count snippets")?
        } else {
            (0, 0)
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            snippet_count,
            owner_count,
            schema_status,
        })
    }
}

impl SnippetStore for SqliteStore {
    fn query_by_owner(&self, owner: &PrincipalId) -> Result<Vec<Snippet>, StoreError> {
        self.list_by_owner(owner).map_err(store_error)
    }

    fn query_by_owner_in_category(
        &self,
        owner: &PrincipalId,
        category: &str,
    ) -> Result<Vec<Snippet>, StoreError> {
        self.list_by_owner_in_category(owner, category).map_err(store_error)
    }

    fn get_by_id(&self, id: SnippetId) -> Result<Option<Snippet>, StoreError> {
        self.get_snippet(id).map_err(store_error)
    }

    fn insert(&mut self, record: NewSnippetRecord) -> Result<SnippetId, StoreError> {
        self.insert_snippet(&record).map_err(store_error)
    }

    fn patch(&mut self, id: SnippetId, changes: &SnippetChanges) -> Result<(), StoreError> {
        self.apply_changes(id, changes).map_err(store_error)
    }

    fn delete(&mut self, id: SnippetId) -> Result<(), StoreError> {
        self.delete_snippet(id).map_err(store_error)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn store_error(err: anyhow::Error) -> StoreError {
    tracing::error!(error = %format!("{err:#}"), "sqlite snippet store failure");
    StoreError(format!("{err:#}"))
}

fn write_snippet_row(conn: &Connection, snippet: &Snippet) -> Result<()> {
    snippet.validate().with_context(|| format!("refusing to write snippet {}", snippet.id))?;
    conn.execute(
        "INSERT INTO snippets(
            id, owner_id, title, content, category, is_public, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            snippet.id.to_string(),
            snippet.owner_id.as_str(),
            snippet.title,
            snippet.content,
            snippet.category,
            snippet.is_public,
            snippet.created_at,
            snippet.updated_at,
        ],
    )
    .with_context(|| format!("failed to write snippet {}", snippet.id))?;
    Ok(())
}

fn snippet_exists(conn: &Connection, id: SnippetId) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM snippets WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if snippet exists: {id}"))?;
    Ok(exists == 1)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn index_exists(conn: &Connection, index_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
            params![index_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if index exists: {index_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "snippets")? {
        return Ok((0, false));
    }

    if index_exists(conn, "idx_snippets_owner_category")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    let Some(expected) = by_path.get(SNIPPETS_EXPORT_FILE) else {
        return Err(anyhow!("manifest is missing required file entry: {SNIPPETS_EXPORT_FILE}"));
    };
    let file_path = in_dir.join(SNIPPETS_EXPORT_FILE);
    if !file_path.exists() {
        return Err(anyhow!("manifest references missing file {}", file_path.display()));
    }

    let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
    if actual_sha256 != expected.sha256 {
        return Err(anyhow!(
            "manifest digest mismatch for {SNIPPETS_EXPORT_FILE}: expected {}, got {}",
            expected.sha256,
            actual_sha256
        ));
    }
    if actual_records != expected.records {
        return Err(anyhow!(
            "manifest record count mismatch for {SNIPPETS_EXPORT_FILE}: expected {}, got {}",
            expected.records,
            actual_records
        ));
    }

    Ok(())
}
