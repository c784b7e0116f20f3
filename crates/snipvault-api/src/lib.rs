use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use snipvault_core::{
    AccessError, CallerContext, CategoryFilter, IdentityResolver, NewSnippet, PrincipalId,
    Snippet, SnippetAccess, SnippetId, SnippetPatch,
};
use snipvault_store_sqlite::{SchemaStatus, SqliteStore};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Identifier echoed back by create, update and delete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnippetRef {
    pub id: SnippetId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub authenticated: bool,
    pub principal_id: PrincipalId,
}

/// Maps opaque bearer tokens issued by an external auth provider to principals.
#[derive(Debug, Clone, Default)]
pub struct TokenTableResolver {
    tokens: BTreeMap<String, PrincipalId>,
}

#[derive(Debug, Deserialize)]
struct TokenTableFile {
    tokens: BTreeMap<String, PrincipalId>,
}

impl TokenTableResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, principal: PrincipalId) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }

    /// Parse a `{ "tokens": { "<token>": "<principal>" } }` document.
    ///
    /// # Errors
    /// Returns an error when the JSON is malformed, a principal is blank, or a token is empty.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: TokenTableFile =
            serde_json::from_str(raw).context("failed to parse principal token table")?;
        if file.tokens.keys().any(|token| token.trim().is_empty()) {
            return Err(anyhow!("principal token table contains an empty token"));
        }
        Ok(Self { tokens: file.tokens })
    }

    /// Load a token table from disk.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read principal token table {}", path.display()))?;
        let resolver = Self::from_json_str(&raw)
            .with_context(|| format!("invalid principal token table {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            tokens = resolver.len(),
            "loaded principal token table"
        );
        Ok(resolver)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityResolver for TokenTableResolver {
    fn resolve(&self, ctx: &CallerContext) -> Option<PrincipalId> {
        ctx.credential().and_then(|token| self.tokens.get(token).cloned())
    }
}

/// Treats the credential itself as the principal subject. Intended for local operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectResolver;

impl IdentityResolver for SubjectResolver {
    fn resolve(&self, ctx: &CallerContext) -> Option<PrincipalId> {
        ctx.credential().and_then(PrincipalId::parse)
    }
}

/// Extract the access-layer error carried by an API failure, if any.
#[must_use]
pub fn access_error(err: &anyhow::Error) -> Option<&AccessError> {
    err.downcast_ref::<AccessError>()
}

#[derive(Debug, Clone)]
pub struct SnipVaultApi<R> {
    db_path: PathBuf,
    access: SnippetAccess<R>,
}

impl<R: IdentityResolver> SnipVaultApi<R> {
    #[must_use]
    pub fn new(db_path: PathBuf, resolver: R) -> Self {
        Self { db_path, access: SnippetAccess::new(resolver) }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    // Authentication runs before the database is opened.
    fn open_for(&self, ctx: &CallerContext) -> Result<SqliteStore> {
        self.access.authenticate(ctx)?;
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Report the caller's resolved principal.
    ///
    /// # Errors
    /// Returns [`AccessError::Unauthenticated`] when no identity resolves.
    pub fn whoami(&self, ctx: &CallerContext) -> Result<SessionInfo> {
        let principal_id = self.access.authenticate(ctx)?;
        Ok(SessionInfo { authenticated: true, principal_id })
    }

    /// List the caller's snippets, optionally narrowed to one category.
    ///
    /// # Errors
    /// Returns an error when authentication, migration or the query fails.
    pub fn list_snippets(
        &self,
        ctx: &CallerContext,
        category: Option<&str>,
    ) -> Result<Vec<Snippet>> {
        let store = self.open_for(ctx)?;
        Ok(self.access.list_snippets(ctx, &store, &CategoryFilter::parse(category))?)
    }

    /// # Errors
    /// Returns an error when authentication fails or the snippet belongs to someone else.
    pub fn get_snippet(&self, ctx: &CallerContext, id: SnippetId) -> Result<Option<Snippet>> {
        let store = self.open_for(ctx)?;
        Ok(self.access.get_snippet(ctx, &store, id)?)
    }

    /// # Errors
    /// Returns an error when authentication, validation or persistence fails.
    pub fn create_snippet(&self, ctx: &CallerContext, input: NewSnippet) -> Result<SnippetRef> {
        let mut store = self.open_for(ctx)?;
        let id = self.access.create_snippet(ctx, &mut store, input)?;
        Ok(SnippetRef { id })
    }

    /// # Errors
    /// Returns an error when the snippet is missing, foreign, invalid, or cannot be written.
    pub fn update_snippet(
        &self,
        ctx: &CallerContext,
        id: SnippetId,
        patch: SnippetPatch,
    ) -> Result<SnippetRef> {
        let mut store = self.open_for(ctx)?;
        let id = self.access.update_snippet(ctx, &mut store, id, patch)?;
        Ok(SnippetRef { id })
    }

    /// # Errors
    /// Returns an error when the snippet is missing, foreign, or cannot be removed.
    pub fn delete_snippet(&self, ctx: &CallerContext, id: SnippetId) -> Result<SnippetRef> {
        let mut store = self.open_for(ctx)?;
        let id = self.access.delete_snippet(ctx, &mut store, id)?;
        Ok(SnippetRef { id })
    }

    /// # Errors
    /// Returns an error when authentication, migration or the query fails.
    pub fn list_categories(&self, ctx: &CallerContext) -> Result<Vec<String>> {
        let store = self.open_for(ctx)?;
        Ok(self.access.list_categories(ctx, &store)?)
    }
}
