use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use ulid::Ulid;

/// Category stamped on snippets created without one.
pub const DEFAULT_CATEGORY: &str = "General";

/// Filter sentinel that disables category filtering on list.
pub const ALL_CATEGORIES: &str = "all";

/// Quick-pick labels offered when creating a snippet. Categories stay free text.
pub const SUGGESTED_CATEGORIES: [&str; 12] = [
    "General",
    "JavaScript",
    "TypeScript",
    "React",
    "Next.js",
    "CSS",
    "HTML",
    "Python",
    "SQL",
    "API",
    "Config",
    "Shell",
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AccessError {
    #[error("not authenticated: sign in to continue")]
    Unauthenticated,
    #[error("snippet not found: {0}")]
    NotFound(SnippetId),
    #[error("access denied: snippet {0} does not belong to the caller")]
    AccessDenied(SnippetId),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
}

/// Failure reported by a [`SnippetStore`] backend.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{0}")]
pub struct StoreError(pub String);

impl From<StoreError> for AccessError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SnippetId(pub Ulid);

impl SnippetId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SnippetId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SnippetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnippetId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self)
    }
}

/// Identifier of an authenticated principal, as issued by the auth provider.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Parse a principal identifier, rejecting blank subjects.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PrincipalId {
    type Error = AccessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
            .ok_or_else(|| AccessError::Validation("principal id MUST be non-empty".to_string()))
    }
}

impl From<PrincipalId> for String {
    fn from(value: PrincipalId) -> Self {
        value.0
    }
}

impl Display for PrincipalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-request authentication context handed to every access-layer operation.
///
/// The credential is opaque to the core; only an [`IdentityResolver`] interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    credential: Option<String>,
}

impl CallerContext {
    #[must_use]
    pub fn anonymous() -> Self {
        Self { credential: None }
    }

    #[must_use]
    pub fn with_credential(credential: impl Into<String>) -> Self {
        Self { credential: Some(credential.into()) }
    }

    #[must_use]
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Snippet {
    pub id: SnippetId,
    pub owner_id: PrincipalId,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Milliseconds since the Unix epoch; never earlier than `created_at`.
    pub updated_at: i64,
}

impl Snippet {
    #[must_use]
    pub fn is_owned_by(&self, principal: &PrincipalId) -> bool {
        &self.owner_id == principal
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.content.split('\n').count()
    }

    #[must_use]
    pub fn char_count(&self) -> usize {
        self.content.chars().count()
    }

    /// Check the record-level invariants a persisted snippet must satisfy.
    ///
    /// # Errors
    /// Returns [`AccessError::Validation`] when title or content is blank, or when
    /// `updated_at` precedes `created_at`.
    pub fn validate(&self) -> Result<(), AccessError> {
        require_text("title", &self.title)?;
        require_text("content", &self.content)?;
        if self.updated_at < self.created_at {
            return Err(AccessError::Validation(
                "updated_at MUST NOT precede created_at".to_string(),
            ));
        }
        Ok(())
    }
}

/// Create request as received from a caller, before defaults are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewSnippet {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

/// Fully-defaulted row handed to [`SnippetStore::insert`]; the store assigns the id.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewSnippetRecord {
    pub owner_id: PrincipalId,
    pub title: String,
    pub content: String,
    pub category: String,
    pub is_public: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Field presence marker for partial updates.
///
/// A missing JSON key deserializes to `Keep`; any present value becomes `Set`.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
}

impl<T> Patch<T> {
    #[must_use]
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }

    #[must_use]
    pub fn as_set(&self) -> Option<&T> {
        match self {
            Self::Keep => None,
            Self::Set(value) => Some(value),
        }
    }
}

impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Keep, Self::Set)
    }
}

impl<T: Serialize> Serialize for Patch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Keep => serializer.serialize_none(),
            Self::Set(value) => value.serialize(serializer),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Self::Set)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnippetPatch {
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub title: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub content: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub category: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub is_public: Patch<bool>,
}

impl SnippetPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_keep()
            && self.content.is_keep()
            && self.category.is_keep()
            && self.is_public.is_keep()
    }

    fn validate(&self) -> Result<(), AccessError> {
        if let Patch::Set(title) = &self.title {
            require_text("title", title)?;
        }
        if let Patch::Set(content) = &self.content {
            require_text("content", content)?;
        }
        Ok(())
    }
}

/// Store-level patch: the caller's provided fields plus the refreshed timestamp.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SnippetChanges {
    pub fields: SnippetPatch,
    pub updated_at: i64,
}

impl SnippetChanges {
    /// Apply only the provided fields, then stamp `updated_at`.
    pub fn apply(&self, snippet: &mut Snippet) {
        if let Patch::Set(title) = &self.fields.title {
            snippet.title.clone_from(title);
        }
        if let Patch::Set(content) = &self.fields.content {
            snippet.content.clone_from(content);
        }
        if let Patch::Set(category) = &self.fields.category {
            snippet.category = Some(category.clone());
        }
        if let Patch::Set(is_public) = self.fields.is_public {
            snippet.is_public = is_public;
        }
        snippet.updated_at = self.updated_at;
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub enum CategoryFilter {
    #[default]
    All,
    Only(String),
}

impl CategoryFilter {
    /// `None`, the empty string and the `"all"` sentinel all disable filtering.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => Self::All,
            Some(value) if value.is_empty() || value == ALL_CATEGORIES => Self::All,
            Some(value) => Self::Only(value.to_string()),
        }
    }

    #[must_use]
    pub fn matches(&self, snippet: &Snippet) -> bool {
        match self {
            Self::All => true,
            Self::Only(category) => snippet.category.as_deref() == Some(category.as_str()),
        }
    }
}

/// Resolves the authenticated principal behind a request, if any.
pub trait IdentityResolver {
    fn resolve(&self, ctx: &CallerContext) -> Option<PrincipalId>;
}

/// Persistent snippet collection, queryable by owner and by primary key.
pub trait SnippetStore {
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn query_by_owner(&self, owner: &PrincipalId) -> Result<Vec<Snippet>, StoreError>;

    /// Owner query narrowed to one exact category. Backends with an index override this.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn query_by_owner_in_category(
        &self,
        owner: &PrincipalId,
        category: &str,
    ) -> Result<Vec<Snippet>, StoreError> {
        let mut snippets = self.query_by_owner(owner)?;
        snippets.retain(|snippet| snippet.category.as_deref() == Some(category));
        Ok(snippets)
    }

    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn get_by_id(&self, id: SnippetId) -> Result<Option<Snippet>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the row cannot be persisted.
    fn insert(&mut self, record: NewSnippetRecord) -> Result<SnippetId, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the row is missing or cannot be updated.
    fn patch(&mut self, id: SnippetId, changes: &SnippetChanges) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the row is missing or cannot be removed.
    fn delete(&mut self, id: SnippetId) -> Result<(), StoreError>;
}

pub trait Clock {
    /// Current wall time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        i64::try_from(millis).unwrap_or(i64::MAX)
    }
}

/// Authorization and query-shaping layer between callers and a [`SnippetStore`].
///
/// Holds no mutable state: every operation authenticates the caller from the
/// supplied [`CallerContext`] and touches only records owned by that principal.
#[derive(Debug, Clone)]
pub struct SnippetAccess<R, C = SystemClock> {
    resolver: R,
    clock: C,
}

impl<R: IdentityResolver> SnippetAccess<R, SystemClock> {
    #[must_use]
    pub fn new(resolver: R) -> Self {
        Self { resolver, clock: SystemClock }
    }
}

impl<R: IdentityResolver, C: Clock> SnippetAccess<R, C> {
    #[must_use]
    pub fn with_clock(resolver: R, clock: C) -> Self {
        Self { resolver, clock }
    }

    /// Resolve the caller's principal.
    ///
    /// # Errors
    /// Returns [`AccessError::Unauthenticated`] when no identity can be resolved.
    pub fn authenticate(&self, ctx: &CallerContext) -> Result<PrincipalId, AccessError> {
        self.resolver.resolve(ctx).ok_or_else(|| {
            tracing::debug!("rejecting request without a resolvable identity");
            AccessError::Unauthenticated
        })
    }

    /// List the caller's snippets, most recently created first.
    ///
    /// # Errors
    /// Returns [`AccessError::Unauthenticated`] or a store failure.
    pub fn list_snippets<S: SnippetStore + ?Sized>(
        &self,
        ctx: &CallerContext,
        store: &S,
        filter: &CategoryFilter,
    ) -> Result<Vec<Snippet>, AccessError> {
        let principal = self.authenticate(ctx)?;
        let mut snippets = match filter {
            CategoryFilter::All => store.query_by_owner(&principal)?,
            CategoryFilter::Only(category) => {
                store.query_by_owner_in_category(&principal, category)?
            }
        };
        snippets.retain(|snippet| snippet.is_owned_by(&principal) && filter.matches(snippet));
        sort_most_recent_first(&mut snippets);
        tracing::debug!(principal = %principal, count = snippets.len(), "listed snippets");
        Ok(snippets)
    }

    /// Fetch one snippet. A missing id is `Ok(None)`, not an error.
    ///
    /// # Errors
    /// Returns [`AccessError::AccessDenied`] when the snippet belongs to another principal.
    pub fn get_snippet<S: SnippetStore + ?Sized>(
        &self,
        ctx: &CallerContext,
        store: &S,
        id: SnippetId,
    ) -> Result<Option<Snippet>, AccessError> {
        let principal = self.authenticate(ctx)?;
        let Some(snippet) = store.get_by_id(id)? else {
            return Ok(None);
        };
        ensure_owner(&principal, &snippet)?;
        Ok(Some(snippet))
    }

    /// Create a snippet owned by the caller, applying category and visibility defaults.
    ///
    /// # Errors
    /// Returns [`AccessError::Validation`] when title or content is blank.
    pub fn create_snippet<S: SnippetStore + ?Sized>(
        &self,
        ctx: &CallerContext,
        store: &mut S,
        input: NewSnippet,
    ) -> Result<SnippetId, AccessError> {
        let principal = self.authenticate(ctx)?;
        require_text("title", &input.title)?;
        require_text("content", &input.content)?;

        let category = input
            .category
            .filter(|category| !category.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
        let now = self.clock.now_ms();

        let id = store.insert(NewSnippetRecord {
            owner_id: principal.clone(),
            title: input.title,
            content: input.content,
            category,
            is_public: input.is_public.unwrap_or(false),
            created_at: now,
            updated_at: now,
        })?;
        tracing::debug!(principal = %principal, snippet_id = %id, "created snippet");
        Ok(id)
    }

    /// Apply the provided fields to one of the caller's snippets and refresh `updated_at`.
    ///
    /// # Errors
    /// Returns [`AccessError::NotFound`], [`AccessError::AccessDenied`], or
    /// [`AccessError::Validation`] for a blank title/content.
    pub fn update_snippet<S: SnippetStore + ?Sized>(
        &self,
        ctx: &CallerContext,
        store: &mut S,
        id: SnippetId,
        patch: SnippetPatch,
    ) -> Result<SnippetId, AccessError> {
        let principal = self.authenticate(ctx)?;
        let existing = store.get_by_id(id)?.ok_or(AccessError::NotFound(id))?;
        ensure_owner(&principal, &existing)?;
        patch.validate()?;

        // Strictly increasing even when the clock has not advanced.
        let updated_at = self.clock.now_ms().max(existing.updated_at.saturating_add(1));
        store.patch(id, &SnippetChanges { fields: patch, updated_at })?;
        tracing::debug!(principal = %principal, snippet_id = %id, "updated snippet");
        Ok(id)
    }

    /// Permanently delete one of the caller's snippets.
    ///
    /// # Errors
    /// Returns [`AccessError::NotFound`] or [`AccessError::AccessDenied`].
    pub fn delete_snippet<S: SnippetStore + ?Sized>(
        &self,
        ctx: &CallerContext,
        store: &mut S,
        id: SnippetId,
    ) -> Result<SnippetId, AccessError> {
        let principal = self.authenticate(ctx)?;
        let existing = store.get_by_id(id)?.ok_or(AccessError::NotFound(id))?;
        ensure_owner(&principal, &existing)?;
        store.delete(id)?;
        tracing::debug!(principal = %principal, snippet_id = %id, "deleted snippet");
        Ok(id)
    }

    /// Distinct non-empty categories across the caller's snippets, ascending.
    ///
    /// # Errors
    /// Returns [`AccessError::Unauthenticated`] or a store failure.
    pub fn list_categories<S: SnippetStore + ?Sized>(
        &self,
        ctx: &CallerContext,
        store: &S,
    ) -> Result<Vec<String>, AccessError> {
        let principal = self.authenticate(ctx)?;
        let snippets = store.query_by_owner(&principal)?;
        Ok(derive_categories(snippets.iter().filter(|snippet| snippet.is_owned_by(&principal))))
    }
}

fn ensure_owner(principal: &PrincipalId, snippet: &Snippet) -> Result<(), AccessError> {
    if snippet.is_owned_by(principal) {
        return Ok(());
    }
    tracing::warn!(
        principal = %principal,
        snippet_id = %snippet.id,
        "ownership check failed"
    );
    Err(AccessError::AccessDenied(snippet.id))
}

fn require_text(field: &str, value: &str) -> Result<(), AccessError> {
    if value.trim().is_empty() {
        return Err(AccessError::Validation(format!("{field} MUST be non-empty")));
    }
    Ok(())
}

/// Order by `created_at` descending, breaking ties by id descending.
pub fn sort_most_recent_first(snippets: &mut [Snippet]) {
    snippets.sort_by(compare_most_recent_first);
}

fn compare_most_recent_first(lhs: &Snippet, rhs: &Snippet) -> Ordering {
    rhs.created_at.cmp(&lhs.created_at).then_with(|| rhs.id.cmp(&lhs.id))
}

/// Distinct non-empty categories, sorted ascending (case-sensitive).
#[must_use]
pub fn derive_categories<'a>(snippets: impl IntoIterator<Item = &'a Snippet>) -> Vec<String> {
    snippets
        .into_iter()
        .filter_map(|snippet| snippet.category.as_deref())
        .filter(|category| !category.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Map-backed [`SnippetStore`], useful for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnippetStore {
    snippets: BTreeMap<SnippetId, Snippet>,
}

impl InMemorySnippetStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    /// Insert a fully-formed snippet, keeping its id and timestamps.
    pub fn seed(&mut self, snippet: Snippet) {
        self.snippets.insert(snippet.id, snippet);
    }
}

impl SnippetStore for InMemorySnippetStore {
    fn query_by_owner(&self, owner: &PrincipalId) -> Result<Vec<Snippet>, StoreError> {
        Ok(self.snippets.values().filter(|snippet| snippet.is_owned_by(owner)).cloned().collect())
    }

    fn get_by_id(&self, id: SnippetId) -> Result<Option<Snippet>, StoreError> {
        Ok(self.snippets.get(&id).cloned())
    }

    fn insert(&mut self, record: NewSnippetRecord) -> Result<SnippetId, StoreError> {
        let id = SnippetId::new();
        self.snippets.insert(
            id,
            Snippet {
                id,
                owner_id: record.owner_id,
                title: record.title,
                content: record.content,
                category: Some(record.category),
                is_public: record.is_public,
                created_at: record.created_at,
                updated_at: record.updated_at,
            },
        );
        Ok(id)
    }

    fn patch(&mut self, id: SnippetId, changes: &SnippetChanges) -> Result<(), StoreError> {
        let snippet = self
            .snippets
            .get_mut(&id)
            .ok_or_else(|| StoreError(format!("no snippet stored under {id}")))?;
        changes.apply(snippet);
        Ok(())
    }

    fn delete(&mut self, id: SnippetId) -> Result<(), StoreError> {
        self.snippets
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError(format!("no snippet stored under {id}")))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use proptest::prelude::*;

    use super::*;

    /// Treats the credential as the already-verified subject.
    struct SubjectIsCredential;

    impl IdentityResolver for SubjectIsCredential {
        fn resolve(&self, ctx: &CallerContext) -> Option<PrincipalId> {
            ctx.credential().and_then(PrincipalId::parse)
        }
    }

    struct ManualClock(Cell<i64>);

    impl ManualClock {
        fn at(now: i64) -> Self {
            Self(Cell::new(now))
        }

        fn set(&self, now: i64) {
            self.0.set(now);
        }
    }

    impl Clock for &ManualClock {
        fn now_ms(&self) -> i64 {
            self.0.get()
        }
    }

    fn access(clock: &ManualClock) -> SnippetAccess<SubjectIsCredential, &ManualClock> {
        SnippetAccess::with_clock(SubjectIsCredential, clock)
    }

    fn as_user(name: &str) -> CallerContext {
        CallerContext::with_credential(name)
    }

    fn principal(name: &str) -> PrincipalId {
        PrincipalId::parse(name).unwrap_or_else(|| panic!("invalid fixture principal {name}"))
    }

    fn new_snippet(title: &str, content: &str, category: Option<&str>) -> NewSnippet {
        NewSnippet {
            title: title.to_string(),
            content: content.to_string(),
            category: category.map(str::to_string),
            is_public: None,
        }
    }

    fn fetch(store: &InMemorySnippetStore, id: SnippetId) -> Snippet {
        match store.get_by_id(id) {
            Ok(Some(snippet)) => snippet,
            Ok(None) => panic!("fixture snippet {id} missing"),
            Err(err) => panic!("fixture lookup failed: {err}"),
        }
    }

    // Test IDs: TAUTH-001
    #[test]
    fn unauthenticated_callers_are_rejected_before_the_store_is_touched() {
        let clock = ManualClock::at(1_000);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();
        let anonymous = CallerContext::anonymous();
        let blank = CallerContext::with_credential("   ");
        let id = SnippetId::new();

        for ctx in [&anonymous, &blank] {
            assert_eq!(
                access.list_snippets(ctx, &store, &CategoryFilter::All),
                Err(AccessError::Unauthenticated)
            );
            assert_eq!(access.get_snippet(ctx, &store, id), Err(AccessError::Unauthenticated));
            assert_eq!(
                access.create_snippet(ctx, &mut store, new_snippet("A", "x", None)),
                Err(AccessError::Unauthenticated)
            );
            assert_eq!(
                access.update_snippet(ctx, &mut store, id, SnippetPatch::default()),
                Err(AccessError::Unauthenticated)
            );
            assert_eq!(
                access.delete_snippet(ctx, &mut store, id),
                Err(AccessError::Unauthenticated)
            );
            assert_eq!(access.list_categories(ctx, &store), Err(AccessError::Unauthenticated));
        }
        assert!(store.is_empty());
    }

    // Test IDs: TCRT-001
    #[test]
    fn create_applies_defaults_and_stamps_equal_timestamps() -> Result<(), AccessError> {
        let clock = ManualClock::at(1_700_000_000_000);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();

        let id = access.create_snippet(&as_user("u1"), &mut store, new_snippet("A", "x", None))?;
        let snippet = fetch(&store, id);

        assert_eq!(snippet.owner_id, principal("u1"));
        assert_eq!(snippet.category.as_deref(), Some(DEFAULT_CATEGORY));
        assert!(!snippet.is_public);
        assert_eq!(snippet.created_at, 1_700_000_000_000);
        assert_eq!(snippet.created_at, snippet.updated_at);

        let empty_category =
            access.create_snippet(&as_user("u1"), &mut store, new_snippet("B", "y", Some("")))?;
        assert_eq!(fetch(&store, empty_category).category.as_deref(), Some(DEFAULT_CATEGORY));
        Ok(())
    }

    // Test IDs: TCRT-002
    #[test]
    fn create_rejects_blank_title_or_content() {
        let clock = ManualClock::at(1);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();

        let blank_title =
            access.create_snippet(&as_user("u1"), &mut store, new_snippet(" \t", "x", None));
        assert!(matches!(blank_title, Err(AccessError::Validation(_))));

        let blank_content =
            access.create_snippet(&as_user("u1"), &mut store, new_snippet("A", "\n  \n", None));
        assert!(matches!(blank_content, Err(AccessError::Validation(_))));
        assert!(store.is_empty());
    }

    // Test IDs: TCRT-003
    #[test]
    fn create_keeps_multiline_content_and_explicit_visibility() -> Result<(), AccessError> {
        let clock = ManualClock::at(5);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();
        let content = "fn main() {\n    println!(\"hi\");\n}";

        let id = access.create_snippet(
            &as_user("u1"),
            &mut store,
            NewSnippet {
                title: "hello".to_string(),
                content: content.to_string(),
                category: Some("Rust".to_string()),
                is_public: Some(true),
            },
        )?;
        let snippet = fetch(&store, id);
        assert_eq!(snippet.content, content);
        assert_eq!(snippet.line_count(), 3);
        assert_eq!(snippet.category.as_deref(), Some("Rust"));
        assert!(snippet.is_public);
        Ok(())
    }

    // Test IDs: TCRT-004
    #[test]
    fn create_and_update_keep_whitespace_categories_as_given() -> Result<(), AccessError> {
        let clock = ManualClock::at(1);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();

        let id =
            access.create_snippet(&as_user("u1"), &mut store, new_snippet("A", "x", Some("  ")))?;
        assert_eq!(fetch(&store, id).category.as_deref(), Some("  "));

        let patch =
            SnippetPatch { category: Patch::Set(" Go ".to_string()), ..SnippetPatch::default() };
        access.update_snippet(&as_user("u1"), &mut store, id, patch)?;
        assert_eq!(fetch(&store, id).category.as_deref(), Some(" Go "));
        Ok(())
    }

    // Test IDs: TLST-001
    #[test]
    fn list_orders_most_recent_first() -> Result<(), AccessError> {
        let clock = ManualClock::at(0);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();

        for created_at in [100, 300, 200] {
            clock.set(created_at);
            access.create_snippet(
                &as_user("u1"),
                &mut store,
                new_snippet(&format!("t{created_at}"), "x", None),
            )?;
        }

        let listed = access.list_snippets(&as_user("u1"), &store, &CategoryFilter::All)?;
        let order = listed.iter().map(|snippet| snippet.created_at).collect::<Vec<_>>();
        assert_eq!(order, vec![300, 200, 100]);
        Ok(())
    }

    // Test IDs: TLST-002
    #[test]
    fn list_filters_by_category_and_sorts_filtered_results() -> Result<(), AccessError> {
        let clock = ManualClock::at(0);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();

        for (created_at, category) in [(10, "Go"), (30, "Rust"), (20, "Go"), (40, "go")] {
            clock.set(created_at);
            access.create_snippet(
                &as_user("u1"),
                &mut store,
                new_snippet("t", "x", Some(category)),
            )?;
        }

        let go = access.list_snippets(&as_user("u1"), &store, &CategoryFilter::parse(Some("Go")))?;
        assert_eq!(go.iter().map(|snippet| snippet.created_at).collect::<Vec<_>>(), vec![20, 10]);

        let everything =
            access.list_snippets(&as_user("u1"), &store, &CategoryFilter::parse(Some("all")))?;
        assert_eq!(everything.len(), 4);

        let none = access.list_snippets(
            &as_user("u1"),
            &store,
            &CategoryFilter::Only("Python".to_string()),
        )?;
        assert!(none.is_empty());
        Ok(())
    }

    // Test IDs: TLST-003
    #[test]
    fn list_ties_on_created_at_are_deterministic() -> Result<(), AccessError> {
        let clock = ManualClock::at(42);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();
        for title in ["a", "b", "c"] {
            access.create_snippet(&as_user("u1"), &mut store, new_snippet(title, "x", None))?;
        }

        let first = access.list_snippets(&as_user("u1"), &store, &CategoryFilter::All)?;
        let second = access.list_snippets(&as_user("u1"), &store, &CategoryFilter::All)?;
        assert_eq!(first, second);
        assert!(first.windows(2).all(|pair| pair[0].id > pair[1].id));
        Ok(())
    }

    // Test IDs: TGET-001
    #[test]
    fn get_distinguishes_missing_from_foreign() -> Result<(), AccessError> {
        let clock = ManualClock::at(1);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();
        let id = access.create_snippet(&as_user("u1"), &mut store, new_snippet("A", "x", None))?;

        assert_eq!(access.get_snippet(&as_user("u1"), &store, SnippetId::new())?, None);
        assert_eq!(
            access.get_snippet(&as_user("u2"), &store, id),
            Err(AccessError::AccessDenied(id))
        );
        let own = access.get_snippet(&as_user("u1"), &store, id)?;
        assert_eq!(own.map(|snippet| snippet.id), Some(id));
        Ok(())
    }

    // Test IDs: TUPD-001
    #[test]
    fn update_preserves_fields_that_were_not_provided() -> Result<(), AccessError> {
        let clock = ManualClock::at(1_000);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();
        let id = access.create_snippet(
            &as_user("u1"),
            &mut store,
            NewSnippet {
                title: "before".to_string(),
                content: "body".to_string(),
                category: Some("SQL".to_string()),
                is_public: Some(true),
            },
        )?;
        let before = fetch(&store, id);

        clock.set(2_000);
        let patch =
            SnippetPatch { title: Patch::Set("after".to_string()), ..SnippetPatch::default() };
        assert_eq!(access.update_snippet(&as_user("u1"), &mut store, id, patch)?, id);

        let after = fetch(&store, id);
        assert_eq!(after.title, "after");
        assert_eq!(after.content, before.content);
        assert_eq!(after.category, before.category);
        assert_eq!(after.is_public, before.is_public);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.updated_at, 2_000);
        Ok(())
    }

    // Test IDs: TUPD-002
    #[test]
    fn update_strictly_advances_updated_at_when_clock_stalls() -> Result<(), AccessError> {
        let clock = ManualClock::at(500);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();
        let id = access.create_snippet(&as_user("u1"), &mut store, new_snippet("A", "x", None))?;

        access.update_snippet(&as_user("u1"), &mut store, id, SnippetPatch::default())?;
        let first = fetch(&store, id).updated_at;
        access.update_snippet(&as_user("u1"), &mut store, id, SnippetPatch::default())?;
        let second = fetch(&store, id).updated_at;

        assert!(first > 500);
        assert!(second > first);

        clock.set(100);
        access.update_snippet(&as_user("u1"), &mut store, id, SnippetPatch::default())?;
        assert!(fetch(&store, id).updated_at > second);
        Ok(())
    }

    // Test IDs: TUPD-003
    #[test]
    fn update_and_delete_report_missing_and_foreign_records() -> Result<(), AccessError> {
        let clock = ManualClock::at(1);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();
        let id = access.create_snippet(&as_user("u1"), &mut store, new_snippet("A", "x", None))?;
        let missing = SnippetId::new();

        assert_eq!(
            access.update_snippet(&as_user("u1"), &mut store, missing, SnippetPatch::default()),
            Err(AccessError::NotFound(missing))
        );
        assert_eq!(
            access.delete_snippet(&as_user("u1"), &mut store, missing),
            Err(AccessError::NotFound(missing))
        );

        let hijack =
            SnippetPatch { title: Patch::Set("mine now".to_string()), ..SnippetPatch::default() };
        assert_eq!(
            access.update_snippet(&as_user("u2"), &mut store, id, hijack),
            Err(AccessError::AccessDenied(id))
        );
        assert_eq!(
            access.delete_snippet(&as_user("u2"), &mut store, id),
            Err(AccessError::AccessDenied(id))
        );

        let untouched = fetch(&store, id);
        assert_eq!(untouched.title, "A");
        assert_eq!(untouched.updated_at, untouched.created_at);
        Ok(())
    }

    // Test IDs: TUPD-004
    #[test]
    fn update_rejects_blank_title_but_accepts_empty_category() -> Result<(), AccessError> {
        let clock = ManualClock::at(1);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();
        let id =
            access.create_snippet(&as_user("u1"), &mut store, new_snippet("A", "x", Some("Go")))?;

        let blank = SnippetPatch { title: Patch::Set("  ".to_string()), ..SnippetPatch::default() };
        assert!(matches!(
            access.update_snippet(&as_user("u1"), &mut store, id, blank),
            Err(AccessError::Validation(_))
        ));

        let cleared =
            SnippetPatch { category: Patch::Set(String::new()), ..SnippetPatch::default() };
        access.update_snippet(&as_user("u1"), &mut store, id, cleared)?;
        assert_eq!(fetch(&store, id).category.as_deref(), Some(""));
        assert!(access.list_categories(&as_user("u1"), &store)?.is_empty());
        Ok(())
    }

    // Test IDs: TCAT-001
    #[test]
    fn categories_are_distinct_sorted_and_scoped_to_caller() -> Result<(), AccessError> {
        let clock = ManualClock::at(1);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();
        for category in ["Shell", "CSS", "Shell", "css"] {
            access.create_snippet(
                &as_user("u1"),
                &mut store,
                new_snippet("t", "x", Some(category)),
            )?;
        }
        access.create_snippet(&as_user("u2"), &mut store, new_snippet("t", "x", Some("Secret")))?;

        let first = access.list_categories(&as_user("u1"), &store)?;
        let second = access.list_categories(&as_user("u1"), &store)?;
        assert_eq!(first, vec!["CSS".to_string(), "Shell".to_string(), "css".to_string()]);
        assert_eq!(first, second);
        Ok(())
    }

    // Test IDs: TE2E-001
    #[test]
    fn create_update_foreign_get_and_delete_scenario() -> Result<(), AccessError> {
        let clock = ManualClock::at(10_000);
        let access = access(&clock);
        let mut store = InMemorySnippetStore::new();
        let u1 = as_user("U1");
        let u2 = as_user("U2");

        let id = access.create_snippet(&u1, &mut store, new_snippet("A", "x", None))?;
        let created = fetch(&store, id);
        assert_eq!(created.category.as_deref(), Some("General"));
        assert!(!created.is_public);
        assert_eq!(created.created_at, created.updated_at);

        clock.set(10_500);
        let patch =
            SnippetPatch { category: Patch::Set("Go".to_string()), ..SnippetPatch::default() };
        access.update_snippet(&u1, &mut store, id, patch)?;
        let updated = fetch(&store, id);
        assert_eq!(updated.category.as_deref(), Some("Go"));
        assert_eq!(updated.title, "A");
        assert_eq!(updated.content, "x");
        assert!(updated.updated_at > updated.created_at);

        assert_eq!(access.get_snippet(&u2, &store, id), Err(AccessError::AccessDenied(id)));

        assert_eq!(access.delete_snippet(&u1, &mut store, id)?, id);
        assert_eq!(access.get_snippet(&u1, &store, id)?, None);
        Ok(())
    }

    // Test IDs: TPATCH-001
    #[test]
    fn patch_json_distinguishes_absent_from_provided() {
        let patch: SnippetPatch = match serde_json::from_str(r#"{"title":"t","category":""}"#) {
            Ok(patch) => patch,
            Err(err) => panic!("patch should deserialize: {err}"),
        };
        assert_eq!(patch.title, Patch::Set("t".to_string()));
        assert_eq!(patch.category, Patch::Set(String::new()));
        assert!(patch.content.is_keep());
        assert!(patch.is_public.is_keep());

        let empty: SnippetPatch = match serde_json::from_str("{}") {
            Ok(patch) => patch,
            Err(err) => panic!("empty patch should deserialize: {err}"),
        };
        assert!(empty.is_empty());
        assert_eq!(SnippetPatch::default(), empty);
        assert_eq!(Patch::<String>::default(), Patch::Keep);

        let rendered = match serde_json::to_string(&patch) {
            Ok(rendered) => rendered,
            Err(err) => panic!("patch should serialize: {err}"),
        };
        assert_eq!(rendered, r#"{"title":"t","category":""}"#);
    }

    // Test IDs: TID-001
    #[test]
    fn principal_ids_reject_blank_subjects() {
        assert_eq!(PrincipalId::parse("  alice "), Some(principal("alice")));
        assert_eq!(PrincipalId::parse(""), None);
        assert!(serde_json::from_str::<PrincipalId>(r#""  ""#).is_err());
        assert!("not-a-ulid".parse::<SnippetId>().is_err());
    }

    // Test IDs: TCAT-002
    #[test]
    fn category_filter_treats_all_sentinel_and_empty_as_unfiltered() {
        assert_eq!(CategoryFilter::parse(None), CategoryFilter::All);
        assert_eq!(CategoryFilter::parse(Some("")), CategoryFilter::All);
        assert_eq!(CategoryFilter::parse(Some("all")), CategoryFilter::All);
        assert_eq!(CategoryFilter::parse(Some("All")), CategoryFilter::Only("All".to_string()));
    }

    fn seeded_store(rows: &[(usize, usize, i64)]) -> InMemorySnippetStore {
        const OWNERS: [&str; 3] = ["ada", "bob", "cy"];
        const CATEGORIES: [&str; 4] = ["Go", "Rust", "", "go"];
        let mut store = InMemorySnippetStore::new();
        for (owner, category, created_at) in rows {
            store.seed(Snippet {
                id: SnippetId::new(),
                owner_id: principal(OWNERS[*owner]),
                title: "t".to_string(),
                content: "x".to_string(),
                category: Some(CATEGORIES[*category].to_string()),
                is_public: false,
                created_at: *created_at,
                updated_at: *created_at,
            });
        }
        store
    }

    // Test IDs: TPROP-001
    proptest! {
        #[test]
        fn property_callers_only_ever_observe_their_own_snippets(
            rows in proptest::collection::vec((0_usize..3, 0_usize..4, 0_i64..1_000), 0..24)
        ) {
            let store = seeded_store(&rows);
            let clock = ManualClock::at(2_000);
            let access = access(&clock);

            for owner in ["ada", "bob", "cy"] {
                let ctx = as_user(owner);
                let me = principal(owner);
                let listed = access.list_snippets(&ctx, &store, &CategoryFilter::All);
                prop_assert!(listed.is_ok());
                let listed = listed.unwrap_or_default();
                prop_assert!(listed.iter().all(|snippet| snippet.owner_id == me));
                prop_assert!(
                    listed.windows(2).all(|pair| pair[0].created_at >= pair[1].created_at)
                );

                for snippet in store.snippets.values().filter(|snippet| snippet.owner_id != me) {
                    prop_assert_eq!(
                        access.get_snippet(&ctx, &store, snippet.id),
                        Err(AccessError::AccessDenied(snippet.id))
                    );
                }
            }
        }
    }

    // Test IDs: TPROP-002
    proptest! {
        #[test]
        fn property_categories_are_sorted_unique_and_non_empty(
            rows in proptest::collection::vec((0_usize..3, 0_usize..4, 0_i64..1_000), 0..24)
        ) {
            let store = seeded_store(&rows);
            let clock = ManualClock::at(2_000);
            let access = access(&clock);

            let first = access.list_categories(&as_user("ada"), &store).unwrap_or_default();
            let second = access.list_categories(&as_user("ada"), &store).unwrap_or_default();
            prop_assert_eq!(&first, &second);
            prop_assert!(first.windows(2).all(|pair| pair[0] < pair[1]));
            prop_assert!(first.iter().all(|category| !category.is_empty()));
        }
    }
}
