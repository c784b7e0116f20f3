use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use snipvault_api::{SnipVaultApi, SubjectResolver};
use snipvault_core::{
    CallerContext, NewSnippet, Patch, SnippetId, SnippetPatch, SUGGESTED_CATEGORIES,
};
use snipvault_store_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "snipvault=info";

#[derive(Debug, Parser)]
#[command(name = "sv")]
#[command(about = "SnipVault CLI")]
struct Cli {
    #[arg(long, env = "SNIPVAULT_DB", default_value = "./snipvault.sqlite3", global = true)]
    db: PathBuf,

    /// Principal to act as for snippet commands.
    #[arg(long = "as", env = "SNIPVAULT_PRINCIPAL", global = true)]
    principal: Option<String>,

    #[arg(
        long,
        env = "SNIPVAULT_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        global = true
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Snippet {
        #[command(subcommand)]
        command: Box<SnippetCommand>,
    },
    /// Distinct categories across your snippets.
    Categories,
    /// Show the principal the CLI acts as.
    Whoami,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SnippetCommand {
    List(SnippetListArgs),
    Get(SnippetIdArgs),
    Add(SnippetAddArgs),
    Update(SnippetUpdateArgs),
    Delete(SnippetIdArgs),
}

#[derive(Debug, Args)]
struct SnippetListArgs {
    /// Exact category; `all` lists everything.
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Args)]
struct SnippetIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct SnippetAddArgs {
    #[arg(long)]
    title: String,
    #[arg(long, required_unless_present = "content_file", conflicts_with = "content_file")]
    content: Option<String>,
    /// Read content from a file instead of `--content`.
    #[arg(long)]
    content_file: Option<PathBuf>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long, default_value_t = false)]
    public: bool,
}

#[derive(Debug, Args)]
struct SnippetUpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long, conflicts_with = "content_file")]
    content: Option<String>,
    #[arg(long)]
    content_file: Option<PathBuf>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    public: Option<bool>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let ctx = cli.principal.map_or_else(CallerContext::anonymous, CallerContext::with_credential);
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Snippet { command } => {
            run_snippet(*command, &SnipVaultApi::new(cli.db, SubjectResolver), &ctx)
        }
        Command::Categories => {
            let api = SnipVaultApi::new(cli.db, SubjectResolver);
            let categories = api.list_categories(&ctx)?;
            emit_json(serde_json::json!({
                "categories": categories,
                "suggested": SUGGESTED_CATEGORIES
            }))
        }
        Command::Whoami => {
            let api = SnipVaultApi::new(cli.db, SubjectResolver);
            let session = api.whoami(&ctx)?;
            emit_json(serde_json::to_value(session).context("failed to serialize session")?)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_snippet(
    command: SnippetCommand,
    api: &SnipVaultApi<SubjectResolver>,
    ctx: &CallerContext,
) -> Result<()> {
    match command {
        SnippetCommand::List(args) => {
            let snippets = api.list_snippets(ctx, args.category.as_deref())?;
            emit_json(serde_json::json!({
                "count": snippets.len(),
                "snippets": snippets
            }))
        }
        SnippetCommand::Get(args) => {
            let snippet = api.get_snippet(ctx, parse_snippet_id(&args.id)?)?;
            let preview = snippet.as_ref().map(|snippet| {
                serde_json::json!({
                    "lines": snippet.line_count(),
                    "chars": snippet.char_count()
                })
            });
            emit_json(serde_json::json!({
                "snippet": snippet,
                "preview": preview
            }))
        }
        SnippetCommand::Add(args) => {
            let content = read_content(args.content, args.content_file.as_deref())?
                .ok_or_else(|| anyhow!("either --content or --content-file is required"))?;
            let created = api.create_snippet(ctx, NewSnippet {
                title: args.title,
                content,
                category: args.category,
                is_public: Some(args.public),
            })?;
            emit_json(serde_json::json!({ "id": created.id }))
        }
        SnippetCommand::Update(args) => {
            let id = parse_snippet_id(&args.id)?;
            let patch = SnippetPatch {
                title: Patch::from(args.title),
                content: Patch::from(read_content(args.content, args.content_file.as_deref())?),
                category: Patch::from(args.category),
                is_public: Patch::from(args.public),
            };
            let updated = api.update_snippet(ctx, id, patch)?;
            emit_json(serde_json::json!({ "id": updated.id }))
        }
        SnippetCommand::Delete(args) => {
            let deleted = api.delete_snippet(ctx, parse_snippet_id(&args.id)?)?;
            emit_json(serde_json::json!({ "id": deleted.id, "deleted": true }))
        }
    }
}

fn read_content(inline: Option<String>, file: Option<&Path>) -> Result<Option<String>> {
    match (inline, file) {
        (Some(content), _) => Ok(Some(content)),
        (None, Some(path)) => fs::read_to_string(path)
            .map(Some)
            .with_context(|| format!("failed to read content file {}", path.display())),
        (None, None) => Ok(None),
    }
}

fn parse_snippet_id(value: &str) -> Result<SnippetId> {
    value.parse::<SnippetId>().with_context(|| format!("invalid snippet id: {value}"))
}
