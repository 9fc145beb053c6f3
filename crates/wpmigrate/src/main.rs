use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use wpmigrate_core::config::{DEFAULT_LOG_LEVEL, MigrateConfig, load_config};
use wpmigrate_core::ledger::list_ledgers;
use wpmigrate_core::repository::{
    ContentRepository, RepositoryStats, SqliteRepository, load_repository_stats,
};
use wpmigrate_core::run::{MigrationRun, RunOptions, RunReport, Transform};
use wpmigrate_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use wpmigrate_core::schema::{ensure_schema_current, pending_migration_count, run_migrations};
use wpmigrate_core::source::{JsonObjectSource, MigrationObjectSource, SourceOptions};
use wpmigrate_core::transforms::{
    AuthorReassignment, ContentRewrite, PostImport, PostTypeConversion, UserImport,
};

const PENDING_PREVIEW_LIMIT: usize = 10;

#[derive(Debug, Parser)]
#[command(
    name = "wpmigrate",
    version,
    about = "Resumable one-off data migrations for a WordPress-style content database"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Status,
    Db(DbArgs),
    Runs(RunsArgs),
    Users(UsersArgs),
    Posts(PostsArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
    #[arg(long, help = "Skip writing .wpmigrate/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    #[command(about = "Apply pending schema migrations for the configured table prefix")]
    Migrate,
    Stats,
}

#[derive(Debug, Args)]
struct RunsArgs {
    #[command(subcommand)]
    command: RunsSubcommand,
}

#[derive(Debug, Subcommand)]
enum RunsSubcommand {
    #[command(about = "List every run ledger under .wpmigrate/runs")]
    List,
    #[command(about = "Show processed and pending objects for one input")]
    Status(RunSelectArgs),
    #[command(about = "Drop processed markers so objects run again")]
    Reset(RunResetArgs),
}

#[derive(Debug, Args)]
struct RunSelectArgs {
    input: PathBuf,
    #[arg(long, value_name = "KEY")]
    run_key: String,
    #[arg(long, value_name = "FIELD")]
    id_field: Option<String>,
}

#[derive(Debug, Args)]
struct RunResetArgs {
    #[command(flatten)]
    select: RunSelectArgs,
    #[arg(long, value_name = "ID", help = "Only drop the marker of this object")]
    object: Option<String>,
}

#[derive(Debug, Args)]
struct UsersArgs {
    #[command(subcommand)]
    command: UsersSubcommand,
}

#[derive(Debug, Subcommand)]
enum UsersSubcommand {
    #[command(about = "Create users from a JSON export")]
    Import(TransformArgs),
}

#[derive(Debug, Args)]
struct PostsArgs {
    #[command(subcommand)]
    command: PostsSubcommand,
}

#[derive(Debug, Subcommand)]
enum PostsSubcommand {
    #[command(about = "Create posts from a JSON export")]
    Import(TransformArgs),
    #[command(name = "reassign-authors", about = "Point posts at new authors")]
    ReassignAuthors(TransformArgs),
    #[command(name = "convert-type", about = "Change the post_type of listed posts")]
    ConvertType(ConvertTypeArgs),
    #[command(name = "rewrite-content", about = "Search and replace inside post_content")]
    RewriteContent(RewriteContentArgs),
}

#[derive(Debug, Args)]
struct TransformArgs {
    #[arg(value_name = "INPUT", help = "JSON array of records")]
    input: PathBuf,
    #[arg(long, value_name = "KEY", help = "Ledger key (defaults to the command name)")]
    run_key: Option<String>,
    #[arg(long, value_name = "FIELD", help = "Record field used as object id")]
    id_field: Option<String>,
    #[arg(long, help = "Apply inside a rolled-back transaction and record nothing")]
    dry_run: bool,
    #[arg(long, value_name = "N", help = "Process at most N pending objects")]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct ConvertTypeArgs {
    #[command(flatten)]
    common: TransformArgs,
    #[arg(long, value_name = "TYPE")]
    to: String,
    #[arg(long, value_name = "TYPE", help = "Refuse posts whose current type differs")]
    from: Option<String>,
}

#[derive(Debug, Args)]
struct RewriteContentArgs {
    #[command(flatten)]
    common: TransformArgs,
    #[arg(long, help = "Print diffs even when not running with --dry-run")]
    show_diff: bool,
}

/// Resolved paths plus the config, loaded once per invocation.
struct CommandContext {
    runtime: RuntimeOptions,
    paths: ResolvedPaths,
    config: Result<MigrateConfig>,
}

impl CommandContext {
    fn config(&self) -> Result<&MigrateConfig> {
        self.config.as_ref().map_err(|err| anyhow!("{err:#}"))
    }

    fn print_diagnostics(&self) {
        if self.runtime.diagnostics {
            println!("\n[diagnostics]\n{}", self.paths.diagnostics());
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);
    let paths = resolve_runtime_paths(&runtime)?;
    let config = load_config(&paths.config_path);
    init_logging(
        config
            .as_ref()
            .map(MigrateConfig::log_level)
            .unwrap_or(DEFAULT_LOG_LEVEL),
    );
    let context = CommandContext {
        runtime,
        paths,
        config,
    };

    match cli.command {
        Some(Commands::Init(args)) => run_init(&context, args),
        Some(Commands::Status) => run_status(&context),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&context),
            DbSubcommand::Stats => run_db_stats(&context),
        },
        Some(Commands::Runs(RunsArgs { command })) => match command {
            RunsSubcommand::List => run_runs_list(&context),
            RunsSubcommand::Status(args) => run_runs_status(&context, args),
            RunsSubcommand::Reset(args) => run_runs_reset(&context, args),
        },
        Some(Commands::Users(UsersArgs { command })) => match command {
            UsersSubcommand::Import(args) => {
                let mut prepared = prepare_run(&context, &args, "users-import")?;
                let default_role = context.config()?.default_role();
                let mut transform = UserImport::new(&prepared.repository, default_role);
                let report = execute_run(&mut prepared.source, &prepared.repository, &mut transform, &args)?;
                print_run_report(&prepared, &report);
                context.print_diagnostics();
                Ok(())
            }
        },
        Some(Commands::Posts(PostsArgs { command })) => match command {
            PostsSubcommand::Import(args) => {
                let mut prepared = prepare_run(&context, &args, "posts-import")?;
                let mut transform = PostImport::new(&prepared.repository);
                let report = execute_run(&mut prepared.source, &prepared.repository, &mut transform, &args)?;
                print_run_report(&prepared, &report);
                context.print_diagnostics();
                Ok(())
            }
            PostsSubcommand::ReassignAuthors(args) => {
                let mut prepared = prepare_run(&context, &args, "posts-reassign-authors")?;
                let mut transform = AuthorReassignment::new(&prepared.repository);
                let report = execute_run(&mut prepared.source, &prepared.repository, &mut transform, &args)?;
                print_run_report(&prepared, &report);
                context.print_diagnostics();
                Ok(())
            }
            PostsSubcommand::ConvertType(args) => run_convert_type(&context, args),
            PostsSubcommand::RewriteContent(args) => run_rewrite_content(&context, args),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(default_level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .format_timestamp_secs()
        .init();
}

fn run_init(context: &CommandContext, args: InitArgs) -> Result<()> {
    let paths = &context.paths;
    let report = init_layout(
        paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized wpmigrate runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("runs_dir: {}", normalize_for_display(&paths.runs_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("next: wpmigrate db migrate");
    context.print_diagnostics();
    Ok(())
}

fn run_status(context: &CommandContext) -> Result<()> {
    let paths = &context.paths;
    let status = inspect_runtime(paths)?;
    let config = context.config()?;
    let table_prefix = config.table_prefix()?;

    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("runs_dir_exists: {}", format_flag(status.runs_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("table_prefix: {table_prefix}");
    println!("durability: {}", config.durability()?.as_str());
    if status.db_exists {
        println!(
            "schema.pending_migrations: {}",
            pending_migration_count(paths, &table_prefix)?
        );
    }
    println!("runs.ledgers: {}", list_ledgers(&paths.runs_dir)?.len());
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    context.print_diagnostics();
    Ok(())
}

fn run_db_migrate(context: &CommandContext) -> Result<()> {
    let paths = &context.paths;
    let table_prefix = context.config()?.table_prefix()?;
    let report = run_migrations(paths, &table_prefix)?;

    println!("db migrate");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("table_prefix: {}", report.table_prefix);
    if report.applied.is_empty() {
        println!("applied: <none> (schema already current)");
    } else {
        for migration in &report.applied {
            println!("applied: v{:03}_{}", migration.version, migration.name);
        }
    }
    println!("schema_version: {}", report.current_version);
    context.print_diagnostics();
    Ok(())
}

fn run_db_stats(context: &CommandContext) -> Result<()> {
    let paths = &context.paths;
    let status = inspect_runtime(paths)?;
    let table_prefix = context.config()?.table_prefix()?;

    println!("db stats");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    match load_repository_stats(paths, &table_prefix)? {
        Some(stats) => print_repository_stats("tables", &stats),
        None => println!("tables: <not created> (run `wpmigrate db migrate`)"),
    }
    context.print_diagnostics();
    Ok(())
}

fn print_repository_stats(prefix: &str, stats: &RepositoryStats) {
    println!("{prefix}.table_prefix: {}", stats.table_prefix);
    println!("{prefix}.users: {}", stats.users);
    println!("{prefix}.usermeta: {}", stats.usermeta);
    println!("{prefix}.posts: {}", stats.posts);
    println!("{prefix}.postmeta: {}", stats.postmeta);
    if stats.posts_by_type.is_empty() {
        println!("{prefix}.posts_by_type: <empty>");
    } else {
        for (post_type, count) in &stats.posts_by_type {
            println!("{prefix}.post_type.{post_type}: {count}");
        }
    }
}

fn run_runs_list(context: &CommandContext) -> Result<()> {
    let paths = &context.paths;
    let ledgers = list_ledgers(&paths.runs_dir)?;

    println!("runs list");
    println!("runs_dir: {}", normalize_for_display(&paths.runs_dir));
    println!("runs.count: {}", ledgers.len());
    if ledgers.is_empty() {
        println!("runs: <none>");
    }
    for ledger in &ledgers {
        println!(
            "run: {} source={} processed={} updated_at_unix={} ledger={}",
            ledger.run_key,
            ledger.source_path,
            ledger.processed,
            ledger.updated_at_unix,
            normalize_for_display(&ledger.path)
        );
    }
    context.print_diagnostics();
    Ok(())
}

fn load_selected_source(context: &CommandContext, select: &RunSelectArgs) -> Result<JsonObjectSource> {
    let ledger_path = context.paths.ledger_path_for(&select.input, &select.run_key);
    JsonObjectSource::load(
        &select.input,
        &ledger_path,
        &select.run_key,
        &SourceOptions {
            id_field: select.id_field.clone(),
            durability: context.config()?.durability()?,
        },
    )
}

fn run_runs_status(context: &CommandContext, args: RunSelectArgs) -> Result<()> {
    let source = load_selected_source(context, &args)?;
    let pending = source.get_unprocessed();

    println!("runs status");
    println!("run_key: {}", source.run_key());
    println!("input: {}", normalize_for_display(source.input_path()));
    println!("ledger: {}", normalize_for_display(source.ledger_path()));
    println!("input_sha256: {}", source.source_sha256());
    println!("input_changed: {}", format_flag(source.source_changed()));
    println!("objects.total: {}", source.len());
    println!("objects.processed: {}", source.processed_count());
    println!("objects.pending: {}", pending.len());
    for object in pending.iter().take(PENDING_PREVIEW_LIMIT) {
        println!("pending: {} (record {})", object.id(), object.position());
    }
    if pending.len() > PENDING_PREVIEW_LIMIT {
        println!("pending: ... {} more", pending.len() - PENDING_PREVIEW_LIMIT);
    }
    context.print_diagnostics();
    Ok(())
}

fn run_runs_reset(context: &CommandContext, args: RunResetArgs) -> Result<()> {
    let mut source = load_selected_source(context, &args.select)?;
    // Database markers go first; a leftover one would be restored into the ledger.
    let database_removed = if context.paths.db_path.exists() {
        let table_prefix = context.config()?.table_prefix()?;
        ensure_schema_current(&context.paths, &table_prefix)?;
        let repository = SqliteRepository::open(&context.paths, &table_prefix)?;
        repository.clear_markers(source.run_key(), source.location(), args.object.as_deref())?
    } else {
        0
    };
    let removed = source.reset_markers(args.object.as_deref())?;
    log::info!(
        "run `{}`: dropped {removed} processed marker(s), {database_removed} database marker(s)",
        source.run_key()
    );

    println!("runs reset");
    println!("run_key: {}", source.run_key());
    println!("input: {}", normalize_for_display(source.input_path()));
    println!(
        "scope: {}",
        args.object
            .as_deref()
            .map(|id| format!("object {id}"))
            .unwrap_or_else(|| "all objects".to_string())
    );
    println!("markers_removed: {removed}");
    println!("database_markers_removed: {database_removed}");
    println!("objects.pending: {}", source.get_unprocessed().len());
    context.print_diagnostics();
    Ok(())
}

fn run_convert_type(context: &CommandContext, args: ConvertTypeArgs) -> Result<()> {
    let mut prepared = prepare_run(context, &args.common, "posts-convert-type")?;
    let mut transform =
        PostTypeConversion::new(&prepared.repository, &args.to, args.from.as_deref())?;
    let report = execute_run(
        &mut prepared.source,
        &prepared.repository,
        &mut transform,
        &args.common,
    )?;
    print_run_report(&prepared, &report);
    context.print_diagnostics();
    Ok(())
}

fn run_rewrite_content(context: &CommandContext, args: RewriteContentArgs) -> Result<()> {
    let mut prepared = prepare_run(context, &args.common, "posts-rewrite-content")?;
    let mut transform = ContentRewrite::new(&prepared.repository);
    let report = execute_run(
        &mut prepared.source,
        &prepared.repository,
        &mut transform,
        &args.common,
    )?;
    print_run_report(&prepared, &report);
    if report.dry_run || args.show_diff {
        for preview in transform.previews() {
            println!(
                "\n[diff] object {} post {} ({} replacement(s))",
                preview.object_id, preview.post_id, preview.replacements
            );
            print!("{}", preview.diff);
        }
    }
    context.print_diagnostics();
    Ok(())
}

struct PreparedRun {
    repository: SqliteRepository,
    source: JsonObjectSource,
    table_prefix: String,
}

/// Shared preflight for every transform command: layout, schema, repository and source.
fn prepare_run(
    context: &CommandContext,
    args: &TransformArgs,
    default_run_key: &str,
) -> Result<PreparedRun> {
    let paths = &context.paths;
    let status = inspect_runtime(paths)?;
    ensure_runtime_ready(paths, &status)?;

    let config = context.config()?;
    let table_prefix = config.table_prefix()?;
    ensure_schema_current(paths, &table_prefix)?;
    let repository = SqliteRepository::open(paths, &table_prefix)?;

    let run_key = args
        .run_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .unwrap_or(default_run_key);
    let ledger_path = paths.ledger_path_for(&args.input, run_key);
    let source = JsonObjectSource::load(
        &args.input,
        &ledger_path,
        run_key,
        &SourceOptions {
            id_field: args.id_field.clone(),
            durability: config.durability()?,
        },
    )?;

    Ok(PreparedRun {
        repository,
        source,
        table_prefix,
    })
}

fn execute_run<T: Transform>(
    source: &mut JsonObjectSource,
    repository: &SqliteRepository,
    transform: &mut T,
    args: &TransformArgs,
) -> Result<RunReport> {
    MigrationRun::new(
        source,
        repository,
        transform,
        RunOptions {
            dry_run: args.dry_run,
            limit: args.limit,
        },
    )
    .start()
}

fn print_run_report(prepared: &PreparedRun, report: &RunReport) {
    println!("run {}", report.transform);
    println!("run_key: {}", report.run_key);
    println!("input: {}", normalize_for_display(prepared.source.input_path()));
    println!("ledger: {}", normalize_for_display(prepared.source.ledger_path()));
    println!("table_prefix: {}", prepared.table_prefix);
    println!("dry_run: {}", format_flag(report.dry_run));
    println!("objects.total: {}", report.total);
    println!("objects.previously_processed: {}", report.previously_processed);
    println!(
        "objects.{}: {}",
        if report.dry_run { "previewed" } else { "processed" },
        report.processed.len()
    );
    println!("objects.remaining: {}", report.remaining);
    for item in &report.processed {
        println!(
            "object: {} (record {}) produced={}{}",
            item.object_id,
            item.position,
            item.produced.len(),
            item.detail
                .as_deref()
                .map(|detail| format!(" {detail}"))
                .unwrap_or_default()
        );
        for source in &item.sources {
            println!(
                "  source: {}.{} = {} <- {}",
                source.table, source.column, source.id, source.source_field
            );
        }
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
