use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use sitepress_core::args::tokenize;
use sitepress_core::config::load_config;
use sitepress_core::exec::ExecutionEngine;
use sitepress_core::pipeline::{PublishReport, PublishSettings, publish_site};
use sitepress_core::publish::{ExistencePolicy, PublishRun, RunOptions};
use sitepress_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready_for_publish, init_layout, inspect_runtime, resolve_paths,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "sitepress",
    version,
    about = "Publish a folder of markdown pages to a SharePoint site through the m365 CLI"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    source_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log at debug level unless RUST_LOG is set")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    source_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            source_dir: cli.source_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Status,
    Publish(PublishArgs),
    #[command(about = "Show how a command line is split into arguments")]
    Tokenize(TokenizeArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .sitepress/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct PublishArgs {
    #[arg(long, value_name = "URL", help = "Site URL (overrides config and SITEPRESS_WEB_URL)")]
    web_url: Option<String>,
    #[arg(long, help = "Walk the whole run without calling the tool")]
    dry_run: bool,
    #[arg(long, help = "Empty the asset folder first and remove untouched pages last")]
    clean_start: bool,
    #[arg(long, help = "Record failures and keep going")]
    continue_on_error: bool,
    #[arg(long, help = "Leave pages that already exist untouched")]
    skip_existing: bool,
    #[arg(long, help = "Never retry failed tool calls")]
    no_retry: bool,
    #[arg(long, help = "Only treat explicit not-found probe failures as missing pages")]
    strict_existence: bool,
    #[arg(long, help = "Print the run report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct TokenizeArgs {
    command_line: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Publish(args)) => run_publish(&runtime, args),
        Some(Commands::Tokenize(args)) => run_tokenize(args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized sitepress layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("source_dir: {}", normalize_path(&paths.source_dir));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let config = load_config(&paths.config_path)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("source_dir_exists: {}", format_flag(status.source_dir_exists));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("pages: {}", status.page_count);
    println!(
        "web_url: {}",
        config.web_url().unwrap_or_else(|| "<unset>".to_string())
    );
    println!("tool: {}", config.tool());
    println!("retry: {}", format_flag(config.retry()));
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_publish(runtime: &RuntimeOptions, args: PublishArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_publish(&paths, &status)?;
    let config = load_config(&paths.config_path)?;

    let web_url = args
        .web_url
        .as_deref()
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
        .or_else(|| config.web_url())
        .ok_or_else(|| {
            anyhow!("no site URL configured; pass --web-url, set [site].web_url or SITEPRESS_WEB_URL")
        })?;

    let mut options = RunOptions::from_config(&config, paths.payload_dir.clone());
    if args.no_retry {
        options.retry = false;
    }
    if args.continue_on_error {
        options.continue_on_error = true;
    }
    if args.skip_existing {
        options.skip_existing_pages = true;
    }
    if args.strict_existence {
        options.existence_policy = ExistencePolicy::Strict;
    }

    let settings = PublishSettings {
        web_url,
        source_dir: paths.source_dir.clone(),
        auth: config.auth_method()?,
        clean_start: args.clean_start || config.clean_start(),
        asset_folder: config.asset_folder().to_string(),
    };
    let engine = ExecutionEngine::system(config.tool()).with_dry_run(args.dry_run);
    let mut run = PublishRun::new(engine, options);

    let report = publish_site(&mut run, &settings)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    if !report.success {
        bail!("publish finished with {} error(s)", report.errors.len());
    }
    Ok(())
}

fn print_report(report: &PublishReport) {
    println!("publish{}", if report.dry_run { " (dry run)" } else { "" });
    println!("web_url: {}", report.web_url);
    for page in &report.pages {
        match &page.detail {
            Some(detail) => println!("  {} {} ({detail})", page.action, page.slug),
            None => println!("  {} {}", page.action, page.slug),
        }
    }
    for status in &report.cleanup {
        println!("  {status}");
    }
    println!("created: {}", report.created);
    println!("updated: {}", report.updated);
    println!("unchanged: {}", report.unchanged);
    println!("cached: {}", report.cached);
    println!("skipped: {}", report.skipped);
    println!("assets: {}", report.assets);
    println!("removed: {}", report.cleanup.len());
    println!(
        "tool_calls: {} (retries: {}, failures: {})",
        report.stats.invocations, report.stats.retries, report.stats.failures
    );
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
}

fn run_tokenize(args: TokenizeArgs) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&tokenize(&args.command_line))?
    );
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        source_dir: runtime.source_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
