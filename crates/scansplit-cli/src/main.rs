use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;

use scansplit_core::config_file::{self, ConfigFile, ModelConfig};
use scansplit_core::model::{build_client, http_client};
use scansplit_core::store::check_pages;
use scansplit_core::{
    CategoryTaxonomy, Classifier, Filer, GroupingPolicy, MemoryFiler, Orderer, PageTextStore,
    Pipeline, PipelineService, PipelineStatus, ProgressEvent, ScanId, prompt,
};
use scansplit_filing::FsFiler;
use scansplit_ingest::{FileScanStore, is_scan_path, read_pages};

mod output;

use output::ColorMode;

/// Split multi-document page scans into ordered, categorized documents
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug); RUST_LOG wins when set
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Group, order and file one or more scans
    Run(RunArgs),

    /// Print the grouping prompt for a scan without calling a model
    Prompt {
        /// Scan to render (.pdf, .json, .txt or a directory of page files)
        scan: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Show the configured categories and grouping policy
    Categories {
        #[command(flatten)]
        config: ConfigArgs,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Config file, layered over the platform and ./.scansplit.toml configs
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Grouping policy: `packet`, `distinct-title`, or free-form rules
    #[arg(long, value_parser = parse_policy)]
    grouping: Option<GroupingPolicy>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Scans to process (.pdf, .json, .txt or directories of page files)
    #[arg(required = true)]
    scans: Vec<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,

    /// Model backend: openai, ollama or heuristic
    #[arg(long)]
    backend: Option<String>,

    /// Model name
    #[arg(long)]
    model: Option<String>,

    /// API base URL or Ollama host
    #[arg(long)]
    endpoint: Option<String>,

    /// API key for the openai backend
    #[arg(long)]
    api_key: Option<String>,

    /// Separate backend for the ordering step
    #[arg(long)]
    order_backend: Option<String>,

    /// Separate model for the ordering step
    #[arg(long)]
    order_model: Option<String>,

    /// Directory to file documents into
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Move each fully filed scan into this directory
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Group and order, but keep documents in memory instead of filing
    #[arg(long)]
    dry_run: bool,

    /// Scans processed at the same time
    #[arg(long, default_value_t = 2)]
    max_scans: usize,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

/// Known policy names, anything else is taken as free-form rules.
fn parse_policy(value: &str) -> Result<GroupingPolicy, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("grouping policy must not be empty".into());
    }
    Ok(value
        .parse()
        .unwrap_or_else(|_| GroupingPolicy::Custom(value.to_string())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Prompt { scan, config } => print_prompt(&scan, &config),
        Command::Categories { config, no_color } => {
            let file = load_config(&config)?;
            let taxonomy = CategoryTaxonomy::new(file.categories.clone().unwrap_or_default())?;
            let policy = match config.grouping {
                Some(p) => Some(p),
                None => config_file::resolve_config(&file, None)
                    .ok()
                    .map(|c| c.grouping_policy),
            };
            let mut stdout = std::io::stdout();
            output::print_taxonomy(&mut stdout, &taxonomy, policy.as_ref(), ColorMode(!no_color))?;
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(args: &ConfigArgs) -> anyhow::Result<ConfigFile> {
    let mut file = config_file::load_config();
    if let Some(path) = &args.config {
        file = config_file::merge(file, config_file::load_required(path)?);
    }
    Ok(file)
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Resolve the grouping backend: CLI flags > env vars > config file.
fn grouping_model(args: &RunArgs, file: &ConfigFile) -> ModelConfig {
    let from_env = ModelConfig {
        backend: env("SCANSPLIT_BACKEND"),
        endpoint: env("SCANSPLIT_ENDPOINT"),
        api_key: env("SCANSPLIT_API_KEY"),
        model: env("SCANSPLIT_MODEL"),
        requests_per_second: None,
    };
    let from_flags = ModelConfig {
        backend: args.backend.clone(),
        endpoint: args.endpoint.clone(),
        api_key: args.api_key.clone(),
        model: args.model.clone(),
        requests_per_second: None,
    };
    let merged = config_file::merge_model(&file.model, &Some(from_env));
    let mut model = config_file::merge_model(&merged, &Some(from_flags)).unwrap_or_default();
    if model.endpoint.is_none()
        && model
            .backend
            .as_deref()
            .is_some_and(|b| b.eq_ignore_ascii_case("ollama"))
    {
        model.endpoint = env("OLLAMA_HOST");
    }
    model
}

/// The ordering backend, when it differs from the grouping one.
fn ordering_model(args: &RunArgs, file: &ConfigFile, grouping: &ModelConfig) -> Option<ModelConfig> {
    if file.ordering_model.is_none() && args.order_backend.is_none() && args.order_model.is_none() {
        return None;
    }
    let flags = ModelConfig {
        backend: args.order_backend.clone(),
        model: args.order_model.clone(),
        ..Default::default()
    };
    let merged = config_file::merge_model(&Some(grouping.clone()), &file.ordering_model);
    config_file::merge_model(&merged, &Some(flags))
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let file = load_config(&args.config)?;
    let config = config_file::resolve_config(&file, args.config.grouping.clone())?;
    let color = ColorMode(!args.no_color);

    // Scans
    let store = Arc::new(FileScanStore::new());
    let mut scans = Vec::with_capacity(args.scans.len());
    for path in &args.scans {
        if !path.exists() {
            anyhow::bail!("scan not found: {}", path.display());
        }
        if !is_scan_path(path) {
            anyhow::bail!(
                "{} is not a scan (expected .pdf, .json, .txt or a directory)",
                path.display()
            );
        }
        scans.push(store.register(path));
    }

    // Model backends
    let http = http_client();
    let grouping = grouping_model(&args, &file);
    let grouping_client = build_client(&grouping, &http)?;
    let grouping_limiter = config_file::limiter_for(&grouping);
    let classifier = Classifier::new(grouping_client.clone()).with_limiter(grouping_limiter.clone());
    let orderer = match ordering_model(&args, &file, &grouping) {
        Some(section) => {
            tracing::info!(backend = ?section.backend, model = ?section.model, "separate ordering backend");
            Orderer::new(build_client(&section, &http)?).with_limiter(config_file::limiter_for(&section))
        }
        None => Orderer::new(grouping_client).with_limiter(grouping_limiter),
    };

    // Filing
    let paths = file.paths.clone().unwrap_or_default();
    let filer: Arc<dyn Filer> = if args.dry_run {
        Arc::new(MemoryFiler::new())
    } else {
        let output_dir = args
            .output
            .clone()
            .or_else(|| paths.output_dir.as_ref().map(PathBuf::from))
            .ok_or_else(|| {
                anyhow::anyhow!("no output directory (pass --output or set paths.output_dir)")
            })?;
        let mut fs = FsFiler::new(output_dir, store.clone() as Arc<dyn PageTextStore>);
        if let Some(archive_dir) = args
            .archive
            .clone()
            .or_else(|| paths.archive_dir.as_ref().map(PathBuf::from))
        {
            let locator = store.clone();
            fs = fs.with_archive(
                archive_dir,
                Arc::new(move |id: &ScanId| locator.source_path(id)),
            );
        }
        Arc::new(fs)
    };

    let pipeline = Pipeline::new(config, store.clone(), classifier, orderer, filer)?;

    // Progress
    let multi = MultiProgress::new();
    let spinner_style = ProgressStyle::with_template("{spinner:.green} {prefix:.bold} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    let progress_multi = multi.clone();
    let service = Arc::new(PipelineService::new(pipeline).with_progress(Arc::new(
        move |event: ProgressEvent| {
            if let Some(line) = output::format_event(&event, color) {
                let _ = progress_multi.println(line);
            }
        },
    )));

    // Ctrl+C cancels every scan that has not started filing
    let cancel_service = Arc::clone(&service);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_service.cancel_all();
        }
    });

    let slots = Arc::new(Semaphore::new(args.max_scans.max(1)));
    let mut tasks = Vec::with_capacity(scans.len());
    for scan_id in scans {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style.clone());
        bar.set_prefix(scan_id.to_string());
        bar.set_message("queued");
        bar.enable_steady_tick(Duration::from_millis(120));

        let service = Arc::clone(&service);
        let slots = Arc::clone(&slots);
        tasks.push(tokio::spawn(async move {
            let _permit = slots.acquire_owned().await.ok()?;
            let handle = service.submit(scan_id);
            let wait = service.wait(handle);
            tokio::pin!(wait);
            let mut tick = tokio::time::interval(Duration::from_millis(200));
            let status = loop {
                tokio::select! {
                    status = &mut wait => break status,
                    _ = tick.tick() => {
                        if let Some(status) = service.status(handle) {
                            bar.set_message(output::describe_progress(&status));
                        }
                    }
                }
            };
            match &status {
                Some(status) => bar.finish_with_message(output::describe_outcome(status, color)),
                None => bar.abandon_with_message("lost track of run"),
            }
            service.forget(handle);
            status
        }));
    }

    let mut statuses: Vec<PipelineStatus> = Vec::with_capacity(tasks.len());
    for task in tasks {
        if let Some(status) = task.await? {
            statuses.push(status);
        }
    }
    multi.clear().ok();

    let mut stdout = std::io::stdout();
    writeln!(stdout)?;
    for status in &statuses {
        output::print_scan_report(&mut stdout, status, color)?;
    }
    output::print_summary(&mut stdout, &statuses, color)?;

    let failed = statuses.iter().filter(|s| s.state.is_failure()).count();
    if failed > 0 {
        anyhow::bail!("{failed} scan(s) need attention");
    }
    Ok(())
}

fn print_prompt(scan: &Path, args: &ConfigArgs) -> anyhow::Result<()> {
    let file = load_config(args)?;
    let config = config_file::resolve_config(&file, args.grouping.clone())?;

    let scan_id = ScanId::new(
        scan.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("scan"),
    );
    let pages = check_pages(&scan_id, read_pages(scan)?)?;
    let text = prompt::build_grouping_prompt(&config.taxonomy, &config.grouping_policy, &pages)?;

    let mut stdout = std::io::stdout();
    writeln!(stdout, "{text}")?;
    writeln!(stdout)?;
    writeln!(stdout, "{}", prompt::page_context(&pages))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn grouping_flag_accepts_names_and_free_text() {
        assert_eq!(parse_policy("packet").unwrap(), GroupingPolicy::Packet);
        assert_eq!(
            parse_policy("one document per envelope").unwrap(),
            GroupingPolicy::Custom("one document per envelope".into())
        );
        assert!(parse_policy("  ").is_err());
    }

    #[test]
    fn run_requires_at_least_one_scan() {
        assert!(Cli::try_parse_from(["scansplit", "run"]).is_err());
        let cli = Cli::try_parse_from([
            "scansplit", "-vv", "run", "a.pdf", "b.json", "--grouping", "distinct-title",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.scans.len(), 2);
        assert_eq!(args.config.grouping, Some(GroupingPolicy::DistinctTitle));
        assert!(args.dry_run);
        assert_eq!(args.max_scans, 2);
    }

    #[test]
    fn ordering_backend_inherits_grouping_settings() {
        let cli = Cli::try_parse_from([
            "scansplit", "run", "a.pdf", "--order-backend", "heuristic",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let grouping = ModelConfig {
            backend: Some("openai".into()),
            api_key: Some("k".into()),
            model: Some("m".into()),
            requests_per_second: Some(5.0),
            ..Default::default()
        };
        let ordering = ordering_model(&args, &ConfigFile::default(), &grouping).unwrap();
        assert_eq!(ordering.backend.as_deref(), Some("heuristic"));
        assert_eq!(ordering.requests_per_second, Some(5.0));

        let cli = Cli::try_parse_from(["scansplit", "run", "a.pdf"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(ordering_model(&args, &ConfigFile::default(), &grouping).is_none());
    }
}
