use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use stemsplit::cache::ArtifactCache;
use stemsplit::cli::{CacheAction, Cli, Commands, ConfigAction, ServeArgs};
use stemsplit::config::Config;
use stemsplit::engine::catalog::{DEFAULT_PRESET, PRESETS};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => {
            let config = apply_serve_args(load_config(cli.config.as_deref())?, args);
            stemsplit::run_server(config).await?;
        }
        Commands::Models => {
            print_models();
        }
        Commands::Cache { action } => {
            let config = load_config(cli.config.as_deref())?;
            handle_cache_command(action, &config).await?;
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "stemsplit",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise -q/-v pick the level.
fn init_logging(quiet: bool, verbose: u8) {
    let default_level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "stemsplit={},tower_http={}",
            default_level, default_level
        ))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load configuration: explicit path, else the default path, then environment overrides.
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path())?,
    };
    Ok(config.with_env_overrides()?)
}

fn apply_serve_args(mut config: Config, args: ServeArgs) -> Config {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = args.cache_dir {
        config.cache.dir = Some(dir);
    }
    if let Some(workers) = args.workers {
        config.jobs.workers = workers;
    }
    config
}

fn print_models() {
    println!("Available stem presets:");
    for preset in PRESETS {
        let marker = if preset.name == DEFAULT_PRESET {
            " (default)"
        } else {
            ""
        };
        let labels: Vec<&str> = preset.labels.iter().map(|l| l.as_str()).collect();
        println!(
            "  {:<8} {}{} [{}]",
            preset.name,
            preset.description,
            marker,
            labels.join(", ")
        );
    }
}

async fn handle_cache_command(action: CacheAction, config: &Config) -> Result<()> {
    let root = config.cache.resolved_dir();
    let max_bytes = config.cache.max_bytes;

    match action {
        CacheAction::Stats => {
            let stats = tokio::task::spawn_blocking(move || {
                ArtifactCache::open(&root, max_bytes).map(|cache| cache.stats())
            })
            .await??;
            println!("Cache root: {}", stats.root.display());
            println!("Entries:    {}", stats.entries);
            println!(
                "Size:       {} / {} bytes",
                stats.total_bytes, stats.max_bytes
            );
        }
        CacheAction::Sweep => {
            let (_, report) =
                tokio::task::spawn_blocking(move || ArtifactCache::open_with_report(&root, max_bytes))
                    .await??;
            println!(
                "Removed {} staging dir(s) and {} corrupt entr(ies); evicted {}",
                report.removed_staging, report.removed_corrupt, report.evicted
            );
            println!(
                "{} entries, {} bytes remain",
                report.entries, report.total_bytes
            );
        }
    }
    Ok(())
}

fn handle_config_command(
    action: ConfigAction,
    custom_path: Option<&std::path::Path>,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => {
            let path = custom_path
                .map(std::path::PathBuf::from)
                .unwrap_or_else(Config::default_path);
            println!("{}", path.display());
        }
    }
    Ok(())
}
