use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use shelfwise_core::config_file;
use shelfwise_core::orchestrator::classify;
use shelfwise_core::{
    ANY_GENRE, ClearScope, Config, FetchOrchestrator, QueryFilters, Sampler, available_genres,
    now_epoch, query,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod output;

use output::{ColorMode, GenreRow};

/// Shelfwise - browse and sample Open Library book lists, cached locally
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Log debug output to stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the JSON cache file
    #[arg(long, global = true)]
    cache_path: Option<PathBuf>,

    /// Seconds before a cached genre is refetched
    #[arg(long, global = true)]
    ttl_secs: Option<u64>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Base URL of the Open Library API
    #[arg(long, global = true)]
    api_base: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List books for a genre, filtered and ordered by ranking
    Browse(BrowseArgs),

    /// Pick one random book
    Recommend {
        /// Genre to pick from ("Any" for trending books)
        #[arg(short, long, default_value = ANY_GENRE)]
        genre: String,
    },

    /// Refetch genres now, ignoring cache freshness
    Refresh {
        /// Genres to refresh (defaults to the configured genre list)
        genres: Vec<String>,
    },

    /// Show cached genres and their freshness
    Genres,

    /// Remove cached books
    ClearCache {
        /// Only clear this genre
        #[arg(short, long)]
        genre: Option<String>,
    },

    /// Write the effective settings to the platform config file
    InitConfig,
}

#[derive(Args, Debug)]
struct BrowseArgs {
    /// Genre to browse ("Any" for trending books)
    #[arg(short, long, default_value = ANY_GENRE)]
    genre: String,

    /// Earliest publication year (inclusive)
    #[arg(long)]
    year_min: Option<i32>,

    /// Latest publication year (inclusive)
    #[arg(long)]
    year_max: Option<i32>,

    /// Minimum popularity (1-5)
    #[arg(long)]
    min_popularity: Option<u8>,

    /// Maximum ranking position
    #[arg(long)]
    max_ranking: Option<u32>,

    /// Minimum heat index
    #[arg(long)]
    min_heat: Option<f64>,

    /// Number of books to show
    #[arg(short = 'n', long)]
    limit: Option<usize>,
}

impl BrowseArgs {
    fn filters(&self) -> QueryFilters {
        QueryFilters {
            genre: Some(self.genre.clone()),
            year_min: self.year_min,
            year_max: self.year_max,
            min_popularity: self.min_popularity,
            max_ranking: self.max_ranking,
            min_heat: self.min_heat,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = resolve_config(&cli);
    let color = ColorMode(!cli.no_color);
    tracing::debug!(?config, "resolved configuration");

    let orchestrator = FetchOrchestrator::from_config(&config);

    match cli.command {
        Command::Browse(args) => browse(&orchestrator, &config, &args, color).await,
        Command::Recommend { genre } => recommend(&orchestrator, &genre, color).await,
        Command::Refresh { genres } => refresh(&orchestrator, &config, genres, color).await,
        Command::Genres => list_genres(&orchestrator, color),
        Command::ClearCache { genre } => clear_cache(&orchestrator, genre.as_deref()),
        Command::InitConfig => init_config(&config),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "warn,shelfwise=debug,shelfwise_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

/// Resolve configuration: CLI flags > env vars > config files > defaults
fn resolve_config(cli: &Cli) -> Config {
    let mut config = Config::default();
    config_file::load_config().apply_to(&mut config);
    config_file::apply_env(&mut config, |name| std::env::var(name).ok());

    if let Some(path) = &cli.cache_path {
        config.cache_path = Some(path.clone());
    }
    if let Some(ttl) = cli.ttl_secs {
        config.cache_ttl_secs = ttl;
    }
    if let Some(t) = cli.timeout_secs.filter(|&t| t > 0) {
        config.fetch_timeout_secs = t;
    }
    if let Some(base) = &cli.api_base {
        config.api_base = base.trim_end_matches('/').to_string();
    }
    config
}

async fn browse(
    orchestrator: &FetchOrchestrator,
    config: &Config,
    args: &BrowseArgs,
    color: ColorMode,
) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    let limit = args.limit.unwrap_or(config.default_limit);
    let filters = args.filters();

    // Reject bad filters before touching the network.
    if let Err(e) = query(&[], &filters, limit) {
        output::print_core_error(&mut std::io::stderr(), &e, color)?;
        return Ok(());
    }

    let resolved = match orchestrator.resolve(&args.genre).await {
        Ok(r) => r,
        Err(e) => {
            output::print_core_error(&mut std::io::stderr(), &e, color)?;
            return Ok(());
        }
    };
    output::print_origin_notice(&mut std::io::stderr(), &resolved, now_epoch(), color)?;

    let books = query(&resolved.records, &filters, limit)?;
    output::print_books(&mut out, &resolved.genre_key, &books, color)?;
    Ok(())
}

async fn recommend(
    orchestrator: &FetchOrchestrator,
    genre: &str,
    color: ColorMode,
) -> anyhow::Result<()> {
    let resolved = match orchestrator.resolve(genre).await {
        Ok(r) => r,
        Err(e) => {
            output::print_core_error(&mut std::io::stderr(), &e, color)?;
            return Ok(());
        }
    };
    output::print_origin_notice(&mut std::io::stderr(), &resolved, now_epoch(), color)?;

    match Sampler::new().sample_in_genre(&resolved.records, genre) {
        Ok(book) => output::print_recommendation(&mut std::io::stdout().lock(), &book, color)?,
        Err(e) => output::print_core_error(&mut std::io::stderr(), &e, color)?,
    }
    Ok(())
}

async fn refresh(
    orchestrator: &FetchOrchestrator,
    config: &Config,
    genres: Vec<String>,
    color: ColorMode,
) -> anyhow::Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};

    let genres = if genres.is_empty() {
        config.default_genres.clone()
    } else {
        genres
    };

    let bar = ProgressBar::new(genres.len() as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.green} {msg} [{bar:30.green/dim}] {pos}/{len}")
    {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    bar.set_message(format!("Fetching from {}", orchestrator.source_name()));

    let outcomes = orchestrator
        .prefetch(&genres, |outcome| {
            bar.set_message(outcome.genre_key.clone());
            bar.inc(1);
        })
        .await;
    bar.finish_and_clear();

    output::print_prefetch_summary(&mut std::io::stdout().lock(), &outcomes, color)?;
    Ok(())
}

fn list_genres(orchestrator: &FetchOrchestrator, color: ColorMode) -> anyhow::Result<()> {
    let store = orchestrator.store();
    let now = now_epoch();
    let rows: Vec<GenreRow> = store
        .genres()
        .into_iter()
        .filter_map(|genre| store.get(&genre))
        .map(|entry| GenreRow {
            freshness: classify(Some(&entry), now),
            age: entry.age(now),
            count: entry.records.len(),
            contains: available_genres(&entry.records),
            genre: entry.genre_key,
        })
        .collect();

    let mut out = std::io::stdout().lock();
    output::print_genre_table(&mut out, &rows, color)?;
    if let Some(path) = store.path() {
        writeln_dimmed(&mut out, &format!("Cache file: {}", path.display()), color)?;
    }
    Ok(())
}

fn clear_cache(orchestrator: &FetchOrchestrator, genre: Option<&str>) -> anyhow::Result<()> {
    let scope = match genre {
        Some(g) => ClearScope::Genre(g),
        None => ClearScope::All,
    };
    let removed = orchestrator.store().clear(scope)?;
    match genre {
        Some(g) => println!("Removed {} cached genre(s) matching '{}'", removed, g),
        None => println!("Removed {} cached genre(s)", removed),
    }
    Ok(())
}

fn init_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file::save_config(&config_file::ConfigFile::from_config(config))
        .map_err(anyhow::Error::msg)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn writeln_dimmed(w: &mut dyn Write, line: &str, color: ColorMode) -> std::io::Result<()> {
    if color.enabled() {
        use owo_colors::OwoColorize;
        writeln!(w, "{}", line.dimmed())
    } else {
        writeln!(w, "{}", line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_browse_filters() {
        let cli = Cli::try_parse_from([
            "shelfwise",
            "--no-color",
            "browse",
            "--genre",
            "Fantasy",
            "--year-min",
            "1950",
            "--min-popularity",
            "4",
            "-n",
            "3",
        ])
        .unwrap();
        assert!(cli.no_color);
        let Command::Browse(args) = cli.command else {
            panic!("expected browse");
        };
        let filters = args.filters();
        assert_eq!(filters.genre.as_deref(), Some("Fantasy"));
        assert_eq!(filters.year_min, Some(1950));
        assert_eq!(filters.min_popularity, Some(4));
        assert_eq!(args.limit, Some(3));
    }

    #[test]
    fn recommend_defaults_to_any() {
        let cli = Cli::try_parse_from(["shelfwise", "recommend"]).unwrap();
        assert!(matches!(cli.command, Command::Recommend { genre } if genre == ANY_GENRE));
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "shelfwise",
            "--cache-path",
            "/tmp/shelfwise-test.json",
            "--ttl-secs",
            "5",
            "--api-base",
            "http://localhost:9000/",
            "genres",
        ])
        .unwrap();
        let config = resolve_config(&cli);
        assert_eq!(
            config.cache_path,
            Some(PathBuf::from("/tmp/shelfwise-test.json"))
        );
        assert_eq!(config.cache_ttl_secs, 5);
        assert_eq!(config.api_base, "http://localhost:9000");
    }
}
