use anyhow::{bail, Context, Result};
use cdse_fetch::baseline::select_latest_baseline;
use cdse_fetch::collections::{find_collection, known_collections};
use cdse_fetch::geometry::geojson_str_to_wkt;
use cdse_fetch::{
    download_features, validate_credentials, Catalogue, Credentials, DownloadOptions, Feature,
    LoggingMonitor, SearchTerms, Settings,
};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Search the Copernicus Data Space catalogue and download products
#[derive(Parser, Debug)]
#[command(name = "cdse-fetch", version, long_about = None)]
struct Cli {
    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Account username; the login file is used when absent
    #[arg(long, env = "CDSE_USERNAME", global = true)]
    username: Option<String>,

    #[arg(long, env = "CDSE_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search the catalogue
    Query {
        #[command(subcommand)]
        command: QueryCommands,
    },

    /// Download every feature matching the search terms
    Download {
        #[command(flatten)]
        search: SearchArgs,

        /// Existing directory to download into
        path: PathBuf,

        /// Number of parallel downloads
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        concurrency: u16,

        /// Download again even if the product is already present
        #[arg(long)]
        overwrite_existing: bool,

        /// Unpack archives and remove them afterwards
        #[arg(long)]
        extract: bool,

        /// Keep only the latest processing baseline of each acquisition (Sentinel2 only)
        #[arg(long)]
        last_baseline: bool,

        /// Download only the product files whose path matches this glob
        #[arg(long)]
        filter_pattern: Option<String>,
    },

    /// Check that the credentials are accepted
    ValidateCredentials,
}

#[derive(Subcommand, Debug)]
enum QueryCommands {
    /// Print the features matching the search terms
    Search {
        #[command(flatten)]
        search: SearchArgs,

        /// Print each feature as JSON instead of its title
        #[arg(long)]
        json: bool,

        /// Stop after this many features
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List the search terms a collection accepts
    SearchTerms { collection: String },

    /// List the known collections
    Collections,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Collection name, e.g. Sentinel2
    collection: String,

    /// Search term as key=value; repeat for several terms
    #[arg(short = 't', long = "search-term", value_name = "KEY=VALUE")]
    search_terms: Vec<String>,

    /// GeoJSON file whose polygon is used as the search geometry
    #[arg(long)]
    geometry: Option<PathBuf>,

    /// Check the terms against the collection description before searching
    #[arg(long)]
    validate: bool,
}

impl SearchArgs {
    fn terms(&self, catalogue: &Catalogue) -> Result<SearchTerms> {
        if find_collection(&self.collection)?.is_none() {
            warn!("{} is not a known collection, asking the server anyway", self.collection);
        }

        let mut terms = SearchTerms::from_pairs(&self.search_terms)?;
        if let Some(path) = &self.geometry {
            let geojson = fs::read_to_string(path)
                .with_context(|| format!("Unable to read {}", path.display()))?;
            terms.insert("geometry", geojson_str_to_wkt(&geojson)?);
        }
        if self.validate {
            let description = catalogue.describe_collection(&self.collection)?;
            terms.validate(&description)?;
        }
        Ok(terms)
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("cdse_fetch={}", level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = match &cli.config {
        Some(path) => Settings::read(path)?,
        None => Settings::default(),
    };

    match &cli.command {
        Commands::Query { command } => query(command, &settings),
        Commands::Download {
            search,
            path,
            concurrency,
            overwrite_existing,
            extract,
            last_baseline,
            filter_pattern,
        } => {
            if !path.is_dir() {
                bail!("Path {} does not exist", path.display());
            }
            let credentials =
                Credentials::resolve(cli.username.as_deref(), cli.password.as_deref(), &settings)?;
            let monitor = Arc::new(LoggingMonitor::new());
            let options = DownloadOptions {
                credentials: Some(Arc::new(credentials)),
                concurrency: usize::from(*concurrency),
                monitor: monitor.clone(),
                extract: *extract,
                overwrite_existing: *overwrite_existing,
                filter_pattern: filter_pattern.clone(),
                settings: settings.clone(),
                ..DownloadOptions::default()
            };

            let catalogue = Catalogue::new(&settings)?;
            let terms = search.terms(&catalogue)?;
            let mut query = catalogue.query_features(&search.collection, &terms)?;

            let mut failed = 0;
            let mut query_error = None;
            {
                let features: Box<dyn Iterator<Item = Feature> + '_> =
                    if *last_baseline && search.collection == "Sentinel2" {
                        let all = query.by_ref().collect::<cdse_fetch::Result<Vec<_>>>()?;
                        let latest = select_latest_baseline(all);
                        info!("{} features left after baseline selection", latest.len());
                        Box::new(latest.into_iter())
                    } else {
                        Box::new(query.by_ref().map_while(|feature| match feature {
                            Ok(feature) => Some(feature),
                            Err(e) => {
                                query_error = Some(e);
                                None
                            }
                        }))
                    };

                for result in download_features(features, path, options)? {
                    if result.is_success() {
                        println!("{}", result.feature_id);
                    } else {
                        failed += 1;
                        error!("{}", result);
                    }
                }
            }

            info!("{}", monitor.summary());
            if let Some(e) = query_error {
                error!("Search stopped early: {}", e);
                return Ok(ExitCode::FAILURE);
            }
            if failed > 0 {
                error!("{} downloads failed", failed);
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::ValidateCredentials => {
            let valid =
                validate_credentials(cli.username.as_deref(), cli.password.as_deref(), &settings)?;
            if valid {
                println!("Credentials are valid");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Credentials are not valid");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn query(command: &QueryCommands, settings: &Settings) -> Result<ExitCode> {
    match command {
        QueryCommands::Search {
            search,
            json,
            limit,
        } => {
            let catalogue = Catalogue::new(settings)?;
            let terms = search.terms(&catalogue)?;
            let query = catalogue.query_features(&search.collection, &terms)?;
            for feature in query.take(limit.unwrap_or(usize::MAX)) {
                let feature = feature?;
                if *json {
                    println!("{}", feature.to_json()?);
                } else {
                    println!("{}", feature.title());
                }
            }
        }
        QueryCommands::SearchTerms { collection } => {
            let catalogue = Catalogue::new(settings)?;
            println!("Available search terms for collection {}:", collection);
            for (key, info) in catalogue.describe_collection(collection)? {
                println!("  - {}", key);
                if let Some(title) = &info.title {
                    println!("    - Description: {}", title);
                }
                if let Some(pattern) = &info.pattern {
                    println!("    - Pattern: {}", pattern);
                }
                if let Some(min) = &info.min_inclusive {
                    println!("    - Min: {}", min);
                }
                if let Some(max) = &info.max_inclusive {
                    println!("    - Max: {}", max);
                }
                println!();
            }
        }
        QueryCommands::Collections => {
            for collection in known_collections()? {
                println!(
                    "{:<16} {:<16} {}",
                    collection.name, collection.mission, collection.description
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
