use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use trailgrade::artifacts::ModelBundle;
use trailgrade::features::FEATURE_NAMES;
use trailgrade::predict::{NearestHike, PredictOptions, Predictor, format_hm};

#[derive(Parser)]
#[command(
    name = "trailgrade",
    version,
    about = "Hiking track difficulty, duration and similar hikes"
)]
struct Cli {
    /// Directory holding the trained artifacts
    #[arg(long, global = true)]
    artifact_dir: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the scaler, difficulty clusters, duration forest and neighbor index
    Train {
        /// Catalog CSV (defaults to config corpus_path)
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// Number of difficulty clusters (defaults to config)
        #[arg(short = 'k', long)]
        clusters: Option<usize>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Predict difficulty and duration for a GPX track
    Predict {
        /// GPX file to score
        file: PathBuf,

        /// Number of similar hikes to show
        #[arg(short = 'n', long)]
        neighbors: Option<usize>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List corpus hikes most similar to a corpus row
    Similar {
        /// Row number in the training corpus
        row: usize,

        /// Number of results
        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,
    },

    /// Summarize the trained artifacts
    Inspect,

    /// Serve predictions over HTTP
    Serve {
        /// Address to listen on (defaults to config)
        #[arg(long)]
        bind: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let mut config = trailgrade::config::AppConfig::load();

    let artifact_dir = config.resolve_artifact_dir(cli.artifact_dir);
    log::info!("Artifacts: {}", artifact_dir.display());

    match cli.command {
        Commands::Train {
            corpus,
            clusters,
            jobs,
        } => {
            let corpus = corpus.or(config.corpus_path.clone()).context(
                "No corpus to train on. Pass --corpus or set corpus_path in config.",
            )?;
            let clusters = clusters.unwrap_or(config.training.clusters);
            if jobs > 0 {
                config.workers = jobs;
            }
            let workers = config.resolve_workers();

            println!(
                "Training on {} ({} clusters, {} workers)...",
                corpus.display(),
                clusters,
                workers
            );
            let report = trailgrade::train::train(
                &corpus,
                clusters,
                &artifact_dir,
                &config.training,
                workers,
            )
            .context("Training failed")?;

            let c = &report.cleaning;
            println!();
            println!(
                "Corpus: {} rows read, {} malformed lines, {} kept after cleaning",
                report.rows_read, report.malformed, c.kept
            );
            if c.dropped() > 0 {
                println!(
                    "  dropped: {} missing fields, {} zero elapsed, {} zero length, \
                     {} zero duration, {} negative break, {} long break, {} too fast",
                    c.missing_fields,
                    c.zero_elapsed,
                    c.zero_length,
                    c.zero_duration,
                    c.negative_break,
                    c.long_break,
                    c.too_fast
                );
            }

            println!();
            println!("{:<12} {:>7} {:>14}", "Difficulty", "Hikes", "Mean duration");
            println!("{}", "-".repeat(35));
            for cluster in &report.clusters {
                println!(
                    "{:<12} {:>7} {:>14}",
                    cluster.label,
                    cluster.size,
                    format_hm(cluster.mean_duration)
                );
            }

            if let Some(m) = &report.holdout {
                println!();
                println!(
                    "Duration model hold-out ({} train / {} test): \
                     MAE {}, RMSE {}, R² {:.3}, MAPE {:.1}%",
                    m.n_train,
                    m.n_test,
                    format_hm(m.mae),
                    format_hm(m.rmse),
                    m.r2,
                    m.mape * 100.0
                );
            }

            println!();
            println!("Artifacts written to {}", report.artifact_dir.display());
        }

        Commands::Predict {
            file,
            neighbors,
            json,
        } => {
            let mut options = config.predict.clone();
            if let Some(n) = neighbors {
                options.neighbors = n;
            }
            let predictor = load_predictor(&artifact_dir, options)?;

            let reader = std::fs::File::open(&file)
                .with_context(|| format!("Cannot open {}", file.display()))?;
            let result = predictor
                .predict_gpx(std::io::BufReader::new(reader))
                .with_context(|| format!("Cannot score {}", file.display()))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }

            println!("Track: {}", file.display());
            println!();
            println!("  Length:          {:.2} km", result.length_3d_m / 1000.0);
            println!("  Climb / descent: {:.0} m / {:.0} m", result.uphill_m, result.downhill_m);
            println!(
                "  Elevation:       {:.0} m to {:.0} m",
                result.min_elevation_m, result.max_elevation_m
            );
            println!("  Observed time:   {}", result.observed_duration_hm);
            println!("  Breaks:          {}", format_hm(result.break_time_sec));
            println!();
            println!("  Difficulty:      {}", result.predicted_difficulty);
            println!(
                "  Est. duration:   {}{}",
                result.predicted_duration_hm,
                if result.duration_fallback { " (observed, model output unusable)" } else { "" }
            );
            if result.low_confidence {
                println!("  Note: track has no timestamps; moving time unknown");
            }

            if !result.nearest_hikes.is_empty() {
                println!();
                println!("Similar hikes:");
                println!();
                print_hike_table(&result.nearest_hikes);
            }
        }

        Commands::Similar { row, limit } => {
            let predictor = load_predictor(&artifact_dir, config.predict.clone())?;
            let table = &predictor.bundle().table;

            let Some(hikes) = predictor.similar(row, limit) else {
                anyhow::bail!("Row {} is out of range (corpus has {} rows)", row, table.len());
            };

            let name = table
                .get(row)
                .and_then(|r| r.name.as_deref())
                .unwrap_or("(unnamed)");
            println!("Hikes similar to #{} \"{}\":", row, name);
            println!();
            print_hike_table(&hikes);
        }

        Commands::Inspect => {
            let bundle = ModelBundle::load(&artifact_dir).context("Failed to load artifacts")?;

            println!("Artifacts: {}", artifact_dir.display());
            println!("Features:  {}", FEATURE_NAMES.join(", "));
            println!("Corpus:    {} hikes", bundle.table.len());
            println!("Scaler:    {:?}", bundle.scaler.kind);
            println!();

            let d = &bundle.difficulty;
            let columns: Vec<&str> = d.columns.iter().map(|&c| FEATURE_NAMES[c]).collect();
            println!("Difficulty clusters (k = {}, inertia {:.4})", d.k(), d.inertia);
            println!("  on: {}", columns.join(", "));
            println!();
            println!("{:<12} {:>7} {:>14}", "Difficulty", "Hikes", "Mean duration");
            println!("{}", "-".repeat(35));
            for c in d.clusters_by_severity() {
                println!(
                    "{:<12} {:>7} {:>14}",
                    d.label_for_cluster(c).unwrap_or("?"),
                    d.sizes[c],
                    format_hm(d.cluster_mean_durations()[c])
                );
            }

            let f = &bundle.duration;
            let inputs: Vec<&str> = f.columns.iter().map(|&c| FEATURE_NAMES[c]).collect();
            println!();
            println!(
                "Duration forest: {} trees, max depth {}, min split {}, min leaf {}",
                f.tree_count(),
                f.params.max_depth,
                f.params.min_samples_split,
                f.params.min_samples_leaf
            );
            println!("  on: {}", inputs.join(", "));
        }

        Commands::Serve { bind } => {
            if let Some(addr) = bind {
                config.server.bind = addr;
            }
            let predictor = Arc::new(load_predictor(&artifact_dir, config.predict.clone())?);

            println!("Serving on http://{}", config.server.bind);
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime
                .block_on(trailgrade::server::serve(predictor, &config.server))
                .context("Server stopped")?;
        }
    }

    Ok(())
}

fn load_predictor(artifact_dir: &std::path::Path, options: PredictOptions) -> Result<Predictor> {
    Predictor::load(artifact_dir, options).context("Failed to load artifacts")
}

/// Print neighbor hikes as a table, nearest first.
fn print_hike_table(hikes: &[NearestHike]) {
    println!(
        "{:>5} {:<28} {:>5} {:>8} {:>7} {:>7} {:>8} {:>7}",
        "Row", "Name", "Grade", "Km", "Up", "Down", "Time", "Dist"
    );
    println!("{}", "-".repeat(82));

    for h in hikes {
        let name = h.name.as_deref().unwrap_or("");
        // Truncate long names
        let name: String = if name.chars().count() > 28 {
            format!("{}...", name.chars().take(25).collect::<String>())
        } else {
            name.to_string()
        };

        println!(
            "{:>5} {:<28} {:>5} {:>8.2} {:>7.0} {:>7.0} {:>8} {:>7.3}",
            h.row,
            name,
            h.difficulty.as_deref().unwrap_or("-"),
            h.length_3d_m / 1000.0,
            h.uphill_m,
            h.downhill_m,
            h.duration_hm,
            h.distance
        );
    }
}
