use anyhow::{anyhow, Error, Result};
use clap::{Parser, Subcommand};
use graphmirror::config::PipelineConfig;
use graphmirror::datastore::Datastore;
use graphmirror::filestore::{hash_iri, ContentStore};
use graphmirror::orchestrator::{Pipeline, RunSummary, Status};
use graphmirror::progress::{init_logging, pretty_duration, LogSink};
use log::info;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "graphmirror")]
#[command(about = "Mirror SPARQL resources into local files and publish them")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to the pipeline configuration file
    #[clap(long, short, default_value = "graphmirror.json", global = true)]
    config: PathBuf,
    /// Verbose mode - sets the RUST_LOG level to info, defaults to warning level
    #[clap(long, short, action, default_value = "false", global = true)]
    verbose: bool,
    /// Debug mode - sets the RUST_LOG level to debug, defaults to warning level
    #[clap(long, action, default_value = "false", global = true)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum MigrateCommands {
    /// Apply all pending migrations
    Up,
    /// Roll migrations back until the schema is at the given version
    Down {
        /// Target schema version; 0 removes every table
        #[clap(long)]
        to: u32,
    },
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once: check queues, discover, process, sweep and publish
    Run,
    /// Collect IRIs for one topic into the queue
    Discover {
        /// Name of the topic
        topic: String,
    },
    /// Process one batch of queued IRIs for a topic
    Process {
        /// Name of the topic
        topic: String,
    },
    /// Publish the mirror; fails while any queue still has items
    Publish,
    /// Prints queue, registry and last run of every topic
    Status {
        /// Print the status as JSON
        #[clap(long, action, default_value = "false")]
        json: bool,
    },
    /// Prints the loaded configuration
    Config,
    /// Manage the database schema
    #[command(subcommand)]
    Migrate(MigrateCommands),
    /// Prints the content hash of an IRI and the file it is stored in
    Hash {
        /// The IRI to hash
        iri: String,
        /// Resource directory used to build the file path
        #[clap(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Prints the version of the graphmirror binary
    Version,
}

pub fn run() -> Result<()> {
    init_logging();
    let cmd = Cli::parse();
    execute(cmd)
}

pub fn run_from_args<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    init_logging();
    let cmd = Cli::try_parse_from(args).map_err(Error::from)?;
    execute(cmd)
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "Configuration file {} not found. Pass --config to point at one.",
            path.display()
        ));
    }
    PipelineConfig::from_file(path)
}

fn pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    Pipeline::from_config(config, Arc::new(LogSink::new()))
}

fn execute(cmd: Cli) -> Result<()> {
    // The RUST_LOG env var is set by `init_logging` if GRAPHMIRROR_LOG is present.
    // CLI flags for verbosity take precedence. If nothing is set, we default to "warn".
    if cmd.debug {
        std::env::set_var("RUST_LOG", "debug");
    } else if cmd.verbose {
        std::env::set_var("RUST_LOG", "info");
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    let _ = env_logger::try_init();

    match cmd.command {
        Commands::Version => {
            println!(
                "graphmirror {} @ {}",
                env!("CARGO_PKG_VERSION"),
                env!("CARGO_PKG_REPOSITORY")
            );
        }
        Commands::Hash { iri, dir } => {
            let store = ContentStore::new(dir);
            println!("{}", hash_iri(&iri));
            println!("{}", store.path_for(&iri).display());
        }
        Commands::Config => {
            let config = load_config(&cmd.config)?;
            config.print();
        }
        Commands::Migrate(migrate) => {
            let config = load_config(&cmd.config)?;
            let store = Datastore::connect(&config.store.database)?;
            let applied = match migrate {
                MigrateCommands::Up => store.migrate_to_latest()?,
                MigrateCommands::Down { to } => store.migrate_down_to(to)?,
            };
            if applied.is_empty() {
                println!("Schema is up to date (version {})", store.schema_version()?);
            } else {
                for version in applied {
                    println!("Migrated version {version}");
                }
                println!("Schema is at version {}", store.schema_version()?);
            }
        }
        Commands::Run => {
            let config = load_config(&cmd.config)?;
            let summary = pipeline(&config)?.run()?;
            print_summary(&summary);
        }
        Commands::Discover { topic } => {
            let config = load_config(&cmd.config)?;
            let report = pipeline(&config)?.discover(&topic)?;
            println!(
                "Discovered {} IRIs in {} pages ({} failed pages, {} push failures)",
                report.collected, report.pages, report.failed_pages, report.push_failures
            );
        }
        Commands::Process { topic } => {
            let config = load_config(&cmd.config)?;
            let report = pipeline(&config)?.process(&topic)?;
            println!(
                "Processed {} IRIs: {} stored, {} retried, {} dropped",
                report.total, report.stored, report.retried, report.dropped
            );
            for failure in &report.failures {
                let verb = if failure.dropped { "dropped" } else { "retry" };
                eprintln!("{} ({verb}): {}", failure.iri, failure.message);
            }
        }
        Commands::Publish => {
            let config = load_config(&cmd.config)?;
            pipeline(&config)?.publish()?;
            println!("Published");
        }
        Commands::Status { json } => {
            let config = load_config(&cmd.config)?;
            let status = pipeline(&config)?.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    info!("Visited states: {:?}", summary.states);
    println!(
        "Discovered {}, stored {}, retried {}, dropped {}",
        summary.discovered, summary.stored, summary.retried, summary.dropped
    );
    if summary.obsolete_removed > 0 || summary.files_swept > 0 {
        println!(
            "Removed {} obsolete resources and {} stale files",
            summary.obsolete_removed, summary.files_swept
        );
    }
    if summary.published {
        println!("Published the mirror");
    } else if summary.publish_rejected {
        println!("Publish target was busy; the mirror was not published");
    }
    println!("Done in {}", pretty_duration(summary.duration));
}

fn print_status(status: &Status) {
    println!("Schema version: {}", status.schema_version);
    match &status.last_run {
        Some(run) => println!(
            "Last run: started {} (identifier: {})",
            run.started_at,
            run.identifier.as_deref().unwrap_or("-")
        ),
        None => println!("Last run: never"),
    }
    println!("Topics:");
    for topic in &status.topics {
        println!(
            "  {}: {} queued, {} registered, {} files",
            topic.name, topic.queued, topic.registered, topic.stored_files
        );
    }
}
