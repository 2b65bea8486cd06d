//! filedbctl - maintenance CLI for a filedb store
//!
//! Subcommands:
//! - `filedbctl add <path>` - Store a file (or `-` for stdin), print its id
//! - `filedbctl get <id>` - Write an object to stdout or `--output`
//! - `filedbctl meta <id> <field>` - Print one metadata field
//! - `filedbctl check [<id>...]` - Verify blobs against their digests
//! - `filedbctl clean --census <json>` - Reconcile counts against a census

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use filedb::{DedupEngine, MetaField, ObjectId, StoreConfig};

mod commands;

use commands::{CleanOptions, Target};

#[derive(Parser)]
#[command(name = "filedbctl")]
#[command(about = "Manage a deduplicating filedb store")]
#[command(version)]
struct Cli {
    /// TOML config file with a [filedb] section
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store base path (overrides config and FILEDB_PATH)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Open the store read-only
    #[arg(long, global = true)]
    read_only: bool,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file and print its object id
    Add {
        /// File to store, or "-" for stdin
        file: PathBuf,

        /// Media type to record instead of sniffing one
        #[arg(short, long)]
        media_type: Option<String>,
    },

    /// Write an object's bytes
    Get {
        /// Object id or digest
        target: Target,

        /// Skip digest verification
        #[arg(long)]
        nocheck: bool,

        /// Byte range, e.g. "bytes=50-59"
        #[arg(short, long)]
        range: Option<String>,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print a single metadata field
    Meta {
        /// Object id or digest
        target: Target,

        /// digest, size, reference_count, media_type, access_count, last_access or created
        field: MetaField,
    },

    /// Add a reference to an object
    Retain { id: ObjectId },

    /// Drop a reference; the object is deleted with its last one
    Release {
        id: ObjectId,

        /// Delete regardless of the reference count
        #[arg(short, long)]
        force: bool,
    },

    /// Delete objects outright
    Purge {
        /// Object ids or digests
        #[arg(required = true)]
        targets: Vec<Target>,
    },

    /// Remove an object's record but keep its blob
    Untrack {
        /// Object id or digest
        target: Target,
    },

    /// Delete all objects with no references left
    Sweep,

    /// Verify objects (all of them if none are given)
    Check { ids: Vec<ObjectId> },

    /// List all objects
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the biggest objects
    Top {
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Reconcile reference counts against an external census
    Clean {
        /// JSON file mapping object ids to their real reference counts
        #[arg(long)]
        census: PathBuf,

        /// Do not prompt; delete every unreferenced object
        #[arg(long)]
        non_interactive: bool,

        /// Actually apply changes instead of simulating
        #[arg(long)]
        this_is_not_a_drill: bool,
    },
}

fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::from_env()?,
    };
    if let Some(path) = &cli.path {
        config.base_path = path.clone();
    }
    if cli.read_only {
        config.read_only = true;
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let engine = DedupEngine::open(&config)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Add { file, media_type } => {
            commands::add(&engine, &file, media_type.as_deref(), &mut out)?;
        }
        Commands::Get {
            target,
            nocheck,
            range,
            output,
        } => {
            commands::get(
                &engine,
                &target,
                nocheck,
                range.as_deref(),
                output.as_deref(),
                &mut out,
            )?;
        }
        Commands::Meta { target, field } => {
            commands::meta(&engine, &target, field, &mut out)?;
        }
        Commands::Retain { id } => {
            commands::retain(&engine, id, &mut out)?;
        }
        Commands::Release { id, force } => {
            commands::release(&engine, id, force, &mut out)?;
        }
        Commands::Purge { targets } => {
            commands::purge(&engine, &targets, &mut out)?;
        }
        Commands::Untrack { target } => {
            commands::untrack(&engine, &target, &mut out)?;
        }
        Commands::Sweep => {
            commands::sweep(&engine, &mut out)?;
        }
        Commands::Check { ids } => {
            commands::check(&engine, &ids, &mut out)?;
        }
        Commands::List { json } => {
            commands::list(&engine, json, &mut out)?;
        }
        Commands::Top { limit } => {
            commands::top(&engine, limit, &mut out)?;
        }
        Commands::Clean {
            census,
            non_interactive,
            this_is_not_a_drill,
        } => {
            let options = CleanOptions {
                simulate: !this_is_not_a_drill,
                interactive: !non_interactive,
            };
            commands::clean(&engine, &census, options, &mut out)?;
        }
    }

    out.flush()?;
    Ok(())
}

/// Find the store error behind a failure, including one carried by an I/O error.
fn store_error(err: &anyhow::Error) -> Option<&filedb::Error> {
    err.chain().find_map(|cause| {
        cause.downcast_ref::<filedb::Error>().or_else(|| {
            cause
                .downcast_ref::<io::Error>()
                .and_then(|e| e.get_ref())
                .and_then(|inner| inner.downcast_ref::<filedb::Error>())
        })
    })
}

/// 2 for unknown objects, 3 for corrupted or missing data, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    match store_error(err) {
        Some(e) if e.is_not_found() => 2,
        Some(e) if e.is_consistency() => 3,
        _ => 1,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
