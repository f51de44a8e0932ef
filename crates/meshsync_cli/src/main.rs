//! meshsync CLI
//!
//! Command-line front-end for a meshsync replication node.
//!
//! # Commands
//!
//! - `init` - Initialise a database as a sync node
//! - `enable` - Opt a table in to replication
//! - `status` - Show device, clock and log state
//! - `sync` - Exchange bundle files with a peer
//! - `conflicts` - List conflicts awaiting resolution
//! - `resolve` - Resolve a conflict with a chosen strategy
//! - `migrate` - Add a column (replicates to peers)
//! - `peers` - List known peers
//! - `snapshot` - Export a full bundle

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use meshsync_engine::EngineError;
use tracing_subscriber::EnvFilter;

/// meshsync replication node tools.
#[derive(Parser)]
#[command(name = "meshsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database file
    #[arg(global = true, short, long, default_value = "meshsync.db")]
    db: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialise the database as a sync node
    Init {
        /// Display name for this device
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Opt a table in to replication
    Enable {
        /// Table name
        table: String,
    },

    /// Show device, clock and log state
    Status,

    /// Exchange bundle files with a peer
    Sync {
        /// Peer device id (UUID)
        #[arg(short, long)]
        peer: String,

        /// Bundle file to import first
        #[arg(long)]
        pull: Option<PathBuf>,

        /// Bundle file to export for the peer
        #[arg(long)]
        push: Option<PathBuf>,
    },

    /// List conflicts awaiting resolution
    Conflicts,

    /// Resolve a conflict with a chosen strategy
    Resolve {
        /// Conflict id (UUID)
        conflict: String,

        /// Strategy: lww, merge or manual
        #[arg(short, long, default_value = "lww")]
        strategy: String,

        /// For merge: prefer local values on exact ties
        #[arg(long)]
        prefer_local: bool,
    },

    /// Add a column to an opted-in table (replicates to peers)
    Migrate {
        /// Table name
        table: String,

        /// New column name
        column: String,

        /// Column type: INTEGER, REAL, TEXT or BLOB
        column_type: String,

        /// Default value (parsed as integer, real, then text)
        #[arg(short = 'D', long)]
        default: Option<String>,
    },

    /// List known peers
    Peers,

    /// Export everything to a bundle file
    Snapshot {
        /// Output path
        out: PathBuf,

        /// Address the bundle to a specific peer
        #[arg(short, long)]
        peer: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Init { name } => commands::init::run(&cli.db, name.as_deref()),
        Commands::Enable { table } => commands::enable::run(&cli.db, &table),
        Commands::Status => commands::status::run(&cli.db),
        Commands::Sync { peer, pull, push } => {
            commands::sync::run(&cli.db, &peer, pull.as_deref(), push.as_deref())
        }
        Commands::Conflicts => commands::conflicts::run(&cli.db),
        Commands::Resolve {
            conflict,
            strategy,
            prefer_local,
        } => commands::resolve::run(&cli.db, &conflict, &strategy, prefer_local),
        Commands::Migrate {
            table,
            column,
            column_type,
            default,
        } => commands::migrate::run(&cli.db, &table, &column, &column_type, default.as_deref()),
        Commands::Peers => commands::peers::run(&cli.db),
        Commands::Snapshot { out, peer } => {
            commands::snapshot::run(&cli.db, &out, peer.as_deref())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Exit codes: 2 usage (clap), 3 schema-incompatible, 4 transport,
/// 5 unresolved conflicts block the operation, 1 anything else.
fn exit_code(error: &EngineError) -> u8 {
    match error {
        EngineError::Schema(_) => 3,
        EngineError::Transport { .. } => 4,
        EngineError::ConflictPending { .. } => 5,
        _ => 1,
    }
}
