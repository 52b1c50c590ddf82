mod commands;
mod config;
mod database_manager;
mod telemetry;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use idhini_db::{ErrorKind, RecordKey, RecordState, ServiceError, StorageError, SubjectKind};

use config::Config;
use database_manager::DatabaseManager;

#[derive(Parser)]
#[command(name = "idhini")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// custom database path (default: ~/.idhini/default.idhini)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// create ~/.idhini and an empty database
    Init,

    #[command(subcommand)]
    User(UserCommands),

    /// product requests
    #[command(subcommand)]
    Request(RecordCommands),

    /// dispatches
    #[command(subcommand)]
    Dispatch(RecordCommands),

    #[command(subcommand)]
    Audit(AuditCommands),

    /// fold the WAL into the snapshot
    Compact,
}

#[derive(Subcommand)]
enum UserCommands {
    Add {
        user_id: String,

        #[arg(short, long = "role")]
        roles: Vec<String>,
    },

    Deactivate {
        user_id: String,
    },

    List,
}

#[derive(Subcommand)]
enum RecordCommands {
    Create {
        /// maker
        #[arg(long = "as")]
        maker: String,

        /// SKU:QTY[:NOTE], repeatable
        #[arg(short, long = "item")]
        items: Vec<String>,

        /// JSON or YAML list of line items
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// dispatch only
        #[arg(long)]
        source_request: Option<u64>,
    },

    Approve {
        id: u64,

        /// checker
        #[arg(long = "as")]
        checker: String,
    },

    Reject {
        id: u64,

        /// checker
        #[arg(long = "as")]
        checker: String,

        #[arg(short, long)]
        reason: String,
    },

    Show {
        id: u64,
    },

    List {
        #[arg(long)]
        state: Option<RecordState>,
    },

    Log {
        id: u64,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// every entry, newest first
    List,

    /// recompute the hash chain and check it against record states
    Verify,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_or_default()?;
    if let Some(custom_path) = cli.db_path {
        config.db_path = custom_path;
    }

    telemetry::init(&config.log_level, cli.json)?;

    if matches!(cli.command, Commands::Init) {
        return commands::init::run(&config);
    }

    let manager = DatabaseManager::load(&config)?;

    match cli.command {
        // handled before the database is opened
        Commands::Init => {}

        Commands::User(command) => match command {
            UserCommands::Add { user_id, roles } => {
                commands::user::add(&manager, &user_id, &roles)?;
            }
            UserCommands::Deactivate { user_id } => {
                commands::user::deactivate(&manager, &user_id)?;
            }
            UserCommands::List => {
                commands::user::list(&manager)?;
            }
        },

        Commands::Request(command) => {
            run_record(&manager, SubjectKind::ProductRequest, command)?;
        }

        Commands::Dispatch(command) => {
            run_record(&manager, SubjectKind::Dispatch, command)?;
        }

        Commands::Audit(command) => match command {
            AuditCommands::List => commands::audit::list(&manager)?,
            AuditCommands::Verify => commands::audit::verify(&manager)?,
        },

        Commands::Compact => {
            manager.compact()?;
            println!("Database compacted");
            return Ok(());
        }
    }

    manager.finish()
}

fn run_record(
    manager: &DatabaseManager,
    kind: SubjectKind,
    command: RecordCommands,
) -> Result<()> {
    let key = |id| RecordKey::new(kind, id);

    match command {
        RecordCommands::Create {
            maker,
            items,
            file,
            source_request,
        } => commands::record::create(
            manager,
            kind,
            &maker,
            &items,
            file.as_deref(),
            source_request,
        ),
        RecordCommands::Approve { id, checker } => {
            commands::record::approve(manager, key(id), &checker)
        }
        RecordCommands::Reject {
            id,
            checker,
            reason,
        } => commands::record::reject(manager, key(id), &checker, &reason),
        RecordCommands::Show { id } => commands::record::show(manager, key(id)),
        RecordCommands::List { state } => commands::record::list(manager, kind, state),
        RecordCommands::Log { id } => commands::record::log(manager, key(id)),
    }
}

/// Workflow failures map to fixed codes; anything else is 1.
fn exit_code(error: &anyhow::Error) -> ExitCode {
    let kind = match error.downcast_ref::<ServiceError>() {
        Some(service_error) => Some(service_error.error_kind()),
        None => error
            .downcast_ref::<StorageError>()
            .map(|_| ErrorKind::Storage),
    };

    match kind {
        Some(ErrorKind::Validation) | Some(ErrorKind::SelfApproval) => ExitCode::from(2),
        Some(ErrorKind::NotFound) => ExitCode::from(3),
        Some(ErrorKind::InvalidState) => ExitCode::from(4),
        Some(ErrorKind::Storage) => ExitCode::from(5),
        None => ExitCode::FAILURE,
    }
}
