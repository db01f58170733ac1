mod bills;
mod commands;
mod config;
mod logging;
mod provider;
mod render;

use anyhow::Result;
use billsync_core::{BillId, ChangeKind, ConflictChoice, ConflictId};
use clap::{Parser, Subcommand, ValueEnum};

use commands::App;
use commands::connect::ConnectArgs;

#[derive(Parser)]
#[command(name = "billsync")]
#[command(about = "Mirror household bill due dates into your calendars")]
struct Cli {
    /// Print machine-readable JSON instead of text; logs become JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue depth, failures, conflicts and recent results
    Status,
    /// Dispatch queued operations now
    Sync {
        /// Only sync this bill
        #[arg(long)]
        bill: Option<BillId>,
    },
    /// Record a bill change (created, updated, deleted, paid)
    Notify {
        bill: BillId,
        change: ChangeKind,
    },
    /// Requeue permanently failed operations and sync them
    Retry {
        #[arg(long)]
        bill: Option<BillId>,
    },
    /// Store credentials for a calendar provider
    Connect {
        /// google, outlook or caldav
        provider: String,

        /// Account label (e-mail or username)
        #[arg(long)]
        account: Option<String>,

        /// Calendar id (Google, Outlook) or collection URL (CalDAV)
        #[arg(long)]
        calendar: Option<String>,
    },
    /// Forget a provider's credentials and drop its queued work
    Disconnect { provider: String },
    /// Check that stored credentials still work
    Test { provider: String },
    /// List conflicts waiting for a decision
    Conflicts,
    /// Settle a conflict
    Resolve {
        id: ConflictId,

        #[arg(long, value_enum)]
        keep: Keep,
    },
    /// Run the background worker until Ctrl-C
    Watch,
}

#[derive(Clone, Copy, ValueEnum)]
enum Keep {
    /// Keep the bill's version and overwrite the calendar
    Local,
    /// Keep the calendar's version and update the bill
    Remote,
}

impl From<Keep> for ConflictChoice {
    fn from(keep: Keep) -> Self {
        match keep {
            Keep::Local => ConflictChoice::KeepLocal,
            Keep::Remote => ConflictChoice::KeepRemote,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.json);

    let app = App::open(cli.json)?;

    match cli.command {
        Commands::Status => commands::status::run(&app),
        Commands::Sync { bill } => commands::sync::run(&app, bill).await,
        Commands::Notify { bill, change } => commands::notify::run(&app, bill, change),
        Commands::Retry { bill } => commands::sync::retry(&app, bill).await,
        Commands::Connect {
            provider,
            account,
            calendar,
        } => {
            commands::connect::run(&app, &provider, ConnectArgs { account, calendar }).await
        }
        Commands::Disconnect { provider } => commands::connect::disconnect(&app, &provider).await,
        Commands::Test { provider } => commands::connect::test(&app, &provider).await,
        Commands::Conflicts => commands::conflicts::list(&app),
        Commands::Resolve { id, keep } => commands::conflicts::resolve(&app, id, keep.into()),
        Commands::Watch => commands::watch::run(&app).await,
    }
}
