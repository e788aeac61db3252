use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "frecent")]
#[command(version)]
#[command(about = "Visit-frequency tracking and ranking for browser search")]
struct Cli {
    /// Log debug events to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a .frecent directory
    Init {
        /// Directory to initialize .frecent in
        #[arg(short, long, default_value = ".")]
        path: String,
    },

    /// Record a page visit
    Visit {
        /// Page URL
        url: String,

        /// Page title
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Record opening a bookmark
    Bookmark {
        /// Bookmark URL
        url: String,

        /// Bookmark title
        title: String,
    },

    /// Bootstrap visit data from exported browser history
    Import {
        /// History export (JSON array of history items)
        #[arg(long)]
        history: PathBuf,

        /// Bookmark tree export (JSON)
        #[arg(long)]
        bookmarks: Option<PathBuf>,
    },

    /// Re-rank fuzzy search candidates by visit frequency
    Rank {
        /// Candidates file (JSON array of {item, fuzzyScore, url})
        candidates: PathBuf,

        /// Maximum results
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Print ranked entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// List most visited pages
    List {
        /// Maximum results
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show statistics
    Stats,

    /// View or set configuration
    Config {
        /// Config key
        key: Option<String>,

        /// Config value
        value: Option<String>,
    },

    /// Forget the history import checkpoint
    Reset {
        /// Also delete all visit data
        #[arg(long)]
        all: bool,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

async fn run(command: Commands) -> Result<(), String> {
    match command {
        Commands::Init { path } => cli::visits::run_init(&path).await,
        Commands::Visit { url, title } => cli::visits::run_visit(&url, title.as_deref()).await,
        Commands::Bookmark { url, title } => cli::visits::run_bookmark(&url, &title).await,
        Commands::Import { history, bookmarks } => {
            cli::visits::run_import(&history, bookmarks.as_deref()).await
        }
        Commands::Rank {
            candidates,
            limit,
            json,
        } => cli::visits::run_rank(&candidates, limit, json).await,
        Commands::List { limit } => cli::visits::run_list(limit).await,
        Commands::Stats => cli::visits::run_stats().await,
        Commands::Config { key, value } => cli::config::run_config(key.as_deref(), value.as_deref()),
        Commands::Reset { all, force } => cli::visits::run_reset(all, force).await,
    }
}

fn main() {
    let cli = Cli::parse();
    frecent::logging::init_logging(cli.verbose);

    // Everything shares Rc state, so the whole CLI runs on one thread
    let result = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => {
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, run(cli.command))
        }
        Err(e) => Err(format!("Failed to start runtime: {}", e)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
