//! semdex - semantic search over your own files

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod client;
mod commands;
mod logging;
mod startup;
mod supervisor;

use commands::{
  cmd_folders_add, cmd_folders_list, cmd_folders_remove, cmd_progress, cmd_reindex, cmd_search, cmd_status, cmd_stop,
};
use logging::{init_cli_logging, init_daemon_logging, init_embedder_logging, init_worker_logging};

#[derive(Parser)]
#[command(name = "semdex")]
#[command(about = "Semantic search over your own files, fully local")]
#[command(after_help = "\
QUICK START:
  semdex folders add ~/Documents   # Nominate a folder
  semdex daemon                    # Start indexing + watching
  semdex search \"tax return 2023\"  # Search your files")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
pub enum FoldersCommand {
  /// Watch a folder
  Add { path: PathBuf },
  /// Stop watching a folder
  Remove { path: PathBuf },
  /// List watched folders
  List,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the supervisor in the foreground (spawns the worker)
  Daemon,
  /// Semantic search over indexed files
  Search {
    /// Search query
    query: String,
    /// Maximum results
    #[arg(short = 'k', long, default_value = "10")]
    limit: usize,
  },
  /// Show index statistics
  Status,
  /// Show indexing progress
  Progress,
  /// Manage watched folders
  Folders {
    #[command(subcommand)]
    command: FoldersCommand,
  },
  /// Re-run the indexing pass over all watched folders
  Reindex {
    /// Reindex every file even if unchanged
    #[arg(long)]
    force: bool,
  },
  /// Stop the background worker
  Stop,
  /// Run the worker process (started by the supervisor)
  #[command(hide = true)]
  Worker,
  /// Run an embedder child process (started by the worker)
  #[command(name = "embed-worker", hide = true)]
  EmbedWorker,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  match cli.command {
    Commands::Daemon => {
      init_daemon_logging();
      supervisor::run_daemon().await
    }
    Commands::Worker => {
      let _guard = init_worker_logging();
      run_worker().await
    }
    Commands::EmbedWorker => {
      init_embedder_logging();
      embedder::serve()?;
      Ok(())
    }
    Commands::Search { query, limit } => {
      init_cli_logging();
      cmd_search(query, limit).await
    }
    Commands::Status => {
      init_cli_logging();
      cmd_status().await
    }
    Commands::Progress => {
      init_cli_logging();
      cmd_progress().await
    }
    Commands::Folders { command } => {
      init_cli_logging();
      match command {
        FoldersCommand::Add { path } => cmd_folders_add(path).await,
        FoldersCommand::Remove { path } => cmd_folders_remove(path).await,
        FoldersCommand::List => cmd_folders_list().await,
      }
    }
    Commands::Reindex { force } => {
      init_cli_logging();
      cmd_reindex(force).await
    }
    Commands::Stop => {
      init_cli_logging();
      cmd_stop().await
    }
  }
}

/// Run the worker until it is cancelled by `shutdown` or a signal.
async fn run_worker() -> Result<()> {
  use tokio_util::sync::CancellationToken;

  let cancel = CancellationToken::new();

  let signal_cancel = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      signal_cancel.cancel();
    }
  });

  let options = semdex::worker::WorkerOptions::new(semdex_core::dirs::default_socket_path());
  let worker = semdex::worker::Worker::new(options, cancel);
  worker.run().await?;
  Ok(())
}
