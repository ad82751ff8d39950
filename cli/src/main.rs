mod cmd;

use clap::{Parser, Subcommand};
use cmd::exercise::Backend;
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "vfsshim")]
#[command(about = "Drive SQLite through a VFS shim that can fail writes on demand", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write rows through the shim, optionally with writes failing
    Exercise {
        /// Database path
        db: PathBuf,

        /// Rows to insert per batch
        #[arg(long, default_value_t = 10)]
        rows: usize,

        /// Run a second batch with the fail flag set
        #[arg(long)]
        fail: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Storage the shim sits on
        #[arg(long, value_enum, default_value_t = Backend::Sqlite)]
        backend: Backend,
    },
    /// Print the VFS name reported for a database
    VfsName {
        /// Database path
        db: PathBuf,
    },
}

fn subscriber<W>(ansi: bool, writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vfsshim=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer)
        .finish()
}

/// With `to_stderr` the logs stay off stdout, which then carries only the
/// command's own output.
fn init_tracing(to_stderr: bool) {
    if to_stderr {
        subscriber(std::io::stderr().is_terminal(), std::io::stderr).init();
    } else {
        subscriber(std::io::stdout().is_terminal(), std::io::stdout).init();
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(matches!(args.command, Commands::Exercise { json: true, .. }));

    let result = match args.command {
        Commands::Exercise {
            db,
            rows,
            fail,
            json,
            backend,
        } => cmd::exercise::handle_exercise_command(
            &mut std::io::stdout(),
            &db,
            rows,
            fail,
            json,
            backend,
        ),
        Commands::VfsName { db } => {
            cmd::vfs_name::handle_vfs_name_command(&mut std::io::stdout(), &db)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
