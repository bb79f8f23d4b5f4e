mod cmd;
mod error;
mod lock;
mod paths;
mod supervisor;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{ArgAction, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::fmt::time::FormatTime;

use crate::cmd::{Globals, GvproxyCommand};
use crate::paths::HomePaths;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "vmctl", version)]
struct Cli {
    /// Directory holding one subdirectory per profile [default: $HOME/.vmctl]
    #[arg(long, global = true, env = "VMCTL_HOME")]
    home: Option<PathBuf>,

    /// Instance to operate on
    #[arg(long, global = true, env = "VMCTL_PROFILE", default_value = "default")]
    profile: String,

    /// Log at debug level; repeat to also trace every guest frame
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the user-mode network daemon
    #[command(subcommand)]
    Gvproxy(GvproxyCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let result = match HomePaths::new(cli.home) {
        Ok(home) => {
            let globals = Globals {
                home,
                profile: cli.profile,
                verbose: cli.verbose,
            };
            match cli.command {
                Command::Gvproxy(command) => cmd::run_gvproxy(&globals, command).await,
            }
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
