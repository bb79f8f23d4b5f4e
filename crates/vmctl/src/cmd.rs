use std::sync::Arc;

use clap::Subcommand;
use daemon::Daemon;
use daemon_gvproxy::{GvproxyDaemon, Info, Instance, NAME, SUBPROCESS_ENV_VAR};
use serde::Serialize;
use tracing::info;

use crate::error::{VmctlError, VmctlResult};
use crate::paths::HomePaths;
use crate::supervisor::Supervisor;

#[derive(Subcommand)]
pub enum GvproxyCommand {
    /// Start gvproxy in the background and wait until its socket is up
    Start,
    /// Run gvproxy in the foreground until SIGINT or SIGTERM
    Run,
    /// Stop the background gvproxy process
    Stop,
    /// Exit successfully if gvproxy is running
    Status,
    /// Print the socket and MAC address a VM attaches with
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Global options forwarded to the background process.
pub struct Globals {
    pub home: HomePaths,
    pub profile: String,
    pub verbose: u8,
}

impl Globals {
    fn child_args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            "--home".to_string(),
            self.home.home().to_string_lossy().into_owned(),
            "--profile".to_string(),
            self.profile.clone(),
        ];
        if self.verbose > 0 {
            args.push(format!("-{}", "v".repeat(usize::from(self.verbose))));
        }
        args.extend([NAME.to_string(), command.to_string()]);
        args
    }
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    socket: String,
    mac_address: String,
}

impl From<Info> for InfoOutput {
    fn from(info: Info) -> Self {
        Self {
            socket: info.socket.unix(),
            mac_address: info.mac_address.to_string(),
        }
    }
}

pub async fn run_gvproxy(globals: &Globals, command: GvproxyCommand) -> VmctlResult<()> {
    let paths = globals.home.instance(&globals.profile)?;
    let instance = Arc::new(Instance::new(paths.clone()));
    let daemon = Arc::new(GvproxyDaemon::new(instance).with_debug(globals.verbose >= 2));
    let managed: Arc<dyn Daemon> = daemon.clone();
    let supervisor = Supervisor::new(managed, paths);

    match command {
        GvproxyCommand::Start => {
            if std::env::var_os(SUBPROCESS_ENV_VAR).is_some() {
                return Err(VmctlError::Config(format!(
                    "refusing to start {NAME} from its own background process"
                )));
            }
            supervisor
                .spawn(&globals.child_args("run"), SUBPROCESS_ENV_VAR)
                .await
        }
        GvproxyCommand::Run => {
            let background = std::env::var_os(SUBPROCESS_ENV_VAR).is_some();
            info!(profile = %globals.profile, background, "running {NAME}");
            supervisor.run().await
        }
        GvproxyCommand::Stop => supervisor.stop().await,
        GvproxyCommand::Status => {
            supervisor.status().await?;
            println!("{NAME} is running ({})", daemon.socket());
            Ok(())
        }
        GvproxyCommand::Info { json } => {
            let output = InfoOutput::from(daemon.info());
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("socket: {}", output.socket);
                println!("mac_address: {}", output.mac_address);
            }
            Ok(())
        }
    }
}
