mod command;
mod daemon;
mod dependency;
mod error;
mod paths;
mod socket;

pub use command::{CommandError, Privilege, exec};
pub use daemon::{Daemon, start};
pub use dependency::{Dependency, Symlink, resolve};
pub use error::{DaemonError, Result};
pub use paths::DaemonPaths;
pub use socket::Socket;
