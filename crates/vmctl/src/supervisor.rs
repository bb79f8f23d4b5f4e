use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chain::NamedChain;
use daemon::{Daemon, DaemonError, DaemonPaths, Privilege, exec};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, geteuid};
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{VmctlError, VmctlResult};
use crate::lock;

/// Interval between liveness checks while waiting for a start or stop.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const POLL_ATTEMPTS: u32 = 10;

/// Process-level lifecycle for one daemon of one instance.
pub struct Supervisor {
    daemon: Arc<dyn Daemon>,
    paths: DaemonPaths,
    chain: NamedChain,
}

impl Supervisor {
    pub fn new(daemon: Arc<dyn Daemon>, paths: DaemonPaths) -> Self {
        let chain = NamedChain::new(daemon.name());
        Self {
            daemon,
            paths,
            chain,
        }
    }

    /// Re-run the current executable with `args` as a background process,
    /// then wait for the daemon to come alive.
    ///
    /// The child gets `env_var=1`, its own process group, and the daemon's
    /// log file for stdout and stderr. A daemon that needs root is launched
    /// through `sudo` once credentials have been confirmed in the foreground.
    pub async fn spawn(&self, args: &[String], env_var: &str) -> VmctlResult<()> {
        let name = self.daemon.name();
        if self.daemon.alive().await.is_ok() {
            info!(daemon = name, "already running");
            return Ok(());
        }
        tokio::fs::create_dir_all(self.paths.dir()).await?;
        let log = self.paths.log_file(name);
        let log_ref = log.as_path();
        let daemon = self.daemon.as_ref();
        let privilege = self.spawn_privilege(geteuid().is_root());

        let mut a = self.chain.init();
        if privilege == Privilege::Sudo {
            a.stage("acquiring root privileges");
            a.add(|| async { exec("sudo", &["-v"], Privilege::User).await.map(drop) });
        }
        a.stagef(format_args!("starting {name}"));
        a.add(move || async move { spawn_background(privilege, args, env_var, log_ref) });
        a.retry(
            format!("waiting for {name}"),
            POLL_INTERVAL,
            POLL_ATTEMPTS,
            move |_| daemon.alive(),
        );
        a.exec().await?;

        info!(daemon = name, log = %log.display(), "started");
        Ok(())
    }

    /// Run the daemon in this process until SIGINT or SIGTERM.
    pub async fn run(&self) -> VmctlResult<()> {
        let cancel = CancellationToken::new();
        let sigterm = signal(SignalKind::terminate())?;
        let sigint = signal(SignalKind::interrupt())?;
        let watcher = tokio::spawn(cancel_on_signal(sigterm, sigint, cancel.clone()));

        let result = self.run_until(cancel).await;
        watcher.abort();
        result
    }

    /// Run the daemon in this process until `cancel` fires.
    ///
    /// Holds the daemon's lock file for the whole run and keeps the pid file
    /// current while it is held.
    pub async fn run_until(&self, cancel: CancellationToken) -> VmctlResult<()> {
        let name = self.daemon.name();
        tokio::fs::create_dir_all(self.paths.dir()).await?;
        let _lock = lock::try_acquire(self.paths.lock_file(name), name).await?;

        let pid_file = self.paths.pid_file(name);
        let pid = std::process::id();
        tokio::fs::write(&pid_file, format!("{pid}\n")).await?;
        info!(daemon = name, pid, "running");

        let managed = self.daemon.as_ref();
        let mut a = self.chain.init();
        a.stagef(format_args!("running {name}"));
        a.add(move || daemon::start(managed, cancel));
        let result = a.exec().await;

        if let Err(e) = tokio::fs::remove_file(&pid_file).await {
            warn!(path = %pid_file.display(), error = %e, "failed to remove pid file");
        }
        result.map_err(VmctlError::from)
    }

    /// Send SIGTERM to the recorded daemon process and wait until it is gone.
    ///
    /// A missing pid file means nothing is running. A pid file naming a dead
    /// process is removed.
    pub async fn stop(&self) -> VmctlResult<()> {
        let name = self.daemon.name();
        let pid_file = self.paths.pid_file(name);
        let pid = match tokio::fs::read_to_string(&pid_file).await {
            Ok(contents) => parse_pid(&contents).ok_or_else(|| {
                VmctlError::Config(format!("malformed pid file {}", pid_file.display()))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(daemon = name, "not running");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match kill(pid, Signal::SIGTERM) {
            Ok(()) => info!(daemon = name, %pid, "sent SIGTERM"),
            Err(Errno::ESRCH) => {
                warn!(daemon = name, %pid, "process is gone, removing stale pid file");
                tokio::fs::remove_file(&pid_file).await?;
                return Ok(());
            }
            // A root daemon started through sudo has to be signalled the same way.
            Err(Errno::EPERM) if self.spawn_privilege(false) == Privilege::Sudo => {
                let pid = pid.to_string();
                exec("kill", &["-TERM", &pid], Privilege::Sudo)
                    .await
                    .map_err(DaemonError::from)?;
                info!(daemon = name, %pid, "sent SIGTERM through sudo");
            }
            Err(e) => return Err(e.into()),
        }

        let daemon = self.daemon.as_ref();
        let mut a = self.chain.init();
        a.stagef(format_args!("stopping {name}"));
        a.retry(
            format!("waiting for {name} to stop"),
            POLL_INTERVAL,
            POLL_ATTEMPTS,
            move |_| async move {
                match daemon.alive().await {
                    Ok(()) => Err(VmctlError::StillRunning(daemon.name().to_string())),
                    Err(_) => Ok(()),
                }
            },
        );
        a.exec().await?;
        Ok(())
    }

    pub async fn status(&self) -> VmctlResult<()> {
        self.daemon.alive().await?;
        Ok(())
    }

    /// How the background process is launched, given whether we are root.
    fn spawn_privilege(&self, is_root: bool) -> Privilege {
        let (_, root_required) = self.daemon.dependencies();
        Privilege::from_root(root_required && !is_root)
    }
}

fn background_command(privilege: Privilege, exe: &Path, args: &[String], env_var: &str) -> Command {
    let mut cmd = privilege.command(exe, &[(env_var, "1")]);
    cmd.args(args);
    cmd
}

fn spawn_background(
    privilege: Privilege,
    args: &[String],
    env_var: &str,
    log: &Path,
) -> io::Result<()> {
    let exe = std::env::current_exe()?;
    let stdout = std::fs::File::options()
        .create(true)
        .append(true)
        .open(log)?;
    let stderr = stdout.try_clone()?;
    let child = background_command(privilege, &exe, args, env_var)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .spawn()?;
    info!(pid = ?child.id(), "spawned background process");
    Ok(())
}

fn parse_pid(contents: &str) -> Option<Pid> {
    contents
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw)
}

async fn cancel_on_signal(
    mut sigterm: tokio::signal::unix::Signal,
    mut sigint: tokio::signal::unix::Signal,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, stopping"),
        _ = sigint.recv() => info!("received SIGINT, stopping"),
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use daemon::{DaemonError, Dependency};

    use super::*;

    struct Missing;

    #[async_trait]
    impl Dependency for Missing {
        fn name(&self) -> String {
            "missing".into()
        }

        async fn installed(&self) -> bool {
            false
        }

        async fn install(&self) -> daemon::Result<()> {
            Err(DaemonError::NotFound("nothing to install".into()))
        }
    }

    #[derive(Default)]
    struct Fake {
        alive: AtomicBool,
        missing_dependency: bool,
        root_required: bool,
    }

    #[async_trait]
    impl Daemon for Fake {
        fn name(&self) -> &str {
            "fake"
        }

        async fn alive(&self) -> daemon::Result<()> {
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(DaemonError::NotAlive {
                    name: "fake".into(),
                    detail: "not started".into(),
                })
            }
        }

        async fn start(&self, cancel: CancellationToken) -> daemon::Result<()> {
            self.alive.store(true, Ordering::SeqCst);
            cancel.cancelled().await;
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn dependencies(&self) -> (Vec<Box<dyn Dependency>>, bool) {
            let deps: Vec<Box<dyn Dependency>> = if self.missing_dependency {
                vec![Box::new(Missing)]
            } else {
                Vec::new()
            };
            (deps, self.root_required)
        }
    }

    fn supervisor(dir: &Path, fake: &Arc<Fake>) -> Supervisor {
        let daemon: Arc<dyn Daemon> = fake.clone();
        Supervisor::new(daemon, DaemonPaths::new(dir.to_path_buf()))
    }

    async fn wait_alive(fake: &Fake) {
        for _ in 0..500 {
            if fake.alive.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fake daemon never started");
    }

    #[tokio::test]
    async fn run_until_writes_and_removes_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(Fake::default());
        let sup = Arc::new(supervisor(dir.path(), &fake));
        let pid_file = DaemonPaths::new(dir.path().to_path_buf()).pid_file("fake");

        let cancel = CancellationToken::new();
        let handle = {
            let sup = Arc::clone(&sup);
            let cancel = cancel.clone();
            tokio::spawn(async move { sup.run_until(cancel).await })
        };
        wait_alive(&fake).await;

        let recorded = std::fs::read_to_string(&pid_file).unwrap();
        assert_eq!(recorded.trim(), std::process::id().to_string());
        sup.status().await.unwrap();

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(!pid_file.exists());
        assert!(sup.status().await.is_err());
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(Fake::default());
        let sup = Arc::new(supervisor(dir.path(), &fake));

        let cancel = CancellationToken::new();
        let handle = {
            let sup = Arc::clone(&sup);
            let cancel = cancel.clone();
            tokio::spawn(async move { sup.run_until(cancel).await })
        };
        wait_alive(&fake).await;

        let err = sup.run_until(CancellationToken::new()).await.unwrap_err();
        assert!(
            matches!(&err, VmctlError::AlreadyRunning(name) if name == "fake"),
            "got: {err}"
        );

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dependency_failure_is_tagged_with_stage() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(Fake {
            missing_dependency: true,
            ..Fake::default()
        });
        let sup = supervisor(dir.path(), &fake);

        let err = sup.run_until(CancellationToken::new()).await.unwrap_err();
        let VmctlError::Chain(err) = err else {
            panic!("expected chain error, got: {err}");
        };
        assert_eq!(err.stage(), Some("running fake"));
        assert!(err.to_string().contains("dependency missing"), "got: {err}");
        assert!(!fake.alive.load(Ordering::SeqCst));
        assert!(
            !DaemonPaths::new(dir.path().to_path_buf())
                .pid_file("fake")
                .exists()
        );
    }

    #[tokio::test]
    async fn root_daemon_is_refused_when_not_root() {
        if geteuid().is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(Fake {
            root_required: true,
            ..Fake::default()
        });
        let sup = supervisor(dir.path(), &fake);

        let err = sup.run_until(CancellationToken::new()).await.unwrap_err();
        let VmctlError::Chain(err) = err else {
            panic!("expected chain error, got: {err}");
        };
        assert_eq!(err.to_string(), "error at 'running fake': fake must be started as root");
        assert!(!fake.alive.load(Ordering::SeqCst));
    }

    #[test]
    fn root_daemon_is_spawned_through_sudo_unless_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = Arc::new(Fake {
            root_required: true,
            ..Fake::default()
        });
        let sup = supervisor(dir.path(), &root);
        assert_eq!(sup.spawn_privilege(false), Privilege::Sudo);
        assert_eq!(sup.spawn_privilege(true), Privilege::User);

        let plain = supervisor(dir.path(), &Arc::new(Fake::default()));
        assert_eq!(plain.spawn_privilege(false), Privilege::User);
    }

    #[test]
    fn background_command_marks_the_child() {
        let args = ["gvproxy".to_string(), "run".to_string()];
        let exe = Path::new("/usr/local/bin/vmctl");

        let sudo = background_command(Privilege::Sudo, exe, &args, "VMCTL_GVPROXY");
        let sudo = sudo.as_std();
        assert_eq!(sudo.get_program(), "sudo");
        let sudo_args: Vec<_> = sudo.get_args().collect();
        assert_eq!(
            sudo_args,
            ["env", "VMCTL_GVPROXY=1", "/usr/local/bin/vmctl", "gvproxy", "run"]
        );

        let user = background_command(Privilege::User, exe, &args, "VMCTL_GVPROXY");
        let user = user.as_std();
        assert_eq!(user.get_program(), "/usr/local/bin/vmctl");
        let user_args: Vec<_> = user.get_args().collect();
        assert_eq!(user_args, ["gvproxy", "run"]);
        assert_eq!(user.get_envs().count(), 1);
    }

    #[tokio::test]
    async fn stop_without_pid_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &Arc::new(Fake::default()));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_removes_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.dir()).unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        std::fs::write(paths.pid_file("fake"), format!("{pid}\n")).unwrap();

        let sup = supervisor(dir.path(), &Arc::new(Fake::default()));
        sup.stop().await.unwrap();
        assert!(!paths.pid_file("fake").exists());
    }

    #[tokio::test]
    async fn stop_rejects_malformed_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.dir()).unwrap();
        std::fs::write(paths.pid_file("fake"), "not a pid").unwrap();

        let sup = supervisor(dir.path(), &Arc::new(Fake::default()));
        let err = sup.stop().await.unwrap_err();
        assert!(matches!(err, VmctlError::Config(_)), "got: {err}");
    }

    #[test]
    fn parse_pid_accepts_trailing_newline_only_for_positive_ids() {
        assert_eq!(parse_pid("42\n"), Some(Pid::from_raw(42)));
        assert_eq!(parse_pid("0"), None);
        assert_eq!(parse_pid("-1"), None);
        assert_eq!(parse_pid(""), None);
    }
}
