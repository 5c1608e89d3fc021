//! Guests reached over SSH, with connection multiplexing and rsync transfers.

pub mod socket;

use crate::command::{self, Command, CommandOutput, ExecuteOptions, join_quoted, quote};
use crate::data::GuestData;
use crate::error::{Error, Result};
use crate::facts::{FactsCache, GuestFacts};
use crate::guest::{CONNECTION_DROPPED_EXIT_CODE, Guest, RebootMode, SyncRequest};
use crate::lock;
use logkit::Logger;
use socket::{SSH_MASTER_SOCKET_LENGTH_LIMIT, SocketPath};
use std::path::{Path, PathBuf};
use std::process::{self, Child, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use waiting::{Deadline, ProbeError, WaitError, Waiting};

/// Prefix of environment variables turned into extra `-o` options.
pub const SSH_ENV_PREFIX: &str = "TESTRUN_SSH_";

/// How long a terminated master process gets to exit.
pub const SSH_MASTER_TERMINATION_TIMEOUT: f64 = 3.0;

const DEFAULT_SSH_OPTIONS: [&str; 7] = [
    "-oForwardX11=no",
    "-oStrictHostKeyChecking=no",
    "-oUserKnownHostsFile=/dev/null",
    "-oConnectionAttempts=5",
    "-oConnectTimeout=60",
    "-oServerAliveInterval=5",
    "-oServerAliveCountMax=60",
];

const DEFAULT_RSYNC_PUSH_OPTIONS: [&str; 7] = [
    "-s", "-R", "-r", "-z", "--links", "--safe-links", "--delete",
];

const DEFAULT_RSYNC_PULL_OPTIONS: [&str; 7] = [
    "-s", "-R", "-r", "-z", "--links", "--safe-links", "--protect-args",
];

/// Where the driver keeps its files.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Directory holding multiplexing sockets
    pub socket_dir: PathBuf,
    /// Default source and destination of push/pull
    pub workdir: PathBuf,
    /// Socket path length limit
    pub socket_limit: usize,
}

impl SshConfig {
    pub fn new(socket_dir: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            workdir: workdir.into(),
            socket_limit: SSH_MASTER_SOCKET_LENGTH_LIMIT,
        }
    }
}

/// Turn `TESTRUN_SSH_CONNECT_TIMEOUT=120` into `-oConnectTimeout=120`.
pub fn env_ssh_options<I>(vars: I) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut options: Vec<String> = vars
        .into_iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(SSH_ENV_PREFIX)?;
            let name: String = name
                .split('_')
                .filter(|part| !part.is_empty())
                .map(|part| {
                    let lower = part.to_lowercase();
                    let mut chars = lower.chars();
                    chars
                        .next()
                        .map(|first| first.to_uppercase().chain(chars).collect::<String>())
                        .unwrap_or_default()
                })
                .collect();
            (!name.is_empty()).then(|| format!("-o{name}={value}"))
        })
        .collect();
    options.sort();
    options
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Push,
    Pull,
}

impl Direction {
    fn failure_message(self, user: &str) -> String {
        let action = match self {
            Direction::Push => "push workdir to",
            Direction::Pull => "pull workdir from",
        };
        format!(
            "Failed to {action} the guest. This usually means that login as '{user}' to the guest does not work."
        )
    }
}

enum RsyncCheck {
    AlreadyInstalled,
    Installed,
}

#[derive(Debug, Default)]
struct Multiplexing {
    socket: Option<SocketPath>,
    master: Option<Child>,
    disabled_warned: bool,
}

/// Guest driver talking to a machine over SSH.
#[derive(Debug)]
pub struct GuestSsh {
    name: String,
    data: GuestData,
    config: SshConfig,
    logger: Logger,
    facts: FactsCache,
    mux: Mutex<Multiplexing>,
}

impl GuestSsh {
    pub fn new(name: impl Into<String>, data: GuestData, config: SshConfig, logger: Logger) -> Self {
        let facts = FactsCache::new(data.facts.clone());
        Self {
            name: name.into(),
            data,
            config,
            logger,
            facts,
            mux: Mutex::new(Multiplexing::default()),
        }
    }

    fn address(&self) -> Result<&str> {
        self.data
            .primary_address
            .as_deref()
            .ok_or_else(|| Error::Connection {
                guest: self.name.clone(),
                message: "no primary address".to_string(),
            })
    }

    fn user_host(&self) -> Result<String> {
        Ok(format!("{}@{}", self.data.user(), self.address()?))
    }

    /// Identifier used to name the multiplexing socket.
    pub fn guest_id(&self) -> Option<String> {
        let address = self.data.primary_address.as_deref()?;
        Some(socket::guest_id(
            address,
            self.data.port,
            self.data.user.as_deref(),
        ))
    }

    /// Connection options without the multiplexing socket.
    pub fn ssh_options(&self) -> Vec<String> {
        let mut options: Vec<String> = DEFAULT_SSH_OPTIONS.iter().map(ToString::to_string).collect();
        options.extend(env_ssh_options(std::env::vars()));

        if let Some(port) = self.data.port {
            options.push(format!("-p{port}"));
        }
        if !self.data.key.is_empty() {
            options.push("-oIdentitiesOnly=yes".to_string());
        }
        for key in &self.data.key {
            options.push(format!("-i{}", key.display()));
        }
        if self.data.password.is_some() {
            options.push("-oPasswordAuthentication=yes".to_string());
        } else if !self.data.key.is_empty() {
            options.push("-oPasswordAuthentication=no".to_string());
        }
        options.extend(self.data.ssh_option.iter().map(|option| format!("-o{option}")));
        options
    }

    fn ssh_base(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(password) = &self.data.password {
            argv.extend(["sshpass".to_string(), "-p".to_string(), password.clone()]);
        }
        argv.push("ssh".to_string());
        argv.extend(self.ssh_options());
        argv
    }

    /// Full ssh invocation prefix, spawning the master connection if needed.
    pub fn ssh_command(&self) -> Vec<String> {
        let mut argv = self.ssh_base();
        if let Some(socket) = self.ensure_master() {
            argv.push(format!("-S{}", socket.display()));
        }
        argv
    }

    /// Socket path in use, when multiplexing is enabled.
    fn ensure_master(&self) -> Option<PathBuf> {
        let guest_id = self.guest_id()?;
        let mut mux = lock(&self.mux);

        let socket = match &mux.socket {
            Some(socket) => socket.clone(),
            None => match socket::derive_socket_path(&self.config.socket_dir, &guest_id, self.config.socket_limit) {
                Ok(socket) => {
                    mux.socket = Some(socket.clone());
                    socket
                }
                Err(e) => {
                    if !mux.disabled_warned {
                        self.logger
                            .warn(format!("Cannot prepare SSH socket, multiplexing disabled: {e}"));
                        mux.disabled_warned = true;
                    }
                    return None;
                }
            },
        };

        if !socket.within_limit() {
            if !mux.disabled_warned {
                self.logger.warn(format!(
                    "SSH socket path '{}' is too long, SSH multiplexing disabled.",
                    socket.path.display()
                ));
                mux.disabled_warned = true;
            }
            return None;
        }

        if mux.master.is_none() {
            match self.spawn_master(&socket.path) {
                Ok(child) => mux.master = Some(child),
                Err(e) => {
                    self.logger.warn(format!("Failed to spawn SSH master process: {e}"));
                    return None;
                }
            }
        }

        Some(socket.path)
    }

    fn spawn_master(&self, socket: &Path) -> Result<Child> {
        let mut argv = self.ssh_base();
        argv.push(format!("-S{}", socket.display()));
        argv.push("-MNnT".to_string());
        argv.push(self.user_host()?);

        let rendered = join_quoted(&argv);
        self.logger.debug(format!("Spawn the SSH master process: {rendered}"), 1);

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Other("empty ssh command".to_string()))?;
        process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: rendered,
                source,
            })
    }

    /// Terminate the master process, giving it a short while to exit.
    fn terminate_master(&self) {
        let mut mux = lock(&self.mux);
        let Some(mut child) = mux.master.take() else {
            return;
        };

        self.logger.debug("Terminate the SSH master process.", 1);
        send_sigterm(&child);

        let waiting = Waiting::new(Deadline::from_seconds(SSH_MASTER_TERMINATION_TIMEOUT))
            .with_tick(Duration::from_millis(100));
        let waited = waiting.wait(
            || match child.try_wait() {
                Ok(Some(_)) => Ok(()),
                Ok(None) => Err(ProbeError::Incomplete),
                Err(e) => Err(ProbeError::Failed(e)),
            },
            &self.logger,
        );

        match waited {
            Ok(()) => {}
            Err(WaitError::TimedOut { .. }) => self
                .logger
                .warn("Terminating the SSH master process timed out, abandoning it."),
            Err(WaitError::Failed(e)) => self
                .logger
                .warn(format!("Failed to wait for the SSH master process: {e}")),
        }
    }

    fn cleanup_multiplexing(&self) -> Result<()> {
        self.terminate_master();

        let socket = lock(&self.mux).socket.take();
        if let Some(socket) = socket {
            self.logger
                .debug(format!("Release SSH socket '{}'.", socket.path.display()), 2);
            socket::release_socket_path(&socket)?;
        }
        Ok(())
    }

    fn remote_script(command: &Command, options: &ExecuteOptions) -> String {
        let mut script = String::new();
        if let Some(cwd) = &options.cwd {
            script.push_str(&format!("cd {} && ", quote(&cwd.to_string_lossy())));
        }
        for (key, value) in &options.env {
            script.push_str(&format!("export {key}={}; ", quote(value)));
        }
        script.push_str(&command.to_script());
        script
    }

    fn rsync_argv(&self, direction: Direction, request: &SyncRequest) -> Result<Vec<String>> {
        let defaults: &[&str] = match direction {
            Direction::Push => &DEFAULT_RSYNC_PUSH_OPTIONS,
            Direction::Pull => &DEFAULT_RSYNC_PULL_OPTIONS,
        };

        let mut argv = vec!["rsync".to_string()];
        match &request.options {
            Some(options) => argv.extend(options.iter().cloned()),
            None => argv.extend(defaults.iter().map(ToString::to_string)),
        }
        argv.push("-e".to_string());
        argv.push(join_quoted(&self.ssh_command()));

        let workdir = &self.config.workdir;
        let root = PathBuf::from("/");
        let user_host = self.user_host()?;
        match direction {
            Direction::Push => {
                let source = request.source.as_ref().unwrap_or(workdir);
                let destination = request.destination.as_ref().unwrap_or(&root);
                argv.push(source.display().to_string());
                argv.push(format!("{user_host}:{}", destination.display()));
            }
            Direction::Pull => {
                let source = request.source.as_ref().unwrap_or(workdir);
                let destination = request.destination.as_ref().unwrap_or(&root);
                argv.push(format!("{user_host}:{}", source.display()));
                argv.push(destination.display().to_string());
            }
        }
        Ok(argv)
    }

    fn check_rsync(&self) -> Result<RsyncCheck> {
        if self
            .execute(&Command::new("rsync").arg("--version"), &ExecuteOptions::silent())
            .is_ok()
        {
            return Ok(RsyncCheck::AlreadyInstalled);
        }

        let facts = self.facts();
        let package_manager = facts.package_manager.ok_or_else(|| Error::Provision {
            message: format!("Cannot install rsync on guest '{}': no package manager detected.", self.name),
        })?;
        let sudo = self.data.r#become && facts.is_superuser != Some(true);

        self.logger.info("rsync", "not available, installing");
        self.execute(
            &package_manager.install_command(&["rsync"], false, sudo),
            &ExecuteOptions::default(),
        )?;
        Ok(RsyncCheck::Installed)
    }

    fn sync(&self, direction: Direction, request: &SyncRequest) -> Result<()> {
        let argv = self.rsync_argv(direction, request)?;
        let options = ExecuteOptions::default();

        match command::run_local(&argv, &options, &self.logger) {
            Ok(_) => Ok(()),
            Err(e @ Error::Run { .. }) => match self.check_rsync()? {
                RsyncCheck::AlreadyInstalled => Err(e),
                RsyncCheck::Installed => command::run_local(&argv, &options, &self.logger)
                    .map(|_| ())
                    .map_err(|_| Error::Provision {
                        message: direction.failure_message(self.data.user()),
                    }),
            },
            Err(e) => Err(e),
        }
    }
}

#[allow(unsafe_code)]
fn send_sigterm(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: the pid belongs to a child we spawned and have not reaped yet.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

impl Guest for GuestSsh {
    fn name(&self) -> &str {
        &self.name
    }

    fn how(&self) -> &str {
        "connect"
    }

    fn data(&self) -> GuestData {
        GuestData {
            facts: self.facts.snapshot(),
            ..self.data.clone()
        }
    }

    fn logger(&self) -> &Logger {
        &self.logger
    }

    fn is_ready(&self) -> bool {
        self.data.primary_address.is_some()
    }

    fn execute(&self, command: &Command, options: &ExecuteOptions) -> Result<CommandOutput> {
        let mut argv = self.ssh_command();
        if options.interactive {
            argv.push("-t".to_string());
        }
        argv.push(self.user_host()?);
        argv.push(Self::remote_script(command, options));

        let local = ExecuteOptions {
            cwd: None,
            env: Default::default(),
            ..options.clone()
        };
        command::run_local(&argv, &local, &self.logger)
    }

    fn push(&self, request: &SyncRequest) -> Result<()> {
        self.logger.debug("Push workdir to the guest.", 1);
        self.sync(Direction::Push, request)
    }

    fn pull(&self, request: &SyncRequest) -> Result<()> {
        self.logger.debug("Pull workdir from the guest.", 1);
        self.sync(Direction::Pull, request)
    }

    fn facts(&self) -> GuestFacts {
        self.facts.get(self, &self.logger)
    }

    fn invalidate_facts(&self) {
        self.facts.invalidate();
    }

    fn supports_hard_reboot(&self) -> bool {
        self.data.hard_reboot.is_some()
    }

    fn reboot_action(&self, mode: RebootMode, command: Option<&Command>) -> Result<()> {
        let result = match mode {
            RebootMode::Hard => match &self.data.hard_reboot {
                Some(script) => {
                    self.logger.debug(format!("Hard reboot using '{script}'."), 1);
                    command::run_local(&Command::shell(script.clone()).to_argv(), &ExecuteOptions::default(), &self.logger)
                        .map(|_| ())
                }
                None => Err(Error::RebootModeNotSupported {
                    guest: self.name.clone(),
                    mode,
                }),
            },
            RebootMode::Soft => {
                let configured = self.data.soft_reboot.clone().map(Command::shell);
                let default = Command::new("reboot");
                let command = command.or(configured.as_ref()).unwrap_or(&default);
                match self.execute(command, &ExecuteOptions::default()) {
                    Err(e) if e.exit_code() == Some(CONNECTION_DROPPED_EXIT_CODE) => Ok(()),
                    other => other.map(|_| ()),
                }
            }
        };

        // The master connection does not survive the reboot.
        self.terminate_master();
        result
    }

    fn stop(&self) -> Result<()> {
        self.terminate_master();
        Ok(())
    }

    fn suspend(&self) -> Result<()> {
        self.cleanup_multiplexing()
    }

    fn remove(&self) -> Result<()> {
        self.cleanup_multiplexing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest(data: GuestData, socket_dir: &Path) -> GuestSsh {
        GuestSsh::new(
            "default-0",
            data,
            SshConfig::new(socket_dir, "/var/tmp/testrun/run-001"),
            Logger::new("default-0"),
        )
    }

    #[test]
    fn test_env_ssh_options() {
        let vars = vec![
            ("TESTRUN_SSH_CONNECT_TIMEOUT".to_string(), "120".to_string()),
            ("TESTRUN_SSH_SERVER_ALIVE_INTERVAL".to_string(), "10".to_string()),
            ("HOME".to_string(), "/root".to_string()),
            ("TESTRUN_SSH_".to_string(), "ignored".to_string()),
        ];
        assert_eq!(
            env_ssh_options(vars),
            vec!["-oConnectTimeout=120", "-oServerAliveInterval=10"]
        );
    }

    #[test]
    fn test_ssh_options_from_data() {
        let dir = tempfile::tempdir().unwrap();
        let data = GuestData {
            port: Some(2222),
            key: vec![PathBuf::from("/keys/id_rsa")],
            ssh_option: vec!["LogLevel=ERROR".to_string()],
            ..GuestData::default().with_primary_address("10.0.0.5")
        };
        let options = guest(data, dir.path()).ssh_options();

        assert!(options.contains(&"-oStrictHostKeyChecking=no".to_string()));
        assert!(options.contains(&"-p2222".to_string()));
        assert!(options.contains(&"-oIdentitiesOnly=yes".to_string()));
        assert!(options.contains(&"-i/keys/id_rsa".to_string()));
        assert!(options.contains(&"-oPasswordAuthentication=no".to_string()));
        assert!(options.contains(&"-oLogLevel=ERROR".to_string()));
    }

    #[test]
    fn test_no_multiplexing_without_address() {
        let dir = tempfile::tempdir().unwrap();
        let guest = guest(GuestData::default(), dir.path());

        assert!(guest.guest_id().is_none());
        assert!(!guest.ssh_command().iter().any(|arg| arg.starts_with("-S")));
        assert!(!guest.is_ready());
        assert!(matches!(
            guest.execute(&Command::new("true"), &ExecuteOptions::default()),
            Err(Error::Connection { .. })
        ));
    }

    #[test]
    fn test_no_multiplexing_when_socket_path_too_long() {
        let dir = tempfile::tempdir().unwrap();
        let mut guest = guest(GuestData::default().with_primary_address("10.0.0.5"), dir.path());
        guest.config.socket_limit = 1;

        assert!(!guest.ssh_command().iter().any(|arg| arg.starts_with("-S")));
        assert!(lock(&guest.mux).master.is_none());
    }

    #[test]
    fn test_guest_id_includes_port_and_user() {
        let dir = tempfile::tempdir().unwrap();
        let data = GuestData {
            port: Some(22),
            user: Some("fedora".to_string()),
            ..GuestData::default().with_primary_address("host")
        };
        assert_eq!(guest(data, dir.path()).guest_id().as_deref(), Some("host-22-fedora"));
    }

    #[test]
    fn test_remote_script() {
        let options = ExecuteOptions::default()
            .with_cwd("/var/tmp/my dir")
            .with_env("FOO", "a b");
        let script = GuestSsh::remote_script(&Command::new("ls").arg("-l"), &options);
        assert_eq!(script, "cd '/var/tmp/my dir' && export FOO='a b'; ls -l");
    }

    #[test]
    fn test_rsync_push_argv_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut guest = guest(GuestData::default().with_primary_address("10.0.0.5"), dir.path());
        guest.config.socket_limit = 1;

        let argv = guest.rsync_argv(Direction::Push, &SyncRequest::default()).unwrap();
        assert_eq!(argv[0], "rsync");
        assert!(argv.contains(&"--delete".to_string()));
        assert_eq!(argv[argv.len() - 2], "/var/tmp/testrun/run-001");
        assert_eq!(argv[argv.len() - 1], "root@10.0.0.5:/");

        let argv = guest.rsync_argv(Direction::Pull, &SyncRequest::default()).unwrap();
        assert!(argv.contains(&"--protect-args".to_string()));
        assert_eq!(argv[argv.len() - 2], "root@10.0.0.5:/var/tmp/testrun/run-001");
        assert_eq!(argv[argv.len() - 1], "/");
    }

    #[test]
    fn test_failure_message_mentions_user() {
        assert_eq!(
            Direction::Push.failure_message("fedora"),
            "Failed to push workdir to the guest. This usually means that login as 'fedora' to the guest does not work."
        );
    }

    #[test]
    fn test_hard_reboot_support_follows_data() {
        let dir = tempfile::tempdir().unwrap();
        let plain = guest(GuestData::default().with_primary_address("h"), dir.path());
        assert!(!plain.supports_hard_reboot());

        let data = GuestData {
            hard_reboot: Some("virsh reset vm".to_string()),
            ..GuestData::default().with_primary_address("h")
        };
        assert!(guest(data, dir.path()).supports_hard_reboot());
    }

    #[test]
    fn test_suspend_without_master_releases_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let guest = guest(GuestData::default(), dir.path());
        assert!(guest.suspend().is_ok());
    }
}
