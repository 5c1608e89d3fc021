//! Commands, execution options and local process execution.

use crate::error::{Error, Result};
use logkit::Logger;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{self, Stdio};
use std::thread;
use std::time::Duration;
use waiting::{Deadline, ProbeError, WaitError, Waiting};

/// Exit code reported for commands killed after their timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const POLL_TICK: Duration = Duration::from_millis(50);

/// How long output readers may keep draining after a timed out command was killed.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(1);

/// A command to run on a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Program followed by its arguments
    Argv(Vec<String>),
    /// Shell script run by bash
    Shell(String),
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Command::Argv(vec![program.into()])
    }

    pub fn shell(script: impl Into<String>) -> Self {
        Command::Shell(script.into())
    }

    /// Append one argument. Shell scripts get it quoted at the end.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        match &mut self {
            Command::Argv(argv) => argv.push(arg.into()),
            Command::Shell(script) => {
                script.push(' ');
                script.push_str(&quote(&arg.into()));
            }
        }
        self
    }

    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        args.into_iter().fold(self, |cmd, arg| cmd.arg(arg))
    }

    /// Arguments for a local `execve`.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Command::Argv(argv) => argv.clone(),
            Command::Shell(script) => vec!["/bin/bash".into(), "-c".into(), script.clone()],
        }
    }

    /// Single string suitable for a remote shell.
    pub fn to_script(&self) -> String {
        match self {
            Command::Argv(argv) => join_quoted(argv),
            Command::Shell(script) => script.clone(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_script())
    }
}

/// Quote a word for a POSIX shell.
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

pub fn join_quoted<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|word| quote(word.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// How a command should be executed.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    /// Attach the terminal instead of capturing output
    pub interactive: bool,
    /// Do not log the command and its output
    pub silent: bool,
}

impl ExecuteOptions {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn collect(reader: thread::JoinHandle<String>) -> String {
    reader.join().unwrap_or_default()
}

/// Join a reader unless it is still blocked after `limit`.
///
/// A process that escaped the killed group may hold the pipe open forever.
fn collect_within(reader: thread::JoinHandle<String>, limit: Duration, logger: &Logger) -> String {
    let drained = Waiting::new(Deadline::from_duration(limit))
        .with_tick(POLL_TICK)
        .wait(
            || {
                if reader.is_finished() {
                    Ok(())
                } else {
                    Err(ProbeError::<()>::Incomplete)
                }
            },
            logger,
        );
    match drained {
        Ok(()) => collect(reader),
        Err(_) => String::new(),
    }
}

/// Kill the process group led by `child`, taking its forked descendants along.
#[allow(unsafe_code)]
fn kill_group(child: &mut process::Child) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: the child leads its own process group and has not been reaped yet.
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

/// Run a program on this machine.
///
/// Output is captured unless `options.interactive` is set. With a timeout the
/// child is polled and killed once the timeout expires, yielding a run error
/// with [`TIMEOUT_EXIT_CODE`].
pub fn run_local(argv: &[String], options: &ExecuteOptions, logger: &Logger) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Other("cannot run an empty command".to_string()))?;
    let rendered = join_quoted(argv);

    let mut cmd = process::Command::new(program);
    cmd.args(args).envs(&options.env);
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    if !options.silent {
        logger.debug(format!("Run command: {rendered}"), 2);
    }

    if options.interactive {
        let status = cmd.status().map_err(|source| Error::Spawn {
            command: rendered.clone(),
            source,
        })?;
        return if status.success() {
            Ok(CommandOutput::default())
        } else {
            Err(Error::run(rendered, status.code(), "", ""))
        };
    }

    if options.timeout.is_some() {
        // Own group, so a timeout reaches everything the command forked.
        cmd.process_group(0);
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::Spawn {
            command: rendered.clone(),
            source,
        })?;

    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let status = match options.timeout {
        None => child.wait()?,
        Some(timeout) => {
            let waiting = Waiting::new(Deadline::from_duration(timeout)).with_tick(POLL_TICK);
            let waited = waiting.wait(
                || match child.try_wait() {
                    Ok(Some(status)) => Ok(status),
                    Ok(None) => Err(ProbeError::Incomplete),
                    Err(e) => Err(ProbeError::Failed(e)),
                },
                logger,
            );

            match waited {
                Ok(status) => status,
                Err(WaitError::Failed(e)) => return Err(e.into()),
                Err(WaitError::TimedOut { .. }) => {
                    logger.debug(
                        format!("Command timed out after {}s: {rendered}", timeout.as_secs()),
                        1,
                    );
                    kill_group(&mut child);
                    let _ = child.wait();
                    return Err(Error::run(
                        rendered,
                        Some(TIMEOUT_EXIT_CODE),
                        collect_within(stdout, DRAIN_AFTER_KILL, logger),
                        collect_within(stderr, DRAIN_AFTER_KILL, logger),
                    ));
                }
            }
        }
    };

    let output = CommandOutput {
        stdout: collect(stdout),
        stderr: collect(stderr),
    };

    if !options.silent {
        for line in output.stdout.lines() {
            logger.debug(format!("out: {line}"), 3);
        }
        for line in output.stderr.lines() {
            logger.debug(format!("err: {line}"), 3);
        }
    }

    if status.success() {
        Ok(output)
    } else {
        Err(Error::run(rendered, status.code(), output.stdout, output.stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> Logger {
        Logger::new("test")
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain-word_1.txt"), "plain-word_1.txt");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_command_rendering() {
        let cmd = Command::new("echo").args(["hello world", "x"]);
        assert_eq!(cmd.to_script(), "echo 'hello world' x");
        assert_eq!(cmd.to_argv(), vec!["echo", "hello world", "x"]);

        let script = Command::shell("echo -n \"$container\"");
        assert_eq!(script.to_argv()[0], "/bin/bash");
        assert_eq!(script.to_string(), "echo -n \"$container\"");
    }

    #[test]
    fn test_shell_command_arg_is_quoted() {
        let cmd = Command::shell("dnf install -y").arg("foo bar");
        assert_eq!(cmd.to_script(), "dnf install -y 'foo bar'");
    }

    #[test]
    fn test_run_local_captures_output() {
        let output = run_local(
            &Command::shell("echo out; echo err >&2").to_argv(),
            &ExecuteOptions::default(),
            &logger(),
        )
        .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[test]
    fn test_run_local_failure_carries_output() {
        let err = run_local(
            &Command::shell("echo partial; exit 3").to_argv(),
            &ExecuteOptions::default(),
            &logger(),
        )
        .unwrap_err();

        match err {
            Error::Run {
                exit_code, stdout, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stdout, "partial\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_run_local_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExecuteOptions::default()
            .with_cwd(dir.path())
            .with_env("GREETING", "hi");

        let output = run_local(
            &Command::shell("echo $GREETING; pwd").to_argv(),
            &options,
            &logger(),
        )
        .unwrap();

        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hi"));
        let pwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(pwd, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_run_local_timeout() {
        let options = ExecuteOptions::default().with_timeout(Duration::from_millis(200));
        let err = run_local(&Command::new("sleep").arg("5").to_argv(), &options, &logger())
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(TIMEOUT_EXIT_CODE));
    }

    #[test]
    fn test_run_local_timeout_kills_forked_children() {
        let options = ExecuteOptions::default().with_timeout(Duration::from_millis(500));
        let started = std::time::Instant::now();
        let err = run_local(
            &Command::shell("echo started; sleep 6; true").to_argv(),
            &options,
            &logger(),
        )
        .unwrap_err();

        assert_eq!(err.exit_code(), Some(TIMEOUT_EXIT_CODE));
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "timeout took {:?}",
            started.elapsed()
        );
        match err {
            Error::Run { stdout, .. } => assert_eq!(stdout, "started\n"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_run_local_missing_program() {
        let err = run_local(
            &["definitely-not-a-real-program-xyz".to_string()],
            &ExecuteOptions::default(),
            &logger(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
