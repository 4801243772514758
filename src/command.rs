//! Subprocess execution with streamed progress.
//!
//! [`CommandRunner::run_interactive`] echoes the command line as a
//! [`MsgLevel::Command`] update, then forwards each line the child prints as
//! its own update. [`CommandRunner::run_captured`] is for commands whose output
//! is needed (password hashing) or that must not be echoed.
//!
//! Every child is spawned through [`CommandProcessGroup::in_new_process_group`]
//! and held in the global child registry while it runs.

use std::fmt;
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::error::{InstallError, Result};
use crate::process_guard::{CommandProcessGroup, TrackedChild};
use crate::progress::{MsgLevel, Update, UpdateSender};
use crate::secret::Secret;

/// Shortest output line worth forwarding.
const MIN_LINE_LEN: usize = 2;

/// A program, its arguments and optional secret stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    stdin: Option<Secret>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `secret` to the child's stdin, then close it.
    pub fn stdin(mut self, secret: Secret) -> Self {
        self.stdin = Some(secret);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn has_stdin(&self) -> bool {
        self.stdin.is_some()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        cmd
    }

    fn spawn(&self) -> Result<Child> {
        self.command()
            .spawn()
            .map_err(|source| InstallError::CommandSpawn {
                program: self.program.clone(),
                source,
            })
    }
}

/// Command line as echoed to the observer. Never includes stdin.
impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How output lines are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// stdout as info, stderr as warnings, appended.
    #[default]
    Standard,
    /// Both streams replace the previous line (redrawing progress meters).
    Progress,
}

/// Exit status of a finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    /// None when the child was killed by a signal.
    pub code: Option<i32>,
}

impl CommandStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a nonzero exit into a [`InstallError::CommandFailed`].
    pub fn ensure_success(self, invocation: &Invocation) -> Result<()> {
        if self.success() {
            Ok(())
        } else {
            Err(InstallError::CommandFailed {
                command: invocation.to_string(),
                code: self.code,
                output: String::new(),
            })
        }
    }
}

/// Output of [`CommandRunner::run_captured`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: CommandStatus,
}

impl CapturedOutput {
    pub fn ensure_success(self, invocation: &Invocation) -> Result<Self> {
        if self.status.success() {
            Ok(self)
        } else {
            Err(InstallError::CommandFailed {
                command: invocation.to_string(),
                code: self.status.code,
                output: self.stderr,
            })
        }
    }
}

/// Runs external commands on behalf of installation steps.
pub trait CommandRunner: Send + Sync {
    /// Run with output streamed to `updates`, each line tagged with `prefix`.
    ///
    /// A nonzero exit is reported in the status, not as an error.
    fn run_interactive(
        &self,
        updates: &UpdateSender,
        prefix: &str,
        invocation: &Invocation,
        mode: OutputMode,
    ) -> Result<CommandStatus>;

    /// Run silently and collect the output.
    fn run_captured(&self, invocation: &Invocation) -> Result<CapturedOutput>;

    /// [`run_interactive`](Self::run_interactive), failing on nonzero exit.
    fn run(
        &self,
        updates: &UpdateSender,
        prefix: &str,
        invocation: &Invocation,
        mode: OutputMode,
    ) -> Result<()> {
        self.run_interactive(updates, prefix, invocation, mode)?
            .ensure_success(invocation)
    }
}

/// Runs commands on the host.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

fn feed_stdin(child: &mut Child, invocation: &Invocation) -> Option<JoinHandle<()>> {
    let secret = invocation.stdin.clone()?;
    let mut pipe = child.stdin.take()?;
    let program = invocation.program.clone();
    Some(thread::spawn(move || {
        if let Err(e) = pipe.write_all(secret.expose().as_bytes()) {
            warn!("Writing stdin of {} failed: {}", program, e);
        }
    }))
}

fn pump<R: Read + Send + 'static>(mut source: R, mut sink: LineSink) -> JoinHandle<()> {
    thread::spawn(move || {
        if let Err(e) = io::copy(&mut source, &mut sink) {
            debug!("Output pipe closed early: {}", e);
        }
        sink.finish();
    })
}

fn join_quietly(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!("Command I/O thread panicked");
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run_interactive(
        &self,
        updates: &UpdateSender,
        prefix: &str,
        invocation: &Invocation,
        mode: OutputMode,
    ) -> Result<CommandStatus> {
        updates.command(format!("{}\n", invocation));
        debug!("Running {}", invocation);

        let mut child = invocation.spawn()?;
        let tracked = TrackedChild::register(child.id());

        let writer = feed_stdin(&mut child, invocation);
        let progress = mode == OutputMode::Progress;
        let out_reader = child.stdout.take().map(|out| {
            pump(out, LineSink::new(updates.clone(), prefix, MsgLevel::Info, progress))
        });
        let err_level = if progress {
            MsgLevel::Info
        } else {
            MsgLevel::Warning
        };
        let err_reader = child
            .stderr
            .take()
            .map(|err| pump(err, LineSink::new(updates.clone(), prefix, err_level, progress)));

        let status = child.wait()?;
        drop(tracked);
        join_quietly(writer);
        join_quietly(out_reader);
        join_quietly(err_reader);

        let status = CommandStatus {
            code: status.code(),
        };
        if !status.success() {
            debug!("{} exited with {:?}", invocation.program, status.code);
        }
        Ok(status)
    }

    fn run_captured(&self, invocation: &Invocation) -> Result<CapturedOutput> {
        debug!("Running {} (captured)", invocation);

        let mut child = invocation.spawn()?;
        let _tracked = TrackedChild::register(child.id());
        let writer = feed_stdin(&mut child, invocation);
        let output = child.wait_with_output()?;
        join_quietly(writer);

        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: CommandStatus {
                code: output.status.code(),
            },
        })
    }
}

/// Splits a byte stream into lines and forwards each as an [`Update`].
///
/// Both `\n` and `\r` end a line. Partial lines are buffered across writes
/// and flushed when the sink is finished or dropped.
pub struct LineSink {
    updates: UpdateSender,
    prefix: String,
    level: MsgLevel,
    progress: bool,
    pending: Vec<u8>,
}

impl LineSink {
    pub fn new(updates: UpdateSender, prefix: &str, level: MsgLevel, progress: bool) -> Self {
        Self {
            updates,
            prefix: prefix.to_string(),
            level,
            progress,
            pending: Vec::new(),
        }
    }

    fn emit_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let raw = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&raw);
        let line = text.trim();
        if line.len() < MIN_LINE_LEN {
            return;
        }
        self.updates.send(Update {
            stage: None,
            msg: format!("  {} {}\n", self.prefix, line),
            level: self.level,
            trim_last_line: self.progress,
        });
    }

    /// Flush any buffered partial line.
    pub fn finish(mut self) {
        self.emit_pending();
    }
}

impl Write for LineSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf {
            if b == b'\n' || b == b'\r' {
                self.emit_pending();
            } else {
                self.pending.push(b);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineSink {
    fn drop(&mut self) {
        self.emit_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::update_channel;
    use std::collections::HashSet;

    fn collect_sink(level: MsgLevel, progress: bool, chunks: &[&[u8]]) -> Vec<Update> {
        let (tx, rx) = update_channel();
        let chunks: Vec<Vec<u8>> = chunks.iter().map(|c| c.to_vec()).collect();
        let writer = thread::spawn(move || {
            let mut sink = LineSink::new(tx, "dd", level, progress);
            for chunk in chunks {
                sink.write_all(&chunk).unwrap();
            }
            sink.finish();
        });
        let got = rx.iter().collect();
        writer.join().unwrap();
        got
    }

    #[test]
    fn test_sink_splits_and_prefixes() {
        let got = collect_sink(MsgLevel::Info, false, &[b"hello\nworld\n"]);
        let msgs: Vec<&str> = got.iter().map(|u| u.msg.as_str()).collect();
        assert_eq!(msgs, ["  dd hello\n", "  dd world\n"]);
        assert!(got.iter().all(|u| !u.trim_last_line));
    }

    #[test]
    fn test_sink_buffers_partial_lines() {
        let got = collect_sink(MsgLevel::Warning, false, &[b"par", b"tial\nta", b"il"]);
        let msgs: Vec<&str> = got.iter().map(|u| u.msg.as_str()).collect();
        assert_eq!(msgs, ["  dd partial\n", "  dd tail\n"]);
        assert!(got.iter().all(|u| u.level == MsgLevel::Warning));
    }

    #[test]
    fn test_sink_carriage_returns_and_short_lines() {
        let got = collect_sink(
            MsgLevel::Info,
            true,
            &[b"1048576 bytes copied\r2097152 bytes copied\r\n \nx\n"],
        );
        let msgs: Vec<&str> = got.iter().map(|u| u.msg.as_str()).collect();
        assert_eq!(
            msgs,
            ["  dd 1048576 bytes copied\n", "  dd 2097152 bytes copied\n"]
        );
        assert!(got.iter().all(|u| u.trim_last_line));
    }

    #[test]
    fn test_invocation_display_omits_stdin() {
        let inv = Invocation::new("cryptsetup")
            .args(["luksOpen", "--key-file", "-"])
            .stdin(Secret::new("hunter2"));
        assert_eq!(inv.to_string(), "cryptsetup luksOpen --key-file -");
        assert!(!format!("{:?}", inv).contains("hunter2"));
    }

    #[test]
    fn test_run_interactive_streams_both_pipes() {
        let (tx, rx) = update_channel();
        let worker = thread::spawn(move || {
            let inv = Invocation::new("sh").args(["-c", "echo out-line; echo err-line 1>&2"]);
            SystemRunner::new().run_interactive(&tx, "sh", &inv, OutputMode::Standard)
        });
        let got: Vec<Update> = rx.iter().collect();
        let status = worker.join().unwrap().unwrap();

        assert!(status.success());
        assert_eq!(got[0].level, MsgLevel::Command);
        assert!(got[0].msg.starts_with("sh -c"));
        let rest: HashSet<(String, MsgLevel)> =
            got[1..].iter().map(|u| (u.msg.clone(), u.level)).collect();
        let want: HashSet<(String, MsgLevel)> = [
            ("  sh out-line\n".to_string(), MsgLevel::Info),
            ("  sh err-line\n".to_string(), MsgLevel::Warning),
        ]
        .into_iter()
        .collect();
        assert_eq!(rest, want);
    }

    #[test]
    fn test_run_reports_nonzero_exit() {
        let (tx, rx) = update_channel();
        let worker = thread::spawn(move || {
            let inv = Invocation::new("sh").args(["-c", "exit 3"]);
            SystemRunner::new().run(&tx, "sh", &inv, OutputMode::Standard)
        });
        let _: Vec<Update> = rx.iter().collect();
        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(err, InstallError::CommandFailed { code: Some(3), .. }));
    }

    #[test]
    fn test_run_captured_feeds_stdin() {
        let inv = Invocation::new("cat").stdin(Secret::new("s3cret"));
        let out = SystemRunner::new().run_captured(&inv).unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout, "s3cret");
    }

    #[test]
    fn test_spawn_failure() {
        let inv = Invocation::new("/nonexistent/twlinst-tool");
        let err = SystemRunner::new().run_captured(&inv).unwrap_err();
        assert!(matches!(err, InstallError::CommandSpawn { .. }));
    }

    #[test]
    fn test_captured_failure_carries_stderr() {
        let inv = Invocation::new("sh").args(["-c", "echo bad input 1>&2; exit 1"]);
        let out = SystemRunner::new().run_captured(&inv).unwrap();
        let err = out.ensure_success(&inv).unwrap_err();
        assert!(err.to_string().contains("bad input"));
    }
}
