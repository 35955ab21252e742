use std::cell::RefCell;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::log_sanitize::sanitize_log_line;

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Build from an argv-style list (`["make", "all"]`).
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let Some((program, rest)) = argv.split_first() else {
            return Err(Error::msg("command is empty"));
        };
        if program.trim().is_empty() {
            return Err(Error::msg("command program is empty"));
        }
        Ok(Self::new(program.clone()).args(rest.iter().cloned()))
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        if let Some(cwd) = &self.cwd {
            write!(f, " (in {})", cwd.display())?;
        }
        Ok(())
    }
}

/// Runs external programs. Blocks until the program exits; any non-success
/// (spawn error or non-zero status) is an `Err`.
pub trait Executor {
    fn run(&self, cmd: &CommandSpec, ctx: &ExecCtx) -> Result<()>;
}

/// Spawns real processes, streaming their output into the run log line by line.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostExecutor;

impl Executor for HostExecutor {
    fn run(&self, cmd: &CommandSpec, ctx: &ExecCtx) -> Result<()> {
        tracing::debug!(command = %cmd, "spawning");
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        command.envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn {}: {e}", cmd.program)))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_lines(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_lines(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                ctx.log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait for {} failed: {e}", cmd.program)))?;
        if !status.success() {
            return Err(Error::msg(format!("`{cmd}` exited with {status}")));
        }
        Ok(())
    }
}

fn read_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    let mut r = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match r.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).is_err() {
                    break;
                }
            }
        }
    }
}

type FailWhen = Box<dyn Fn(&CommandSpec) -> bool>;

/// Records every command instead of running it. Commands matching a
/// registered predicate fail.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: RefCell<Vec<CommandSpec>>,
    fail_when: Vec<FailWhen>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_when(mut self, pred: impl Fn(&CommandSpec) -> bool + 'static) -> Self {
        self.fail_when.push(Box::new(pred));
        self
    }

    /// Fail any command whose working directory is `dir`.
    pub fn fail_in(self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.fail_when(move |cmd| cmd.cwd.as_deref() == Some(dir.as_path()))
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    pub fn working_dirs(&self) -> Vec<PathBuf> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| c.cwd.clone())
            .collect()
    }
}

impl Executor for RecordingExecutor {
    fn run(&self, cmd: &CommandSpec, ctx: &ExecCtx) -> Result<()> {
        self.calls.borrow_mut().push(cmd.clone());
        ctx.log(&format!("EXEC: {cmd}"));
        if self.fail_when.iter().any(|pred| pred(cmd)) {
            return Err(Error::msg(format!("`{cmd}` exited with exit status: 2")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::executor::MemorySink;

    fn ctx_with_sink() -> (ExecCtx, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (ExecCtx::new(false, sink.clone()), sink)
    }

    #[test]
    fn from_argv_splits_program_and_args() {
        let argv = vec!["make".to_string(), "-j4".to_string(), "all".to_string()];
        let cmd = CommandSpec::from_argv(&argv).expect("argv");
        assert_eq!(cmd.program, "make");
        assert_eq!(cmd.args, vec!["-j4", "all"]);
        assert!(CommandSpec::from_argv(&[]).is_err());
    }

    #[test]
    fn display_includes_working_dir() {
        let cmd = CommandSpec::new("make").arg("build").current_dir("src/kernel");
        assert_eq!(cmd.to_string(), "make build (in src/kernel)");
    }

    #[test]
    fn recording_executor_fails_only_matching_dirs() {
        let (ctx, _) = ctx_with_sink();
        let exec = RecordingExecutor::new().fail_in("/src/b");
        let ok = CommandSpec::new("make").current_dir("/src/a");
        let bad = CommandSpec::new("make").current_dir("/src/b");
        assert!(exec.run(&ok, &ctx).is_ok());
        assert!(exec.run(&bad, &ctx).is_err());
        assert_eq!(exec.calls().len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn host_executor_streams_output_and_honors_cwd() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (ctx, sink) = ctx_with_sink();
        let cmd = CommandSpec::new("sh")
            .args(["-c", "pwd; echo done 1>&2"])
            .current_dir(tmp.path());
        HostExecutor.run(&cmd, &ctx).expect("sh runs");

        let lines = sink.log_lines();
        let canonical = tmp.path().canonicalize().expect("canonical");
        assert!(
            lines
                .iter()
                .any(|l| std::path::Path::new(l).canonicalize().ok() == Some(canonical.clone())),
            "unexpected lines: {lines:?}"
        );
        assert!(lines.iter().any(|l| l == "done"));
    }

    #[cfg(unix)]
    #[test]
    fn host_executor_reports_non_zero_exit() {
        let (ctx, _) = ctx_with_sink();
        let cmd = CommandSpec::new("sh").args(["-c", "exit 3"]);
        let err = HostExecutor.run(&cmd, &ctx).unwrap_err().to_string();
        assert!(err.contains("exited with"), "unexpected err: {err}");
    }

    #[test]
    fn host_executor_reports_missing_program() {
        let (ctx, _) = ctx_with_sink();
        let cmd = CommandSpec::new("definitely-not-a-real-program-4711");
        let err = HostExecutor.run(&cmd, &ctx).unwrap_err().to_string();
        assert!(err.contains("failed to spawn"), "unexpected err: {err}");
    }
}
