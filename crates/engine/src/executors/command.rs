//! Command executor
//!
//! Runs a step's commands (or script) as child processes in their own
//! process group, pumping stdout/stderr into the node's sinks. Signals
//! are delivered to the whole group; cancellation hard-kills.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dagforge_common::error::{Error, Result};
use dagforge_common::signals::SIGKILL;
use dagforge_core::executor::{ExecCtx, Executor, OutputSink};
use dagforge_core::step::{Command, Step};

type SharedSink = Arc<Mutex<Option<OutputSink>>>;

/// Executor for shell commands and scripts
pub struct CommandExecutor {
    ctx: ExecCtx,
    step: Step,
    stdout: SharedSink,
    stderr: SharedSink,
    process_group: Mutex<Option<i32>>,
    last_exit: Mutex<Option<i32>>,
}

impl CommandExecutor {
    #[must_use]
    pub fn new(ctx: ExecCtx, step: Step) -> Self {
        Self {
            ctx,
            step,
            stdout: Arc::new(Mutex::new(None)),
            stderr: Arc::new(Mutex::new(None)),
            process_group: Mutex::new(None),
            last_exit: Mutex::new(None),
        }
    }

    fn build_script_command(&self, script_path: &std::path::Path) -> TokioCommand {
        let shell = self.ctx.effective_shell();
        let mut cmd = TokioCommand::new(shell);
        for arg in &self.ctx.shell_args {
            cmd.arg(arg);
        }
        cmd.arg(script_path);
        cmd
    }

    fn build_command(&self, command: &Command) -> Result<TokioCommand> {
        if !command.command.is_empty() {
            let mut cmd = TokioCommand::new(&command.command);
            cmd.args(&command.args);
            return Ok(cmd);
        }
        if !command.cmd_with_args.is_empty() {
            let shell = self.ctx.effective_shell();
            let mut cmd = TokioCommand::new(shell);
            if self.ctx.shell_args.is_empty() {
                cmd.arg("-c");
            } else {
                cmd.args(&self.ctx.shell_args);
            }
            cmd.arg(&command.cmd_with_args);
            return Ok(cmd);
        }
        Err(Error::Configuration(format!(
            "step {:?} has an empty command",
            self.step.name
        )))
    }

    fn configure(&self, cmd: &mut TokioCommand) {
        cmd.envs(self.ctx.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(dir) = &self.ctx.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
    }

    async fn run_one(&self, mut cmd: TokioCommand, cancel: &CancellationToken) -> Result<()> {
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Execution {
                code: 127,
                message: format!("spawn failed: {e}"),
            })?;

        if let Some(pid) = child.id() {
            *self.process_group.lock() = Some(pid as i32);
        }

        let out_pump = spawn_pump(child.stdout.take(), Arc::clone(&self.stdout));
        let err_pump = spawn_pump(child.stderr.take(), Arc::clone(&self.stderr));

        let status = tokio::select! {
            status = child.wait() => status.map_err(Error::Io)?,
            () = cancel.cancelled() => {
                let _ = self.kill(SIGKILL);
                let _ = child.wait().await;
                let _ = out_pump.await;
                let _ = err_pump.await;
                *self.process_group.lock() = None;
                return Err(Error::Cancelled("command execution cancelled".to_string()));
            }
        };

        let _ = out_pump.await;
        let _ = err_pump.await;
        *self.process_group.lock() = None;

        let code = exit_code_of(&status);
        *self.last_exit.lock() = Some(code);
        if code == 0 {
            Ok(())
        } else {
            Err(Error::Execution {
                code,
                message: format!("command exited with code {code}"),
            })
        }
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn spawn_pump(
    reader: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    sink: SharedSink,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut reader) = reader else { return };
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Some(writer) = sink.lock().as_mut() {
                        if writer.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
        if let Some(writer) = sink.lock().as_mut() {
            let _ = writer.flush();
        }
    })
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if !self.step.script.is_empty() {
            let mut script_file = tempfile::Builder::new()
                .prefix("dagforge-script-")
                .suffix(".sh")
                .tempfile()
                .map_err(Error::Io)?;
            script_file
                .write_all(self.step.script.as_bytes())
                .map_err(Error::Io)?;
            script_file.flush().map_err(Error::Io)?;

            let mut cmd = self.build_script_command(script_file.path());
            self.configure(&mut cmd);
            return self.run_one(cmd, &cancel).await;
        }

        if self.step.commands.is_empty() {
            return Err(Error::Configuration(format!(
                "step {:?} has neither commands nor a script",
                self.step.name
            )));
        }

        // Multiple commands run sequentially; the first failure stops the
        // sequence.
        for command in &self.step.commands {
            let mut cmd = self.build_command(command)?;
            self.configure(&mut cmd);
            self.run_one(cmd, &cancel).await?;
        }
        Ok(())
    }

    fn set_stdout(&mut self, writer: OutputSink) {
        *self.stdout.lock() = Some(writer);
    }

    fn set_stderr(&mut self, writer: OutputSink) {
        *self.stderr.lock() = Some(writer);
    }

    fn kill(&self, signal: i32) -> Result<()> {
        let Some(pgid) = *self.process_group.lock() else {
            return Ok(());
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let sig = Signal::try_from(signal)
                .map_err(|e| Error::Internal(format!("bad signal {signal}: {e}")))?;
            if let Err(err) = killpg(Pid::from_raw(pgid), sig) {
                debug!(pgid, signal, "killpg failed: {err}");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (pgid, signal);
        }
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        *self.last_exit.lock()
    }
}
