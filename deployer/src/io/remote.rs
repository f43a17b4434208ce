//! Dispatching resolved command text to the control host or a container.
//!
//! The [`CommandRunner`] trait is the seam between the execution engine and
//! real processes. [`SshRunner`] is the production runner; tests use the
//! scripted runner in `test_support`.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior, context};
use tracing::{debug, instrument};

use crate::io::config::{DeployerConfig, TransportMode};
use crate::io::process::{ProcessOutput, run_with_timeout};

/// Where a command body is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Host,
    Container { vm_id: u64 },
}

impl Target {
    pub fn label(self) -> &'static str {
        match self {
            Self::Host => "ve",
            Self::Container { .. } => "container",
        }
    }
}

/// One synchronous remote invocation. `input` is the process stdin.
#[derive(Debug, Clone)]
pub struct RemoteRequest<'a> {
    pub target: Target,
    pub interpreter: &'a str,
    pub input: &'a str,
    pub timeout: Duration,
}

pub trait CommandRunner {
    /// Run the request to completion or timeout. `Err` only when the process
    /// could not be started.
    fn run(&self, request: &RemoteRequest<'_>) -> Result<ProcessOutput>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(&self, request: &RemoteRequest<'_>) -> Result<ProcessOutput> {
        (**self).run(request)
    }
}

/// Runs commands over `ssh` (or a local `sh` in local mode), entering
/// containers through the configured attach command.
///
/// A timeout kills the local process group. In local mode that stops the
/// command and everything it started. In ssh mode only the `ssh` client dies;
/// the remote side gets no signal and may keep running until it notices the
/// closed connection.
pub struct SshRunner {
    config: DeployerConfig,
    env: Environment<'static>,
}

impl SshRunner {
    pub fn new(config: DeployerConfig) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        let runner = Self { config, env };
        // Fail at startup, not on the first container command.
        runner
            .remote_line(Target::Container { vm_id: 100 }, "sh")
            .context("check container.attach template")?;
        Ok(runner)
    }

    /// Shell line run on the control host for `target`.
    pub fn remote_line(&self, target: Target, interpreter: &str) -> Result<String> {
        match target {
            Target::Host => Ok(interpreter.to_string()),
            Target::Container { vm_id } => self
                .env
                .render_str(
                    &self.config.container.attach,
                    context! { vm_id => vm_id, interpreter => interpreter },
                )
                .context("render container.attach"),
        }
    }

    /// The full process to spawn for `target`.
    pub fn build_command(&self, target: Target, interpreter: &str) -> Result<Command> {
        let line = self.remote_line(target, interpreter)?;
        let ssh = &self.config.ssh;
        let cmd = match ssh.mode {
            TransportMode::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            TransportMode::Ssh => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-o")
                    .arg("BatchMode=yes")
                    .arg("-o")
                    .arg(format!("ConnectTimeout={}", ssh.connect_timeout_secs))
                    .arg("-p")
                    .arg(ssh.port.to_string());
                if let Some(identity) = &ssh.identity_file {
                    cmd.arg("-i").arg(identity);
                }
                cmd.arg(format!("{}@{}", ssh.user, ssh.host)).arg(line);
                cmd
            }
        };
        Ok(cmd)
    }
}

impl CommandRunner for SshRunner {
    #[instrument(skip_all, fields(target = request.target.label()))]
    fn run(&self, request: &RemoteRequest<'_>) -> Result<ProcessOutput> {
        let cmd = self.build_command(request.target, request.interpreter)?;
        debug!(
            interpreter = request.interpreter,
            args = ?cmd.get_args().collect::<Vec<_>>(),
            "dispatching"
        );
        run_with_timeout(
            cmd,
            request.input.as_bytes(),
            request.timeout,
            self.config.output_limit_bytes,
        )
    }
}

/// Run a one-off shell snippet with the inspection timeout. The output is
/// returned as-is; no outputs contract applies.
pub fn inspect(
    runner: &dyn CommandRunner,
    config: &DeployerConfig,
    target: Target,
    script: &str,
) -> Result<ProcessOutput> {
    runner.run(&RemoteRequest {
        target,
        interpreter: "sh",
        input: script,
        timeout: config.timeouts.inspection(),
    })
}
