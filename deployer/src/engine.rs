//! Resumable, strictly sequential command execution.
//!
//! The engine walks a resolved command list with a single index. Every
//! command is substituted, dispatched, and its stdout checked against the
//! outputs contract; success advances the index and yields a checkpoint, any
//! failure halts the walk. Halts are reported through the [`ProgressSink`]
//! and the returned [`RunReport`], never as an `Err`.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::application::{DocumentSource, PlannedCommand};
use crate::core::context::ResolutionContext;
use crate::core::error::{ConfigurationError, DeployError, DocumentKind, ExecutionError};
use crate::core::outputs::parse_outputs;
use crate::core::types::{CommandBody, ExecuteOn, ProgressEvent, RestartInfo, Scalar, Values};
use crate::core::variables::{VariableResolver, has_markers};
use crate::io::process::ProcessOutput;
use crate::io::remote::{CommandRunner, RemoteRequest, Target};

const DEFAULT_INTERPRETER: &str = "sh";
const SKIPPED: &str = "skipped";
const SILENT_SUCCESS: &str = "OK";

/// Receives progress as the run advances.
pub trait ProgressSink {
    fn event(&mut self, event: &ProgressEvent);

    /// Called after every processed command with the new checkpoint.
    fn checkpoint(&mut self, _checkpoint: &RestartInfo) {}
}

impl ProgressSink for Vec<ProgressEvent> {
    fn event(&mut self, event: &ProgressEvent) {
        self.push(event.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Halted { index: usize, error: DeployError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub status: RunStatus,
    /// Latest checkpoint: the last one produced by this run, otherwise the
    /// checkpoint the run was resumed from.
    pub checkpoint: Option<RestartInfo>,
    /// Context after the last processed command.
    pub context: ResolutionContext,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

pub struct ExecutionEngine<'a, S: DocumentSource + ?Sized, R: CommandRunner> {
    documents: &'a S,
    runner: R,
    timeout: Duration,
}

/// A command that was dispatched and accepted.
struct Completed {
    context: ResolutionContext,
    command_text: String,
    target: Target,
    output: ProcessOutput,
}

/// Why and where a command halted, with whatever was captured.
struct Halt {
    error: DeployError,
    command_text: Option<String>,
    execute_on: String,
    output: Option<ProcessOutput>,
}

impl Halt {
    fn before_dispatch(error: impl Into<DeployError>, planned: &PlannedCommand) -> Self {
        Self {
            error: error.into(),
            command_text: None,
            execute_on: planned.command.execute_on.clone().unwrap_or_default(),
            output: None,
        }
    }
}

impl<'a, S: DocumentSource + ?Sized, R: CommandRunner> ExecutionEngine<'a, S, R> {
    pub fn new(documents: &'a S, runner: R, timeout: Duration) -> Self {
        Self {
            documents,
            runner,
            timeout,
        }
    }

    /// Run `commands` from the start with `initial`, or from
    /// `resume.lastSuccessfull + 1` with the checkpoint's values replacing
    /// `initial` entirely.
    #[instrument(skip_all, fields(commands = commands.len(), resume = resume.is_some()))]
    pub fn run(
        &self,
        commands: &[PlannedCommand],
        initial: &ResolutionContext,
        resume: Option<&RestartInfo>,
        sink: &mut dyn ProgressSink,
    ) -> RunReport {
        let (mut context, start) = match resume {
            Some(checkpoint) => (
                ResolutionContext::from_checkpoint(checkpoint),
                checkpoint.resume_index(),
            ),
            None => (initial.clone(), 0),
        };
        let mut latest = resume.cloned();
        info!(start, "run starting");

        let last = commands.len().saturating_sub(1);
        for (index, planned) in commands.iter().enumerate().skip(start) {
            let name = planned.command.name.as_str();

            if let Some(guard) = failing_guard(planned, &context) {
                debug!(index, command = name, guard, "guard is falsy; skipping");
                let checkpoint = context.checkpoint(index);
                sink.event(&ProgressEvent {
                    command: name.to_string(),
                    command_text: None,
                    result: SKIPPED.to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                    execute_on: planned.command.execute_on.clone().unwrap_or_default(),
                    index,
                    error: None,
                    finished: index == last,
                });
                sink.checkpoint(&checkpoint);
                latest = Some(checkpoint);
                continue;
            }

            match self.execute(planned, &context) {
                Ok(done) => {
                    context = done.context;
                    let checkpoint = context.checkpoint(index);
                    let stdout = done.output.stdout.trim();
                    sink.event(&ProgressEvent {
                        command: name.to_string(),
                        command_text: Some(done.command_text),
                        result: if stdout.is_empty() {
                            SILENT_SUCCESS.to_string()
                        } else {
                            stdout.to_string()
                        },
                        stderr: done.output.stderr,
                        exit_code: done.output.exit_code.unwrap_or(0),
                        execute_on: done.target.label().to_string(),
                        index,
                        error: None,
                        finished: index == last,
                    });
                    sink.checkpoint(&checkpoint);
                    latest = Some(checkpoint);
                }
                Err(halt) => {
                    warn!(index, command = name, error = %halt.error, "run halted");
                    let (result, stderr) = halt
                        .output
                        .map(|out| (out.stdout, out.stderr))
                        .unwrap_or_default();
                    sink.event(&ProgressEvent {
                        command: name.to_string(),
                        command_text: halt.command_text,
                        result,
                        stderr,
                        exit_code: halt.error.exit_code(),
                        execute_on: halt.execute_on,
                        index,
                        error: Some(halt.error.to_string()),
                        finished: true,
                    });
                    return RunReport {
                        status: RunStatus::Halted {
                            index,
                            error: halt.error,
                        },
                        checkpoint: latest,
                        context,
                    };
                }
            }
        }

        info!("run completed");
        RunReport {
            status: RunStatus::Completed,
            checkpoint: latest,
            context,
        }
    }

    fn execute(
        &self,
        planned: &PlannedCommand,
        context: &ResolutionContext,
    ) -> Result<Completed, Halt> {
        let command = &planned.command;
        let expanded = VariableResolver::new(context).expand_base64_payloads(&Values::new());
        let resolver = VariableResolver::new(&expanded);
        let empty = Values::new();

        let (interpreter, body, command_text) = match command.body() {
            Some(CommandBody::Inline(text)) => {
                let resolved = resolver.resolve(text, &empty);
                (DEFAULT_INTERPRETER.to_string(), resolved.clone(), resolved)
            }
            Some(CommandBody::Script { path, library }) => {
                let path = resolver
                    .resolve_strict(path, &empty)
                    .map_err(|err| Halt::before_dispatch(err, planned))?;
                let script = self.load_script(&path, planned)?;
                let interpreter = interpreter_for(&script);
                let mut body = String::new();
                if let Some(library) = library {
                    let library = resolver
                        .resolve_strict(library, &empty)
                        .map_err(|err| Halt::before_dispatch(err, planned))?;
                    let contents = self.load_script(&library, planned)?;
                    if has_markers(&contents) {
                        return Err(Halt::before_dispatch(
                            ConfigurationError::LibraryHasVariables { library },
                            planned,
                        ));
                    }
                    body.push_str(&contents);
                    if !contents.ends_with('\n') {
                        body.push('\n');
                    }
                }
                body.push_str(&resolver.resolve(&script, &empty));
                (interpreter, body, path)
            }
            Some(CommandBody::Template(name)) => {
                return Err(Halt::before_dispatch(
                    ExecutionError::Unrunnable {
                        command: command.name.clone(),
                        reason: format!("template reference '{name}' was not expanded"),
                    },
                    planned,
                ));
            }
            None => {
                return Err(Halt::before_dispatch(
                    ExecutionError::Unrunnable {
                        command: command.name.clone(),
                        reason: "exactly one of command, script or template must be set"
                            .to_string(),
                    },
                    planned,
                ));
            }
        };

        let target = resolve_target(&command.name, command.execute_on.as_deref(), context)
            .map_err(|err| Halt {
                command_text: Some(command_text.clone()),
                ..Halt::before_dispatch(err, planned)
            })?;

        debug!(
            command = %command.name,
            target = target.label(),
            interpreter = %interpreter,
            "dispatching command"
        );
        let output = self
            .runner
            .run(&RemoteRequest {
                target,
                interpreter: &interpreter,
                input: &body,
                timeout: self.timeout,
            })
            .map_err(|err| Halt {
                error: ExecutionError::Spawn {
                    command: command.name.clone(),
                    reason: format!("{err:#}"),
                }
                .into(),
                command_text: Some(command_text.clone()),
                execute_on: target.label().to_string(),
                output: None,
            })?;

        let halt_with = |error: DeployError, output: ProcessOutput| Halt {
            error,
            command_text: Some(command_text.clone()),
            execute_on: target.label().to_string(),
            output: Some(output),
        };

        if output.timed_out {
            let error = ExecutionError::Timeout {
                command: command.name.clone(),
                secs: self.timeout.as_secs(),
            };
            return Err(halt_with(error.into(), output));
        }
        if output.exit_code != Some(0) {
            let error = ExecutionError::NonZeroExit {
                command: command.name.clone(),
                code: output.exit_code,
                stderr: output.stderr.clone(),
            };
            return Err(halt_with(error.into(), output));
        }
        if output.truncated > 0 {
            let error = ExecutionError::OutputTruncated {
                command: command.name.clone(),
                dropped: output.truncated,
            };
            return Err(halt_with(error.into(), output));
        }
        let entries = match parse_outputs(&command.name, &output.stdout) {
            Ok(entries) => entries,
            Err(error) => return Err(halt_with(error.into(), output)),
        };
        debug!(command = %command.name, entries = entries.len(), "outputs accepted");

        Ok(Completed {
            context: context.with_output_entries(&entries),
            command_text,
            target,
            output,
        })
    }

    fn load_script(&self, path: &str, planned: &PlannedCommand) -> Result<String, Halt> {
        match self.documents.script(path) {
            Ok(Some(contents)) => Ok(contents),
            Ok(None) => Err(Halt::before_dispatch(
                ConfigurationError::NotFound {
                    kind: DocumentKind::Script,
                    id: path.to_string(),
                },
                planned,
            )),
            Err(error) => Err(Halt::before_dispatch(error, planned)),
        }
    }
}

/// First guard id whose live value is absent or falsy.
fn failing_guard<'p>(planned: &'p PlannedCommand, context: &ResolutionContext) -> Option<&'p str> {
    planned
        .guards
        .iter()
        .find(|guard| {
            !VariableResolver::new(context)
                .value(guard)
                .is_some_and(Scalar::is_truthy)
        })
        .map(String::as_str)
}

fn resolve_target(
    command: &str,
    execute_on: Option<&str>,
    context: &ResolutionContext,
) -> Result<Target, ExecutionError> {
    match execute_on.and_then(ExecuteOn::parse) {
        Some(ExecuteOn::Host) => Ok(Target::Host),
        Some(ExecuteOn::Container) => context
            .vm_id()
            .map(|vm_id| Target::Container { vm_id })
            .ok_or_else(|| ExecutionError::MissingVmId {
                command: command.to_string(),
            }),
        None => Err(ExecutionError::UnknownTarget {
            command: command.to_string(),
            execute_on: execute_on.map(str::to_string),
        }),
    }
}

/// Interpreter named by the script's shebang, or `sh` without one.
/// `#!/usr/bin/env python3` yields `python3`; `#!/bin/bash -e` yields `/bin/bash -e`.
pub fn interpreter_for(script: &str) -> String {
    let Some(line) = script.lines().next().and_then(|line| line.strip_prefix("#!")) else {
        return DEFAULT_INTERPRETER.to_string();
    };
    let mut parts = line.split_whitespace();
    let Some(program) = parts.next() else {
        return DEFAULT_INTERPRETER.to_string();
    };
    let rest: Vec<&str> = if program == "env" || program.ends_with("/env") {
        parts.skip_while(|arg| arg.starts_with('-')).collect()
    } else {
        std::iter::once(program).chain(parts).collect()
    };
    if rest.is_empty() {
        DEFAULT_INTERPRETER.to_string()
    } else {
        rest.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Command, Scalar, Stage};
    use crate::test_support::{MemoryDocuments, ScriptedRunner};

    fn planned(name: &str, execute_on: &str, text: &str) -> PlannedCommand {
        PlannedCommand {
            stage: Stage::Main,
            template: format!("{name}.json"),
            guards: Vec::new(),
            command: Command {
                name: name.to_string(),
                command: Some(text.to_string()),
                execute_on: Some(execute_on.to_string()),
                ..Command::default()
            },
        }
    }

    fn inputs(pairs: &[(&str, &str)]) -> ResolutionContext {
        ResolutionContext::new(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), Scalar::text(*v)))
                .collect(),
            Values::new(),
            Values::new(),
        )
    }

    #[test]
    fn shebang_selects_interpreter() {
        assert_eq!(
            interpreter_for("#!/usr/bin/env python3\nprint(1)"),
            "python3"
        );
        assert_eq!(
            interpreter_for("#!/usr/bin/env -S python3 -u\n"),
            "python3 -u"
        );
        assert_eq!(interpreter_for("#!/bin/bash\n"), "/bin/bash");
        assert_eq!(interpreter_for("echo hi"), "sh");
        assert_eq!(interpreter_for(""), "sh");
    }

    #[test]
    fn inline_command_is_substituted_and_sent_on_stdin() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new().respond(0, r#"{"id":"ip","value":"10.0.0.5"}"#, "");
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let mut events: Vec<ProgressEvent> = Vec::new();

        let report = engine.run(
            &[planned("probe", "ve", "echo {{ hostname }}")],
            &inputs(&[("hostname", "web")]),
            None,
            &mut events,
        );

        assert!(report.is_completed());
        assert_eq!(report.context.outputs["ip"], Scalar::text("10.0.0.5"));
        let calls = runner.calls();
        assert_eq!(calls[0].input, "echo web");
        assert_eq!(calls[0].interpreter, "sh");
        assert_eq!(calls[0].target, Target::Host);
        assert_eq!(events[0].command_text.as_deref(), Some("echo web"));
        assert!(events[0].finished);
    }

    #[test]
    fn silent_success_reports_ok() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new().respond(0, "", "");
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let mut events: Vec<ProgressEvent> = Vec::new();
        let report = engine.run(
            &[planned("a", "ve", "true")],
            &inputs(&[]),
            None,
            &mut events,
        );
        assert!(report.is_completed());
        assert_eq!(events[0].result, "OK");
        assert_eq!(report.checkpoint.and_then(|c| c.last_successful), Some(0));
    }

    #[test]
    fn container_without_vm_id_halts_before_dispatch() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new();
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let mut events: Vec<ProgressEvent> = Vec::new();
        let report = engine.run(
            &[planned("inside", "container", "true")],
            &inputs(&[]),
            None,
            &mut events,
        );
        assert!(matches!(
            report.status,
            RunStatus::Halted {
                index: 0,
                error: DeployError::Execution(ExecutionError::MissingVmId { .. })
            }
        ));
        assert!(runner.calls().is_empty());
        assert!(events[0].finished);
        assert!(events[0].error.is_some());
        assert_eq!(report.checkpoint, None);
    }

    #[test]
    fn container_commands_use_vm_id_from_outputs() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new()
            .respond(0, r#"[{"id":"vm_id","value":"204"}]"#, "")
            .respond(0, "", "");
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let report = engine.run(
            &[planned("create", "ve", "pct create"), planned("inside", "container", "true")],
            &inputs(&[]),
            None,
            &mut Vec::<ProgressEvent>::new(),
        );
        assert!(report.is_completed());
        assert_eq!(runner.calls()[1].target, Target::Container { vm_id: 204 });
        assert_eq!(report.checkpoint.and_then(|c| c.vm_id), Some(204));
    }

    #[test]
    fn unknown_or_missing_target_halts() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new();
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let mut command = planned("x", "ve", "true");
        command.command.execute_on = None;
        let report = engine.run(
            &[command],
            &inputs(&[]),
            None,
            &mut Vec::<ProgressEvent>::new(),
        );
        assert!(matches!(
            report.status,
            RunStatus::Halted {
                error: DeployError::Execution(ExecutionError::UnknownTarget {
                    execute_on: None,
                    ..
                }),
                ..
            }
        ));
    }

    #[test]
    fn nonzero_exit_halts_even_with_valid_json() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new().respond(2, r#"{"id":"x","value":"1"}"#, "boom");
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let mut events: Vec<ProgressEvent> = Vec::new();
        let report = engine.run(
            &[planned("a", "ve", "false")],
            &inputs(&[]),
            None,
            &mut events,
        );
        assert!(!report.is_completed());
        assert!(!report.context.outputs.contains_key("x"));
        assert_eq!(events[0].exit_code, 2);
        assert_eq!(events[0].stderr, "boom");
    }

    #[test]
    fn timeout_halts_with_timeout_error() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new().time_out();
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let report = engine.run(
            &[planned("slow", "ve", "sleep 60")],
            &inputs(&[]),
            None,
            &mut Vec::<ProgressEvent>::new(),
        );
        assert!(matches!(
            report.status,
            RunStatus::Halted {
                error: DeployError::Execution(ExecutionError::Timeout { secs: 10, .. }),
                ..
            }
        ));
    }

    #[test]
    fn invalid_stdout_halts_with_validation_error() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new().respond(0, "[1, 2]", "");
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let mut events: Vec<ProgressEvent> = Vec::new();
        let report = engine.run(
            &[planned("a", "ve", "true")],
            &inputs(&[]),
            None,
            &mut events,
        );
        assert!(matches!(
            report.status,
            RunStatus::Halted {
                error: DeployError::Validation(_),
                ..
            }
        ));
        assert_eq!(events[0].result, "[1, 2]");
    }

    #[test]
    fn script_with_library_and_shebang() {
        let mut docs = MemoryDocuments::default();
        docs.add_script("lib/common.py", "def out(i, v):\n    print(i, v)");
        docs.add_script(
            "web/probe.py",
            "#!/usr/bin/env python3\nhost = \"{{ hostname }}\"\n",
        );
        let runner = ScriptedRunner::new().respond(0, "", "");
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let command = PlannedCommand {
            command: Command {
                name: "probe".to_string(),
                script: Some("{{ app }}/probe.py".to_string()),
                library: Some("lib/common.py".to_string()),
                execute_on: Some("ve".to_string()),
                ..Command::default()
            },
            ..planned("probe", "ve", "")
        };
        let mut events: Vec<ProgressEvent> = Vec::new();
        let report = engine.run(
            &[command],
            &inputs(&[("hostname", "web"), ("app", "web")]),
            None,
            &mut events,
        );
        assert!(report.is_completed(), "{:?}", report.status);
        let call = &runner.calls()[0];
        assert_eq!(call.interpreter, "python3");
        assert!(
            call.input
                .starts_with("def out(i, v):\n    print(i, v)\n#!/usr/bin/env python3")
        );
        assert!(call.input.contains("host = \"web\""));
        assert_eq!(events[0].command_text.as_deref(), Some("web/probe.py"));
    }

    #[test]
    fn library_with_markers_halts() {
        let mut docs = MemoryDocuments::default();
        docs.add_script("lib.sh", "X={{ x }}");
        docs.add_script("run.sh", "echo ok");
        let runner = ScriptedRunner::new();
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let command = PlannedCommand {
            command: Command {
                name: "run".to_string(),
                script: Some("run.sh".to_string()),
                library: Some("lib.sh".to_string()),
                execute_on: Some("ve".to_string()),
                ..Command::default()
            },
            ..planned("run", "ve", "")
        };
        let report = engine.run(
            &[command],
            &inputs(&[]),
            None,
            &mut Vec::<ProgressEvent>::new(),
        );
        assert!(matches!(
            report.status,
            RunStatus::Halted {
                error: DeployError::Configuration(_),
                ..
            }
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn undefined_script_reference_is_a_resolution_error() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new();
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let command = PlannedCommand {
            command: Command {
                name: "run".to_string(),
                script: Some("{{ missing }}.sh".to_string()),
                execute_on: Some("ve".to_string()),
                ..Command::default()
            },
            ..planned("run", "ve", "")
        };
        let report = engine.run(
            &[command],
            &inputs(&[]),
            None,
            &mut Vec::<ProgressEvent>::new(),
        );
        assert!(matches!(
            report.status,
            RunStatus::Halted {
                error: DeployError::Resolution(_),
                ..
            }
        ));
    }

    #[test]
    fn falsy_guard_skips_and_checkpoints() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new().respond(0, "", "");
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let mut guarded = planned("ssh", "ve", "apk add openssh");
        guarded.guards = vec!["enable_ssh".to_string()];
        let mut events: Vec<ProgressEvent> = Vec::new();
        let report = engine.run(
            &[guarded, planned("after", "ve", "true")],
            &inputs(&[("enable_ssh", "false")]),
            None,
            &mut events,
        );
        assert!(report.is_completed());
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(events[0].result, "skipped");
        assert_eq!(events[1].index, 1);
    }

    #[test]
    fn guard_sees_the_same_value_as_substitution() {
        let docs = MemoryDocuments::default();
        let mut guarded = planned("flagged", "ve", "echo flag={{ flag }}");
        guarded.guards = vec!["flag".to_string()];

        let mut context = inputs(&[("flag", "true")]);
        context.outputs.insert("flag".to_string(), Scalar::text("false"));
        let runner = ScriptedRunner::new();
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let mut events: Vec<ProgressEvent> = Vec::new();
        let report = engine.run(&[guarded.clone()], &context, None, &mut events);
        assert!(report.is_completed());
        assert!(runner.calls().is_empty());
        assert_eq!(events[0].result, "skipped");

        let mut context = inputs(&[("flag", "false")]);
        context.outputs.insert("flag".to_string(), Scalar::text("true"));
        let runner = ScriptedRunner::new().respond(0, "", "");
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let report = engine.run(&[guarded], &context, None, &mut Vec::<ProgressEvent>::new());
        assert!(report.is_completed());
        assert_eq!(runner.calls()[0].input, "echo flag=true");
    }

    #[test]
    fn truncated_stdout_halts_with_output_limit_error() {
        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new().respond_truncated(r#"[{"id":"a","va"#, 4096);
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let mut events: Vec<ProgressEvent> = Vec::new();
        let report = engine.run(
            &[planned("big", "ve", "cat big.json")],
            &inputs(&[]),
            None,
            &mut events,
        );
        assert!(matches!(
            report.status,
            RunStatus::Halted {
                error: DeployError::Execution(ExecutionError::OutputTruncated {
                    dropped: 4096,
                    ..
                }),
                ..
            }
        ));
        assert!(
            events[0]
                .error
                .as_deref()
                .is_some_and(|e| e.contains("output limit"))
        );
    }

    #[test]
    fn base64_payload_is_expanded_before_substitution() {
        use base64::Engine as _;
        use base64::engine::general_purpose::STANDARD;

        let docs = MemoryDocuments::default();
        let runner = ScriptedRunner::new().respond(0, "", "");
        let engine = ExecutionEngine::new(&docs, &runner, Duration::from_secs(10));
        let payload = STANDARD.encode("hostname: {{ hostname }}\n");
        let report = engine.run(
            &[planned("write", "ve", "echo {{ compose }}")],
            &inputs(&[("compose", &payload), ("hostname", "web")]),
            None,
            &mut Vec::<ProgressEvent>::new(),
        );
        assert!(report.is_completed());
        let expected = STANDARD.encode("hostname: web\n");
        assert_eq!(runner.calls()[0].input, format!("echo {expected}"));
        assert_eq!(
            report.context.inputs["compose"],
            Scalar::text(payload.as_str())
        );
    }
}
