//! Orchestration: resolve a deploy request, then run it.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::core::application::{
    ApplicationMetadata, ApplicationResolver, DocumentSource, ResolvedApplication, TaskResolution,
};
use crate::core::context::ResolutionContext;
use crate::core::error::{ConfigurationError, ConfigurationErrors, DeployError, DocumentKind};
use crate::core::parameters::{
    ParameterResolution, apply_framework_overrides, missing_required, resolve_parameters,
    seed_context, unresolved,
};
use crate::core::types::{
    Parameter, ParameterType, ProgressEvent, RestartInfo, Scalar, TaskType, TraceSource, Values,
};
use crate::engine::{ExecutionEngine, ProgressSink, RunReport};
use crate::io::checkpoint::write_checkpoint;
use crate::io::config::DeployerConfig;
use crate::io::remote::CommandRunner;

const MASK: &str = "********";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub application: String,
    pub task: TaskType,
    pub addons: Vec<String>,
    pub inputs: Values,
}

/// Everything needed to start a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub application: ResolvedApplication,
    pub resolution: ParameterResolution,
    pub context: ResolutionContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    Ready(Plan),
    NotApplicable(ApplicationMetadata),
}

/// One row of the parameter listing shown to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterReport {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Scalar>,
    pub source: TraceSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub unresolved: bool,
}

impl Plan {
    pub fn unresolved(&self) -> Vec<&Parameter> {
        unresolved(&self.application.parameters, &self.resolution)
    }

    pub fn missing_required(&self) -> Vec<&Parameter> {
        missing_required(&self.application.parameters, &self.resolution)
    }

    /// Parameter listing with secure values masked.
    pub fn parameter_report(&self) -> Vec<ParameterReport> {
        let open: Vec<&str> = self
            .unresolved()
            .into_iter()
            .map(|parameter| parameter.id.as_str())
            .collect();
        self.application
            .parameters
            .iter()
            .map(|parameter| {
                let value = self.resolution.values.get(&parameter.id).map(|value| {
                    if parameter.secure {
                        Scalar::text(MASK)
                    } else {
                        value.clone()
                    }
                });
                ParameterReport {
                    id: parameter.id.clone(),
                    name: parameter.name.clone(),
                    kind: parameter.kind,
                    required: parameter.required,
                    value,
                    source: self
                        .resolution
                        .source(&parameter.id)
                        .unwrap_or(TraceSource::Missing),
                    template: parameter.template.clone(),
                    unresolved: open.contains(&parameter.id.as_str()),
                }
            })
            .collect()
    }
}

/// Resolve the application, apply framework overrides, and resolve
/// parameters. Any configuration error aborts before anything runs.
#[instrument(skip_all, fields(app = %request.application, task = %request.task))]
pub fn prepare<S: DocumentSource + ?Sized>(
    documents: &S,
    request: &DeployRequest,
    prior_outputs: &Values,
) -> Result<Prepared, DeployError> {
    let mut errors = ConfigurationErrors::new();
    let resolution = ApplicationResolver::new(documents).resolve(
        &request.application,
        request.task,
        &request.addons,
        &mut errors,
    );
    errors.into_result()?;
    let resolution = resolution.ok_or_else(|| ConfigurationError::NotFound {
        kind: DocumentKind::Application,
        id: request.application.clone(),
    })?;

    let mut application = match resolution {
        TaskResolution::NotApplicable { metadata } => return Ok(Prepared::NotApplicable(metadata)),
        TaskResolution::Applicable(application) => application,
    };
    application.parameters = apply_framework_overrides(
        &application.parameters,
        application.metadata.framework.as_deref(),
        &application.metadata.id,
    );
    let resolution = resolve_parameters(&application.parameters, &request.inputs, prior_outputs);
    let context = seed_context(&application.parameters, &request.inputs, prior_outputs);
    info!(
        commands = application.commands.len(),
        parameters = application.parameters.len(),
        "plan prepared"
    );
    Ok(Prepared::Ready(Plan {
        application,
        resolution,
        context,
    }))
}

/// Run a prepared plan, fresh or resumed from `resume`.
pub fn execute<S: DocumentSource + ?Sized, R: CommandRunner>(
    documents: &S,
    runner: R,
    config: &DeployerConfig,
    plan: &Plan,
    resume: Option<&RestartInfo>,
    sink: &mut dyn ProgressSink,
) -> RunReport {
    let engine = ExecutionEngine::new(documents, runner, config.timeouts.command());
    engine.run(&plan.application.commands, &plan.context, resume, sink)
}

/// Default checkpoint location for an application and task.
pub fn checkpoint_path(root: &Path, application: &str, task: TaskType) -> PathBuf {
    root.join("state")
        .join(format!("{application}.{task}.checkpoint.json"))
}

/// Prints events as JSON lines and rewrites the checkpoint file after every
/// processed command.
pub struct JsonLinesSink<W: Write> {
    out: W,
    checkpoint_path: PathBuf,
    checkpoint_failures: usize,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W, checkpoint_path: PathBuf) -> Self {
        Self {
            out,
            checkpoint_path,
            checkpoint_failures: 0,
        }
    }

    /// Number of checkpoints that could not be written.
    pub fn checkpoint_failures(&self) -> usize {
        self.checkpoint_failures
    }
}

impl<W: Write> ProgressSink for JsonLinesSink<W> {
    fn event(&mut self, event: &ProgressEvent) {
        let written = serde_json::to_string(event)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(self.out, "{line}"));
        if let Err(err) = written {
            warn!(err = %err, index = event.index, "failed to write progress event");
        }
    }

    fn checkpoint(&mut self, checkpoint: &RestartInfo) {
        if let Err(err) = write_checkpoint(&self.checkpoint_path, checkpoint) {
            let message = format!("{err:#}");
            error!(err = %message, "failed to persist checkpoint");
            self.checkpoint_failures += 1;
        }
    }
}
