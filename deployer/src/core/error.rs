//! Closed error taxonomy for resolution and execution.
//!
//! Configuration errors are collected on a [`ConfigurationErrors`] accumulator
//! while the template graph is built so several problems can be reported at
//! once. Validation and execution errors end a run but are carried as data in
//! the terminal progress event, never thrown out of `run()`.

use std::fmt;

use thiserror::Error;

/// Document kinds a configuration error can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Application,
    Template,
    Framework,
    Addon,
    Script,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Application => "application",
            Self::Template => "template",
            Self::Framework => "framework",
            Self::Addon => "addon",
            Self::Script => "script",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: DocumentKind, id: String },
    #[error("application '{id}' extends missing application '{parent}'")]
    MissingParent { id: String, parent: String },
    #[error("template '{name}' referenced by '{referrer}' not found")]
    MissingTemplate { name: String, referrer: String },
    #[error("malformed {kind} '{id}': {reason}")]
    Malformed {
        kind: DocumentKind,
        id: String,
        reason: String,
    },
    #[error(
        "command '{command}' in template '{template}' must set exactly one of command, script or template"
    )]
    AmbiguousCommand { template: String, command: String },
    #[error("template reference cycle: {path}")]
    TemplateCycle { path: String },
    #[error("library '{library}' must not contain template variables")]
    LibraryHasVariables { library: String },
}

/// Accumulator for configuration problems found while resolving.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationErrors {
    errors: Vec<ConfigurationError>,
}

impl ConfigurationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ConfigurationError) {
        tracing::debug!(%error, "configuration error collected");
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigurationError> {
        self.errors.iter()
    }

    /// Consumes the accumulator, failing if anything was collected.
    pub fn into_result(self) -> Result<(), DeployError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DeployError::Configuration(self.errors))
        }
    }
}

/// Stdout of a remote command violates the outputs contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("command '{command}' printed invalid JSON: {reason}")]
    InvalidJson { command: String, reason: String },
    #[error("command '{command}' output violates the outputs schema: {}", .messages.join("; "))]
    Schema {
        command: String,
        messages: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("command '{command}' exited with status {code:?}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("command '{command}' could not be started: {reason}")]
    Spawn { command: String, reason: String },
    #[error("command '{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
    #[error("command '{command}' must run in a container but no vm_id is known")]
    MissingVmId { command: String },
    #[error("command '{command}' has unsupported execute_on {execute_on:?}")]
    UnknownTarget {
        command: String,
        execute_on: Option<String>,
    },
    #[error("command '{command}' exceeded the output limit ({dropped} bytes dropped)")]
    OutputTruncated { command: String, dropped: usize },
    #[error("command '{command}' has no body: {reason}")]
    Unrunnable { command: String, reason: String },
}

/// Strict resolution found identifiers without a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("undefined variables: {}", .names.join(", "))]
    Undefined { names: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployError {
    #[error("configuration errors:\n- {}", render_list(.0))]
    Configuration(Vec<ConfigurationError>),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl From<ConfigurationError> for DeployError {
    fn from(error: ConfigurationError) -> Self {
        Self::Configuration(vec![error])
    }
}

impl DeployError {
    /// Exit code to report in the terminal progress event.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Execution(ExecutionError::NonZeroExit { code, .. }) => code.unwrap_or(-1),
            Self::Execution(ExecutionError::Timeout { .. }) => 124,
            Self::Execution(_) | Self::Configuration(_) | Self::Resolution(_) => -1,
            Self::Validation(_) => 0,
        }
    }
}

fn render_list(errors: &[ConfigurationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n- ")
}
