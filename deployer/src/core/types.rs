//! Document and wire types shared by the resolver and the execution engine.
//!
//! Documents (applications, templates, frameworks, addons) are handed to the
//! core already parsed and are never mutated by it. Wire types (output entries,
//! checkpoints, progress events) keep the field names the surrounding tooling
//! already reads, including the historical `lastSuccessfull` spelling.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Literal substituted for any `{{ name }}` that has no value.
pub const NOT_DEFINED: &str = "NOT_DEFINED";

/// A parameter, output or default value: `string | number | boolean`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl Scalar {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Truthiness used by template `if` guards.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(flag) => *flag,
            Self::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
            Self::Text(text) => {
                let trimmed = text.trim();
                !(trimmed.is_empty()
                    || trimmed == NOT_DEFINED
                    || trimmed.eq_ignore_ascii_case("false")
                    || trimmed == "0")
            }
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Number(number) => write!(f, "{number}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

/// Name → value map. Ordered so flattened checkpoints are deterministic.
pub type Values = BTreeMap<String, Scalar>;

/// Where a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOn {
    /// The orchestrator's control host (`ve` or `host` in documents).
    Host,
    /// Inside the LXC container identified by `vm_id`.
    Container,
}

impl ExecuteOn {
    /// Parse the raw `execute_on` text. Unknown values return `None`; the
    /// engine halts on them instead of guessing.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ve" | "host" => Some(Self::Host),
            "container" | "lxc" => Some(Self::Container),
            _ => None,
        }
    }
}

/// Parameter value type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Number,
    Boolean,
    Enum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Scalar>,
    #[serde(rename = "enumValues", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Scalar>,
    /// Template the parameter came from, for grouping in operator prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub advanced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Parameter {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: ParameterType::String,
            required: false,
            secure: false,
            default: None,
            enum_values: Vec::new(),
            template: None,
            advanced: false,
            description: None,
        }
    }
}

/// A declared output id: either `"id"` or `{ "id": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeclaredOutput {
    Bare(String),
    Detailed { id: String },
}

/// One step of a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Shared code prepended to `script` before it is sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_on: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<DeclaredOutput>,
}

/// The single body a command carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBody<'a> {
    Inline(&'a str),
    Script {
        path: &'a str,
        library: Option<&'a str>,
    },
    Template(&'a str),
}

impl Command {
    /// Returns the body, or `None` unless exactly one of `command`, `script`
    /// and `template` is set.
    pub fn body(&self) -> Option<CommandBody<'_>> {
        match (&self.command, &self.script, &self.template) {
            (Some(text), None, None) => Some(CommandBody::Inline(text)),
            (None, Some(path), None) => Some(CommandBody::Script {
                path,
                library: self.library.as_deref(),
            }),
            (None, None, Some(name)) => Some(CommandBody::Template(name)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_on: Option<String>,
    /// Parameter id that must be truthy for the template's commands to run.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub outputs: Vec<DeclaredOutput>,
    #[serde(default)]
    pub commands: Vec<Command>,
}

/// A reference to a template inside a phase list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateRef {
    Name(String),
    Anchored {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<String>,
    },
}

impl TemplateRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Anchored { name, .. } => name,
        }
    }

    /// Drops any anchor, keeping only the name.
    pub fn bare(&self) -> Self {
        Self::Name(self.name().to_string())
    }
}

impl From<&str> for TemplateRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// Task types an application may define a phase for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Installation,
    Backup,
    Restore,
    Uninstall,
    Update,
    Upgrade,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installation => "installation",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Uninstall => "uninstall",
            Self::Update => "update",
            Self::Upgrade => "upgrade",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "installation" | "install" => Ok(Self::Installation),
            "backup" => Ok(Self::Backup),
            "restore" => Ok(Self::Restore),
            "uninstall" => Ok(Self::Uninstall),
            "update" => Ok(Self::Update),
            "upgrade" => Ok(Self::Upgrade),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

/// Phase stage within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreStart,
    Main,
    PostStart,
}

impl Stage {
    pub const ALL: [Self; 3] = [Self::PreStart, Self::Main, Self::PostStart];
}

/// A task's template lists, split by stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPhases {
    #[serde(default)]
    pub pre_start: Vec<TemplateRef>,
    #[serde(default, alias = "default")]
    pub commands: Vec<TemplateRef>,
    #[serde(default)]
    pub post_start: Vec<TemplateRef>,
}

impl TaskPhases {
    pub fn stage(&self, stage: Stage) -> &[TemplateRef] {
        match stage {
            Stage::PreStart => &self.pre_start,
            Stage::Main => &self.commands,
            Stage::PostStart => &self.post_start,
        }
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut Vec<TemplateRef> {
        match stage {
            Stage::PreStart => &mut self.pre_start,
            Stage::Main => &mut self.commands,
            Stage::PostStart => &mut self.post_start,
        }
    }
}

/// Application-level value or default for a parameter id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl Property {
    /// `value` wins over `default`.
    pub fn effective_default(&self) -> Option<&Scalar> {
        self.value.as_ref().or(self.default.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Filled in from the document location when the file omits it.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    /// Framework family the application was instantiated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub properties: Vec<Property>,
    // Phases stay raw so a malformed phase can be told apart from an absent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<serde_json::Value>,
}

impl Application {
    pub fn phase(&self, task: TaskType) -> Option<&serde_json::Value> {
        match task {
            TaskType::Installation => self.installation.as_ref(),
            TaskType::Backup => self.backup.as_ref(),
            TaskType::Restore => self.restore.as_ref(),
            TaskType::Uninstall => self.uninstall.as_ref(),
            TaskType::Update => self.update.as_ref(),
            TaskType::Upgrade => self.upgrade.as_ref(),
        }
    }
}

/// Framework property: a parameter id plus flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameworkProperty {
    Bare(String),
    Flagged {
        id: String,
        /// When set, the supplied value becomes a default instead of a fixed value.
        #[serde(default)]
        default: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        required: Option<bool>,
    },
}

impl FrameworkProperty {
    pub fn id(&self) -> &str {
        match self {
            Self::Bare(id) | Self::Flagged { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framework {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub extends: String,
    #[serde(default)]
    pub properties: Vec<FrameworkProperty>,
}

/// Optional feature that contributes parameters and templates to an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addon {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub installation: TaskPhases,
}

/// One entry of a remote command's stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Scalar>,
}

/// Flattened map entry inside a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: Scalar,
}

/// Minimal state needed to resume a halted run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<u64>,
    /// Index of the last command that completed; commands at or below it are done.
    #[serde(rename = "lastSuccessfull", default, skip_serializing_if = "Option::is_none")]
    pub last_successful: Option<usize>,
    #[serde(default)]
    pub inputs: Vec<NameValue>,
    #[serde(default)]
    pub outputs: Vec<NameValue>,
    #[serde(default)]
    pub defaults: Vec<NameValue>,
}

impl RestartInfo {
    /// First command index a resume should execute.
    pub fn resume_index(&self) -> usize {
        self.last_successful.map_or(0, |index| index.saturating_add(1))
    }
}

/// Where a parameter's effective value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceSource {
    Missing,
    Default,
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterTrace {
    pub id: String,
    pub source: TraceSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Per-command progress report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub command: String,
    #[serde(rename = "commandtext", default, skip_serializing_if = "Option::is_none")]
    pub command_text: Option<String>,
    /// Raw stdout, `"OK"` for a silent success, `"skipped"` for a guarded-out command.
    pub result: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    pub execute_on: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on the last event of a run, whether it completed or halted.
    #[serde(default)]
    pub finished: bool,
}
