//! Test-only document store, command runner, and progress sink.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};

use anyhow::{Result, anyhow};

use crate::core::application::DocumentSource;
use crate::core::error::ConfigurationError;
use crate::core::types::{Addon, Application, Framework, ProgressEvent, RestartInfo, Template};
use crate::engine::ProgressSink;
use crate::io::process::ProcessOutput;
use crate::io::remote::{CommandRunner, RemoteRequest, Target};

/// In-memory [`DocumentSource`] keyed by id, name, or script path.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocuments {
    applications: BTreeMap<String, Application>,
    templates: BTreeMap<String, Template>,
    frameworks: BTreeMap<String, Framework>,
    addons: BTreeMap<String, Addon>,
    scripts: BTreeMap<String, String>,
}

impl MemoryDocuments {
    pub fn add_application(&mut self, application: Application) -> &mut Self {
        self.applications
            .insert(application.id.clone(), application);
        self
    }

    pub fn add_template(&mut self, template: Template) -> &mut Self {
        self.templates.insert(template.name.clone(), template);
        self
    }

    pub fn add_framework(&mut self, framework: Framework) -> &mut Self {
        self.frameworks.insert(framework.id.clone(), framework);
        self
    }

    pub fn add_addon(&mut self, addon: Addon) -> &mut Self {
        self.addons.insert(addon.id.clone(), addon);
        self
    }

    pub fn add_script(&mut self, path: &str, contents: &str) -> &mut Self {
        self.scripts.insert(path.to_string(), contents.to_string());
        self
    }
}

impl DocumentSource for MemoryDocuments {
    fn application(&self, id: &str) -> Result<Option<Application>, ConfigurationError> {
        Ok(self.applications.get(id).cloned())
    }

    fn template(&self, name: &str) -> Result<Option<Template>, ConfigurationError> {
        Ok(self.templates.get(name).cloned())
    }

    fn framework(&self, id: &str) -> Result<Option<Framework>, ConfigurationError> {
        Ok(self.frameworks.get(id).cloned())
    }

    fn addon(&self, id: &str) -> Result<Option<Addon>, ConfigurationError> {
        Ok(self.addons.get(id).cloned())
    }

    fn script(&self, path: &str) -> Result<Option<String>, ConfigurationError> {
        Ok(self.scripts.get(path).cloned())
    }
}

/// A request as the scripted runner saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub target: Target,
    pub interpreter: String,
    pub input: String,
}

/// [`CommandRunner`] that replays queued responses in order and records
/// every request. Running out of responses is a spawn failure.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: RefCell<VecDeque<ProcessOutput>>,
    calls: RefCell<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.responses.borrow_mut().push_back(ProcessOutput {
            exit_code: Some(exit_code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            truncated: 0,
            timed_out: false,
        });
        self
    }

    /// Exit 0 with `stdout` cut off after `dropped` more bytes.
    pub fn respond_truncated(self, stdout: &str, dropped: usize) -> Self {
        self.responses.borrow_mut().push_back(ProcessOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            truncated: dropped,
            timed_out: false,
        });
        self
    }

    pub fn time_out(self) -> Self {
        self.responses.borrow_mut().push_back(ProcessOutput {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            truncated: 0,
            timed_out: true,
        });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: &RemoteRequest<'_>) -> Result<ProcessOutput> {
        self.calls.borrow_mut().push(RecordedCall {
            target: request.target,
            interpreter: request.interpreter.to_string(),
            input: request.input.to_string(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted response left"))
    }
}

/// Sink that keeps every event and checkpoint.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub events: Vec<ProgressEvent>,
    pub checkpoints: Vec<RestartInfo>,
}

impl ProgressSink for RecordingSink {
    fn event(&mut self, event: &ProgressEvent) {
        self.events.push(event.clone());
    }

    fn checkpoint(&mut self, checkpoint: &RestartInfo) {
        self.checkpoints.push(checkpoint.clone());
    }
}
