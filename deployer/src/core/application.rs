//! Application resolution: extends chain, parameter merge, template expansion.
//!
//! The resolver reads documents through a [`DocumentSource`] and never mutates
//! them. Configuration problems are pushed on the caller's
//! [`ConfigurationErrors`] and resolution carries on with whatever it could
//! collect, so one call reports every broken reference it can see.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::instrument;

use crate::core::addons;
use crate::core::error::{ConfigurationError, ConfigurationErrors, DocumentKind};
use crate::core::types::{
    Addon, Application, Command, CommandBody, Framework, FrameworkProperty, Parameter, Property,
    Stage, TaskPhases, TaskType, Template, TemplateRef, Values,
};

/// Read access to parsed documents. `Ok(None)` means the document does not
/// exist; `Err` means it exists but could not be read or parsed.
pub trait DocumentSource {
    fn application(&self, id: &str) -> Result<Option<Application>, ConfigurationError>;
    fn template(&self, name: &str) -> Result<Option<Template>, ConfigurationError>;
    fn framework(&self, id: &str) -> Result<Option<Framework>, ConfigurationError>;
    fn addon(&self, id: &str) -> Result<Option<Addon>, ConfigurationError>;
    /// Raw contents of a script or library file.
    fn script(&self, path: &str) -> Result<Option<String>, ConfigurationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationMetadata {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Most derived `framework` value along the chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    /// Application ids visited, most derived first.
    pub chain: Vec<String>,
}

/// One executable step with the template context it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedCommand {
    pub stage: Stage,
    pub template: String,
    /// Parameter ids that must all be truthy at run time for the step to run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<String>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedApplication {
    pub metadata: ApplicationMetadata,
    pub parameters: Vec<Parameter>,
    pub commands: Vec<PlannedCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResolution {
    Applicable(ResolvedApplication),
    /// No application in the chain defines the requested task.
    NotApplicable { metadata: ApplicationMetadata },
}

pub struct ApplicationResolver<'a, S: DocumentSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: DocumentSource + ?Sized> ApplicationResolver<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Resolve `app_id` for `task`. Returns `None` only when the application
    /// itself cannot be loaded; the reason is on `errors`.
    #[instrument(skip_all, fields(app = %app_id, task = %task))]
    pub fn resolve(
        &self,
        app_id: &str,
        task: TaskType,
        addon_ids: &[String],
        errors: &mut ConfigurationErrors,
    ) -> Option<TaskResolution> {
        let chain = self.load_chain(app_id, errors);
        let leaf = chain.first()?;
        let metadata = ApplicationMetadata {
            id: leaf.id.clone(),
            name: leaf.name.clone(),
            description: leaf.description.clone(),
            framework: chain.iter().find_map(|app| app.framework.clone()),
            chain: chain.iter().map(|app| app.id.clone()).collect(),
        };

        let Some(mut phases) = merge_phases(&chain, task, errors) else {
            tracing::info!("task not applicable");
            return Some(TaskResolution::NotApplicable { metadata });
        };

        let addon_docs = self.load_addons(addon_ids, task, errors);
        for addon in &addon_docs {
            for stage in Stage::ALL {
                let merged = addons::merge(phases.stage(stage), addon.installation.stage(stage));
                *phases.stage_mut(stage) = merged;
            }
        }

        let mut expansion = Expansion::default();
        for stage in Stage::ALL {
            for template_ref in phases.stage(stage) {
                self.expand_template(
                    template_ref.name(),
                    &leaf.id,
                    &Inherited {
                        stage,
                        execute_on: None,
                        guards: Vec::new(),
                    },
                    &mut Vec::new(),
                    &mut expansion,
                    errors,
                );
            }
        }

        let mut parameters = ParameterSet::default();
        for (level, app) in chain.iter().enumerate() {
            for parameter in &app.parameters {
                parameters.insert(parameter.clone(), level);
            }
        }
        for parameter in expansion.parameters {
            parameters.insert(parameter, usize::MAX);
        }
        for addon in &addon_docs {
            for parameter in &addon.parameters {
                parameters.insert(parameter.clone(), usize::MAX);
            }
        }
        for (level, app) in chain.iter().enumerate() {
            for property in &app.properties {
                parameters.apply_property(property, level);
            }
        }

        tracing::debug!(
            parameters = parameters.list.len(),
            commands = expansion.commands.len(),
            "application resolved"
        );
        Some(TaskResolution::Applicable(ResolvedApplication {
            metadata,
            parameters: parameters.list,
            commands: expansion.commands,
        }))
    }

    /// Walk `extends` from `app_id`, most derived first. Stops quietly at an
    /// id already visited.
    fn load_chain(&self, app_id: &str, errors: &mut ConfigurationErrors) -> Vec<Application> {
        let mut chain: Vec<Application> = Vec::new();
        let mut visited = BTreeSet::new();
        let mut next = Some(app_id.to_string());
        while let Some(id) = next.take() {
            if !visited.insert(id.clone()) {
                tracing::debug!(id = %id, "extends chain revisits an application; stopping");
                break;
            }
            match self.source.application(&id) {
                Ok(Some(mut app)) => {
                    if app.id.is_empty() {
                        app.id = id;
                    }
                    next = app.extends.clone();
                    chain.push(app);
                }
                Ok(None) => {
                    let error = match chain.last() {
                        Some(child) => ConfigurationError::MissingParent {
                            id: child.id.clone(),
                            parent: id,
                        },
                        None => ConfigurationError::NotFound {
                            kind: DocumentKind::Application,
                            id,
                        },
                    };
                    errors.push(error);
                }
                Err(error) => errors.push(error),
            }
        }
        chain
    }

    fn load_addons(
        &self,
        addon_ids: &[String],
        task: TaskType,
        errors: &mut ConfigurationErrors,
    ) -> Vec<Addon> {
        if task != TaskType::Installation {
            if !addon_ids.is_empty() {
                tracing::debug!(task = %task, "addons only contribute to installation");
            }
            return Vec::new();
        }
        let mut loaded = Vec::new();
        for id in addon_ids {
            match self.source.addon(id) {
                Ok(Some(addon)) => loaded.push(addon),
                Ok(None) => errors.push(ConfigurationError::NotFound {
                    kind: DocumentKind::Addon,
                    id: id.clone(),
                }),
                Err(error) => errors.push(error),
            }
        }
        loaded
    }

    fn expand_template(
        &self,
        name: &str,
        referrer: &str,
        inherited: &Inherited,
        stack: &mut Vec<String>,
        out: &mut Expansion,
        errors: &mut ConfigurationErrors,
    ) {
        if stack.iter().any(|seen| seen == name) {
            let mut path = stack.clone();
            path.push(name.to_string());
            errors.push(ConfigurationError::TemplateCycle {
                path: path.join(" -> "),
            });
            return;
        }
        let template = match self.source.template(name) {
            Ok(Some(template)) => template,
            Ok(None) => {
                errors.push(ConfigurationError::MissingTemplate {
                    name: name.to_string(),
                    referrer: referrer.to_string(),
                });
                return;
            }
            Err(error) => {
                errors.push(error);
                return;
            }
        };

        for parameter in &template.parameters {
            let mut parameter = parameter.clone();
            if parameter.template.is_none() {
                parameter.template = Some(name.to_string());
            }
            out.parameters.push(parameter);
        }

        let mut guards = inherited.guards.clone();
        if let Some(guard) = &template.guard {
            guards.push(guard.clone());
        }
        let template_target = template
            .execute_on
            .clone()
            .or_else(|| inherited.execute_on.clone());

        stack.push(name.to_string());
        for command in &template.commands {
            let execute_on = command
                .execute_on
                .clone()
                .or_else(|| template_target.clone());
            match command.body() {
                None => errors.push(ConfigurationError::AmbiguousCommand {
                    template: name.to_string(),
                    command: command.name.clone(),
                }),
                Some(CommandBody::Template(inner)) => self.expand_template(
                    inner,
                    name,
                    &Inherited {
                        stage: inherited.stage,
                        execute_on,
                        guards: guards.clone(),
                    },
                    stack,
                    out,
                    errors,
                ),
                Some(_) => {
                    let mut command = command.clone();
                    if command.name.is_empty() {
                        command.name = name.to_string();
                    }
                    command.execute_on = execute_on;
                    out.commands.push(PlannedCommand {
                        stage: inherited.stage,
                        template: name.to_string(),
                        guards: guards.clone(),
                        command,
                    });
                }
            }
        }
        stack.pop();
    }
}

/// What a nested template reference passes down to the template it expands.
struct Inherited {
    stage: Stage,
    execute_on: Option<String>,
    guards: Vec<String>,
}

#[derive(Default)]
struct Expansion {
    parameters: Vec<Parameter>,
    commands: Vec<PlannedCommand>,
}

/// Parameters in first-seen order; the first definition of an id wins.
#[derive(Default)]
struct ParameterSet {
    list: Vec<Parameter>,
    index: BTreeMap<String, usize>,
    /// Chain level whose definition supplied the current default/required.
    level: Vec<usize>,
    overridden: BTreeSet<String>,
}

impl ParameterSet {
    fn insert(&mut self, parameter: Parameter, level: usize) {
        if self.index.contains_key(&parameter.id) {
            return;
        }
        self.index.insert(parameter.id.clone(), self.list.len());
        self.level.push(level);
        self.list.push(parameter);
    }

    /// A property overrides the parameter's default and `required` flag when
    /// it sits at the same or a more derived level than the definition, and
    /// no more derived property already did.
    fn apply_property(&mut self, property: &Property, level: usize) {
        let Some(&slot) = self.index.get(&property.id) else {
            tracing::debug!(id = %property.id, "property has no matching parameter");
            return;
        };
        if level > self.level[slot] || self.overridden.contains(&property.id) {
            return;
        }
        let parameter = &mut self.list[slot];
        if let Some(default) = property.effective_default() {
            parameter.default = Some(default.clone());
        }
        if let Some(required) = property.required {
            parameter.required = required;
        }
        self.overridden.insert(property.id.clone());
    }
}

/// Union of the task's phases along the chain, root first. Refs a more
/// derived level adds are anchored into the inherited lists the same way
/// addon refs are. `None` when no level defines the task.
fn merge_phases(
    chain: &[Application],
    task: TaskType,
    errors: &mut ConfigurationErrors,
) -> Option<TaskPhases> {
    let mut merged: Option<TaskPhases> = None;
    for app in chain.iter().rev() {
        let Some(raw) = app.phase(task) else {
            continue;
        };
        let phases = match parse_phase(raw) {
            Ok(phases) => phases,
            Err(reason) => {
                errors.push(ConfigurationError::Malformed {
                    kind: DocumentKind::Application,
                    id: app.id.clone(),
                    reason: format!("{task}: {reason}"),
                });
                TaskPhases::default()
            }
        };
        let acc = merged.get_or_insert_with(TaskPhases::default);
        for stage in Stage::ALL {
            let fresh: Vec<TemplateRef> = phases
                .stage(stage)
                .iter()
                .filter(|r| !acc.stage(stage).iter().any(|have| have.name() == r.name()))
                .cloned()
                .collect();
            let next = addons::merge(acc.stage(stage), &fresh);
            *acc.stage_mut(stage) = next;
        }
    }
    merged
}

/// A phase is either a plain template list or a staged object.
fn parse_phase(raw: &serde_json::Value) -> Result<TaskPhases, String> {
    match raw {
        serde_json::Value::Array(_) => {
            let refs: Vec<TemplateRef> =
                serde_json::from_value(raw.clone()).map_err(|err| err.to_string())?;
            Ok(TaskPhases {
                commands: refs,
                ..TaskPhases::default()
            })
        }
        serde_json::Value::Object(_) => {
            serde_json::from_value(raw.clone()).map_err(|err| err.to_string())
        }
        other => Err(format!("expected a list or an object, found {other}")),
    }
}

/// Build a new application from `framework`, fixing or defaulting each
/// framework property from `values`.
pub fn instantiate(framework: &Framework, id: &str, name: &str, values: &Values) -> Application {
    let properties = framework
        .properties
        .iter()
        .filter_map(|property| {
            let (as_default, required) = match property {
                FrameworkProperty::Bare(_) => (false, None),
                FrameworkProperty::Flagged {
                    default, required, ..
                } => (*default, *required),
            };
            let supplied = values.get(property.id()).cloned();
            if supplied.is_none() && required.is_none() {
                return None;
            }
            let (value, default) = if as_default {
                (None, supplied)
            } else {
                (supplied, None)
            };
            Some(Property {
                id: property.id().to_string(),
                value,
                default,
                required,
            })
        })
        .collect();

    Application {
        id: id.to_string(),
        name: name.to_string(),
        extends: Some(framework.extends.clone()),
        framework: Some(framework.id.clone()),
        properties,
        ..Application::default()
    }
}

/// Look up `framework_id` and [`instantiate`] it as application `id`. The
/// framework's parent application must exist.
pub fn instantiate_framework<S: DocumentSource + ?Sized>(
    documents: &S,
    framework_id: &str,
    id: &str,
    name: &str,
    values: &Values,
) -> Result<Application, ConfigurationError> {
    let framework = documents
        .framework(framework_id)?
        .ok_or_else(|| ConfigurationError::NotFound {
            kind: DocumentKind::Framework,
            id: framework_id.to_string(),
        })?;
    if documents.application(&framework.extends)?.is_none() {
        return Err(ConfigurationError::MissingParent {
            id: id.to_string(),
            parent: framework.extends,
        });
    }
    Ok(instantiate(&framework, id, name, values))
}
