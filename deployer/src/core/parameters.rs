//! Effective parameter values, their provenance, and the unresolved set.

use serde::Serialize;

use crate::core::context::ResolutionContext;
use crate::core::types::{Parameter, ParameterTrace, ParameterType, Scalar, TraceSource, Values};

/// How an overridden parameter gets its fallback default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    ApplicationId,
}

/// One fixed exception to a parameter's `required` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameworkOverride {
    pub framework: &'static str,
    pub parameter: &'static str,
    pub fallback: Fallback,
}

/// Parameters a framework family derives itself when the operator leaves
/// them blank. Matching is exact on both ids.
pub const FRAMEWORK_OVERRIDES: &[FrameworkOverride] = &[
    FrameworkOverride {
        framework: "docker-compose",
        parameter: "hostname",
        fallback: Fallback::ApplicationId,
    },
    FrameworkOverride {
        framework: "docker-compose",
        parameter: "compose_project",
        fallback: Fallback::ApplicationId,
    },
    FrameworkOverride {
        framework: "oci-image",
        parameter: "hostname",
        fallback: Fallback::ApplicationId,
    },
];

/// Apply [`FRAMEWORK_OVERRIDES`] for `framework`: matching parameters stop
/// being required and get the fallback default when they have none.
pub fn apply_framework_overrides(
    parameters: &[Parameter],
    framework: Option<&str>,
    application_id: &str,
) -> Vec<Parameter> {
    let Some(framework) = framework else {
        return parameters.to_vec();
    };
    parameters
        .iter()
        .map(|parameter| {
            let rule = FRAMEWORK_OVERRIDES
                .iter()
                .find(|rule| rule.framework == framework && rule.parameter == parameter.id);
            let Some(rule) = rule else {
                return parameter.clone();
            };
            let mut parameter = parameter.clone();
            parameter.required = false;
            if parameter.default.is_none() {
                parameter.default = Some(match rule.fallback {
                    Fallback::ApplicationId => Scalar::text(application_id),
                });
            }
            tracing::debug!(id = %parameter.id, framework, "framework override applied");
            parameter
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParameterResolution {
    /// Effective value per parameter id; missing parameters are absent.
    pub values: Values,
    /// One entry per parameter, in parameter order.
    pub traces: Vec<ParameterTrace>,
}

impl ParameterResolution {
    pub fn source(&self, id: &str) -> Option<TraceSource> {
        self.traces
            .iter()
            .find(|trace| trace.id == id)
            .map(|trace| trace.source)
    }
}

/// Resolve every parameter: explicit input, then prior output, then default.
/// An empty string input counts as not supplied.
pub fn resolve_parameters(
    parameters: &[Parameter],
    inputs: &Values,
    prior_outputs: &Values,
) -> ParameterResolution {
    let mut resolution = ParameterResolution::default();
    for parameter in parameters {
        let (source, value) = if let Some(value) = supplied(inputs, &parameter.id) {
            (TraceSource::Input, Some(value))
        } else if let Some(value) = prior_outputs.get(&parameter.id) {
            (TraceSource::Output, Some(value))
        } else if let Some(value) = &parameter.default {
            (TraceSource::Default, Some(value))
        } else {
            (TraceSource::Missing, None)
        };
        if let Some(value) = value {
            resolution
                .values
                .insert(parameter.id.clone(), value.clone());
        }
        resolution.traces.push(ParameterTrace {
            id: parameter.id.clone(),
            source,
            template: parameter.template.clone(),
        });
    }
    resolution
}

fn supplied<'v>(inputs: &'v Values, id: &str) -> Option<&'v Scalar> {
    inputs
        .get(id)
        .filter(|value| !matches!(value, Scalar::Text(text) if text.is_empty()))
}

/// Parameters the operator must see before a run: every enum, plus anything
/// not explicitly supplied this session.
pub fn unresolved<'p>(
    parameters: &'p [Parameter],
    resolution: &ParameterResolution,
) -> Vec<&'p Parameter> {
    parameters
        .iter()
        .filter(|parameter| {
            parameter.kind == ParameterType::Enum
                || matches!(
                    resolution.source(&parameter.id),
                    None | Some(TraceSource::Missing | TraceSource::Default)
                )
        })
        .collect()
}

/// Required parameters that ended up with no value at all.
pub fn missing_required<'p>(
    parameters: &'p [Parameter],
    resolution: &ParameterResolution,
) -> Vec<&'p Parameter> {
    parameters
        .iter()
        .filter(|parameter| {
            parameter.required
                && matches!(
                    resolution.source(&parameter.id),
                    None | Some(TraceSource::Missing)
                )
        })
        .collect()
}

/// Starting context for a fresh run: supplied inputs, prior outputs, and
/// parameter defaults as the defaults layer.
pub fn seed_context(
    parameters: &[Parameter],
    inputs: &Values,
    prior_outputs: &Values,
) -> ResolutionContext {
    let inputs = inputs
        .iter()
        .filter(|(id, _)| supplied(inputs, id).is_some())
        .map(|(id, value)| (id.clone(), value.clone()))
        .collect();
    let defaults = parameters
        .iter()
        .filter_map(|parameter| {
            parameter
                .default
                .as_ref()
                .map(|value| (parameter.id.clone(), value.clone()))
        })
        .collect();
    ResolutionContext::new(inputs, prior_outputs.clone(), defaults)
}
