//! Immutable value maps threaded through a run.
//!
//! Every step receives a `ResolutionContext` and returns a new one; nothing is
//! mutated through shared references, so command N's effects are exactly what
//! command N+1 sees.

use crate::core::types::{NameValue, OutputEntry, RestartInfo, Scalar, Values};

/// The three value layers variable substitution reads from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionContext {
    pub inputs: Values,
    pub outputs: Values,
    pub defaults: Values,
}

impl ResolutionContext {
    pub fn new(inputs: Values, outputs: Values, defaults: Values) -> Self {
        Self {
            inputs,
            outputs,
            defaults,
        }
    }

    /// Rebuild the context from a checkpoint. The checkpoint replaces every
    /// layer; nothing from a previous context survives.
    pub fn from_checkpoint(checkpoint: &RestartInfo) -> Self {
        Self {
            inputs: unflatten(&checkpoint.inputs),
            outputs: unflatten(&checkpoint.outputs),
            defaults: unflatten(&checkpoint.defaults),
        }
    }

    /// Apply a command's output entries: `value` lands in outputs, `default`
    /// in defaults. Entries carrying neither are accepted and change nothing.
    pub fn with_output_entries(&self, entries: &[OutputEntry]) -> Self {
        let mut next = self.clone();
        for entry in entries {
            if let Some(value) = &entry.value {
                next.outputs.insert(entry.id.clone(), value.clone());
            }
            if let Some(default) = &entry.default {
                next.defaults.insert(entry.id.clone(), default.clone());
            }
        }
        next
    }

    /// Container id, looked up in inputs first and then outputs.
    pub fn vm_id(&self) -> Option<u64> {
        [self.inputs.get("vm_id"), self.outputs.get("vm_id")]
            .into_iter()
            .flatten()
            .find_map(parse_vm_id)
    }

    /// Snapshot this context as a checkpoint marking `index` as done.
    pub fn checkpoint(&self, index: usize) -> RestartInfo {
        RestartInfo {
            vm_id: self.vm_id(),
            last_successful: Some(index),
            inputs: flatten(&self.inputs),
            outputs: flatten(&self.outputs),
            defaults: flatten(&self.defaults),
        }
    }
}

fn parse_vm_id(value: &Scalar) -> Option<u64> {
    match value {
        Scalar::Number(number) => number.as_u64(),
        Scalar::Text(text) => text.trim().parse().ok(),
        Scalar::Bool(_) => None,
    }
}

pub fn flatten(values: &Values) -> Vec<NameValue> {
    values
        .iter()
        .map(|(name, value)| NameValue {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

pub fn unflatten(entries: &[NameValue]) -> Values {
    entries
        .iter()
        .map(|entry| (entry.name.clone(), entry.value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Scalar::text(*v)))
            .collect()
    }

    #[test]
    fn output_entries_split_into_outputs_and_defaults() {
        let ctx = ResolutionContext::default();
        let next = ctx.with_output_entries(&[
            OutputEntry {
                id: "x".to_string(),
                value: Some(Scalar::text("1")),
                default: None,
            },
            OutputEntry {
                id: "y".to_string(),
                value: None,
                default: Some(Scalar::text("2")),
            },
            OutputEntry {
                id: "z".to_string(),
                value: None,
                default: None,
            },
        ]);
        assert_eq!(next.outputs.get("x"), Some(&Scalar::text("1")));
        assert_eq!(next.defaults.get("y"), Some(&Scalar::text("2")));
        assert!(!next.outputs.contains_key("z"));
        assert!(ctx.outputs.is_empty(), "source context must stay untouched");
    }

    #[test]
    fn vm_id_prefers_inputs_then_outputs() {
        let ctx = ResolutionContext::new(
            values(&[("vm_id", "105")]),
            values(&[("vm_id", "200")]),
            Values::new(),
        );
        assert_eq!(ctx.vm_id(), Some(105));

        let only_output = ResolutionContext::new(
            Values::new(),
            [("vm_id".to_string(), Scalar::from(200u64))].into(),
            Values::new(),
        );
        assert_eq!(only_output.vm_id(), Some(200));
        assert_eq!(ResolutionContext::default().vm_id(), None);
    }

    #[test]
    fn checkpoint_round_trips_through_context() {
        let ctx = ResolutionContext::new(
            values(&[("hostname", "web"), ("vm_id", "7")]),
            values(&[("ip", "10.0.0.2")]),
            values(&[("memory", "512")]),
        );
        let checkpoint = ctx.checkpoint(3);
        assert_eq!(checkpoint.last_successful, Some(3));
        assert_eq!(checkpoint.vm_id, Some(7));
        assert_eq!(ResolutionContext::from_checkpoint(&checkpoint), ctx);
    }
}
