//! `{{ name }}` substitution for command text and scripts.
//!
//! Lookup order for each identifier: the per-call context map, list variables,
//! outputs, inputs, defaults. Anything left over becomes [`NOT_DEFINED`]; the
//! scripts themselves decide whether that is fatal. [`VariableResolver::resolve_strict`]
//! is the separate contract that reports the undefined names instead.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::{Captures, Regex};

use crate::core::context::ResolutionContext;
use crate::core::error::ResolutionError;
use crate::core::types::{NOT_DEFINED, Scalar, Values};

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("marker regex is valid")
});

/// Shortest string value considered for base64 payload expansion.
const MIN_BASE64_LEN: usize = 20;

const LIST_PREFIX: &str = "list.";

/// True if `text` still contains at least one `{{ name }}` marker.
pub fn has_markers(text: &str) -> bool {
    MARKER_RE.is_match(text)
}

/// Read-only resolver over one [`ResolutionContext`].
#[derive(Debug, Clone, Copy)]
pub struct VariableResolver<'a> {
    values: &'a ResolutionContext,
}

impl<'a> VariableResolver<'a> {
    pub fn new(values: &'a ResolutionContext) -> Self {
        Self { values }
    }

    /// Substitute every marker, running at most one extra pass when a
    /// substituted value itself carried markers.
    pub fn resolve(&self, text: &str, context: &Values) -> String {
        let first = self.substitute(text, context, &mut Vec::new());
        if has_markers(&first) {
            self.substitute(&first, context, &mut Vec::new())
        } else {
            first
        }
    }

    /// Like [`resolve`](Self::resolve) but fails with every identifier that
    /// had no value.
    pub fn resolve_strict(&self, text: &str, context: &Values) -> Result<String, ResolutionError> {
        let mut missing = Vec::new();
        let first = self.substitute(text, context, &mut missing);
        let resolved = if missing.is_empty() && has_markers(&first) {
            self.substitute(&first, context, &mut missing)
        } else {
            first
        };
        if missing.is_empty() {
            return Ok(resolved);
        }
        missing.sort();
        missing.dedup();
        Err(ResolutionError::Undefined { names: missing })
    }

    fn substitute(&self, text: &str, context: &Values, missing: &mut Vec<String>) -> String {
        MARKER_RE
            .replace_all(text, |caps: &Captures<'_>| {
                let ident = &caps[1];
                self.lookup(ident, context).unwrap_or_else(|| {
                    missing.push(ident.to_string());
                    NOT_DEFINED.to_string()
                })
            })
            .into_owned()
    }

    fn lookup(&self, ident: &str, context: &Values) -> Option<String> {
        if let Some(value) = context.get(ident) {
            return Some(value.to_string());
        }
        if let Some(list) = self.list_variable(ident, context) {
            return Some(list);
        }
        self.value(ident).map(ToString::to_string)
    }

    /// Direct value of `ident` from outputs, inputs, then defaults. Guards and
    /// substitution both read through here so they agree.
    pub fn value(&self, ident: &str) -> Option<&'a Scalar> {
        let values = self.values;
        values
            .outputs
            .get(ident)
            .or_else(|| values.inputs.get(ident))
            .or_else(|| values.defaults.get(ident))
    }

    /// Collect `list.<ident>.<subkey>` entries into sorted `subkey=value` lines.
    fn list_variable(&self, ident: &str, context: &Values) -> Option<String> {
        let prefix = format!("{LIST_PREFIX}{ident}.");
        let mut entries: BTreeMap<&str, &Scalar> = BTreeMap::new();
        let layers = [
            context,
            &self.values.outputs,
            &self.values.inputs,
            &self.values.defaults,
        ];
        for layer in layers {
            for (key, value) in layer.range(prefix.clone()..) {
                let Some(subkey) = key.strip_prefix(&prefix) else {
                    break;
                };
                if subkey.is_empty() {
                    continue;
                }
                entries.entry(subkey).or_insert(value);
            }
        }
        if entries.is_empty() {
            return None;
        }
        let lines: Vec<String> = entries
            .into_iter()
            .map(|(subkey, value)| format!("{subkey}={value}"))
            .collect();
        Some(lines.join("\n"))
    }

    /// Decode base64 payloads in inputs and outputs that carry markers,
    /// substitute them, and re-encode. Returns a new context; values that are
    /// not such payloads are copied unchanged.
    pub fn expand_base64_payloads(&self, context: &Values) -> ResolutionContext {
        ResolutionContext {
            inputs: self.expand_layer(&self.values.inputs, context),
            outputs: self.expand_layer(&self.values.outputs, context),
            defaults: self.values.defaults.clone(),
        }
    }

    fn expand_layer(&self, layer: &Values, context: &Values) -> Values {
        layer
            .iter()
            .map(|(name, value)| {
                let expanded = match value.as_text().and_then(decode_template_payload) {
                    Some(decoded) => {
                        tracing::debug!(name = %name, "expanding base64 payload");
                        let resolved = self.resolve(&decoded, context);
                        Scalar::Text(STANDARD.encode(resolved))
                    }
                    None => value.clone(),
                };
                (name.clone(), expanded)
            })
            .collect()
    }
}

/// Decoded text of a base64 value that contains markers, if it is one.
fn decode_template_payload(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.len() < MIN_BASE64_LEN {
        return None;
    }
    let bytes = STANDARD.decode(trimmed).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    has_markers(&text).then_some(text)
}
