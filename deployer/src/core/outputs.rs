//! The stdout contract every remote command must honor.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde_json::Value;

use crate::core::error::ValidationError;
use crate::core::types::OutputEntry;

const OUTPUTS_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/outputs/v1.schema.json"
));

static OUTPUTS_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(OUTPUTS_SCHEMA).expect("outputs schema is valid JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("outputs schema compiles")
});

/// Parse a command's stdout into output entries.
///
/// Blank stdout yields no entries. Otherwise stdout must be one entry object
/// or an array of them; `{"id": "x"}` alone is a valid entry recording nothing.
pub fn parse_outputs(command: &str, stdout: &str) -> Result<Vec<OutputEntry>, ValidationError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let instance: Value =
        serde_json::from_str(trimmed).map_err(|err| ValidationError::InvalidJson {
            command: command.to_string(),
            reason: err.to_string(),
        })?;

    let messages: Vec<String> = OUTPUTS_VALIDATOR
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(ValidationError::Schema {
            command: command.to_string(),
            messages,
        });
    }

    let entries: Result<Vec<OutputEntry>, serde_json::Error> = if instance.is_array() {
        serde_json::from_value(instance)
    } else {
        serde_json::from_value(instance).map(|entry| vec![entry])
    };
    entries.map_err(|err| ValidationError::InvalidJson {
        command: command.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Scalar;

    #[test]
    fn blank_stdout_has_no_entries() {
        assert_eq!(parse_outputs("c", "  \n").expect("blank"), Vec::new());
    }

    #[test]
    fn bare_id_entry_is_accepted() {
        let entries = parse_outputs("c", r#"{"id":"x"}"#).expect("valid");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "x");
        assert_eq!(entries[0].value, None);
        assert_eq!(entries[0].default, None);
    }

    #[test]
    fn array_entries_carry_values_and_defaults() {
        let entries = parse_outputs(
            "c",
            r#"[{"id":"x","value":"1"},{"id":"n","value":3},{"id":"d","default":true}]"#,
        )
        .expect("valid");
        assert_eq!(entries[0].value, Some(Scalar::text("1")));
        assert_eq!(entries[1].value, Some(Scalar::from(3u64)));
        assert_eq!(entries[2].default, Some(Scalar::from(true)));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = parse_outputs("c", "not json").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidJson { .. }));
    }

    #[test]
    fn non_object_array_entry_is_rejected() {
        let err = parse_outputs("c", r#"[{"id":"x","value":"1"}, "oops"]"#).unwrap_err();
        assert!(matches!(err, ValidationError::Schema { .. }));
    }

    #[test]
    fn entries_without_id_or_with_nested_values_are_rejected() {
        assert!(parse_outputs("c", r#"{"value":"1"}"#).is_err());
        assert!(parse_outputs("c", r#"{"id":"x","value":{"a":1}}"#).is_err());
        assert!(parse_outputs("c", "42").is_err());
    }
}
