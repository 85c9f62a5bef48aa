//! Parameter extraction shared by the built-in back ends.

use taskpilot_core::{BackendFailure, Parameters};

pub(crate) fn required_str<'a>(parameters: &'a Parameters, key: &str) -> Result<&'a str, BackendFailure> {
    optional_str(parameters, key)?
        .ok_or_else(|| BackendFailure::invalid_parameters(format!("missing '{key}' argument")))
}

pub(crate) fn optional_str<'a>(
    parameters: &'a Parameters,
    key: &str,
) -> Result<Option<&'a str>, BackendFailure> {
    match parameters.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| BackendFailure::invalid_parameters(format!("'{key}' must be a string"))),
    }
}
