//! Deserialization helpers for server responses.
//!
//! When the `tracing` feature is enabled, unknown fields are logged as warnings and a failing
//! field is reported with its path, which makes backend schema drift visible early.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Deserialize `value` into `T`, logging unknown fields and the path of the first failing field.
#[cfg(feature = "tracing")]
pub fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    use std::any::type_name;

    tracing::trace!(
        type_name = %type_name::<T>(),
        json = %value,
        "deserializing JSON"
    );

    // Kept so the failing path can be reported after `value` is consumed
    let original = value.clone();
    let mut unknown_paths: Vec<String> = Vec::new();

    let result: T = serde_ignored::deserialize(value, |path| {
        unknown_paths.push(path.to_string());
    })
    .inspect_err(|_| {
        let json_str = original.to_string();
        let jd = &mut serde_json::Deserializer::from_str(&json_str);
        let path_result: Result<T, _> = serde_path_to_error::deserialize(jd);
        if let Err(path_err) = path_result {
            tracing::error!(
                type_name = %type_name::<T>(),
                path = %path_err.path(),
                error = %path_err.inner(),
                "deserialization failed"
            );
        }
    })?;

    for path in unknown_paths {
        tracing::warn!(
            type_name = %type_name::<T>(),
            field = %path,
            "unknown field in response"
        );
    }

    Ok(result)
}

/// Pass-through deserialization when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Pull a human-readable `message` out of a JSON response body.
///
/// Accepts `{ "message": "..." }` and the nested `{ "data": { "message": "..." } }` form.
pub(crate) fn message_of(value: &Value) -> Option<&str> {
    value
        .get("message")
        .or_else(|| value.get("data").and_then(|data| data.get("message")))
        .and_then(Value::as_str)
        .filter(|message| !message.trim().is_empty())
}
