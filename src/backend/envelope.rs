//! Decoding of the `{success, message, ...data}` envelope every endpoint returns.

use crate::error::ApiError;
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Head {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Check `success`, then read the operation data from the same object.
pub(crate) fn decode<T: DeserializeOwned>(endpoint: &'static str, body: &[u8]) -> Result<T, ApiError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| ApiError::MalformedResponse {
            endpoint,
            reason: e.to_string(),
        })?;
    let head: Head = Head::deserialize(&value).map_err(|e| ApiError::MalformedResponse {
        endpoint,
        reason: e.to_string(),
    })?;
    if !head.success {
        return Err(ApiError::Protocol {
            endpoint,
            message: head.message,
        });
    }
    T::deserialize(&value).map_err(|e| ApiError::MalformedResponse {
        endpoint,
        reason: e.to_string(),
    })
}

/// Best-effort read of `message` from an error body.
pub(crate) fn message_of(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Head>(body)
        .ok()
        .and_then(|h| h.message)
        .filter(|m| !m.trim().is_empty())
}
