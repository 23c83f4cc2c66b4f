//! Out-of-band pairing inputs.
//!
//! Three inputs resolve to a remote device:
//! - a scanned QR string, either a bare device id or a URL carrying
//!   `id` and optional `name`/`platform` query parameters;
//! - a 6-digit code typed by the user, resolved through the code registry;
//! - a pasted signaling envelope (manual signal exchange).

use thiserror::Error;
use url::Url;

use super::auth_code::normalize_code;
use crate::device::{DeviceDescriptor, Platform};
use crate::network::SignalEnvelope;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootstrapParseError {
    #[error("bootstrap input is empty")]
    Empty,

    #[error("scanned payload has no device id")]
    MissingDeviceId,

    #[error("scanned payload is not a device id: {0}")]
    InvalidDeviceId(String),

    #[error("pairing code must be 6 digits")]
    InvalidCodeFormat,

    #[error("signal blob is not a valid envelope: {0}")]
    InvalidSignalBlob(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapInput {
    Scanned(DeviceDescriptor),
    Code(String),
    SignalBlob(SignalEnvelope),
}

impl BootstrapInput {
    pub fn scanned(raw: &str) -> Result<Self, BootstrapParseError> {
        parse_scanned(raw).map(Self::Scanned)
    }

    pub fn code(raw: &str) -> Result<Self, BootstrapParseError> {
        normalize_code(raw)
            .map(Self::Code)
            .ok_or(BootstrapParseError::InvalidCodeFormat)
    }

    pub fn signal_blob(raw: &str) -> Result<Self, BootstrapParseError> {
        parse_signal_blob(raw).map(Self::SignalBlob)
    }
}

/// Parses a scanned QR payload into a descriptor.
pub fn parse_scanned(raw: &str) -> Result<DeviceDescriptor, BootstrapParseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(BootstrapParseError::Empty);
    }

    if let Some(query) = query_part(raw) {
        return descriptor_from_query(&query);
    }

    if raw.chars().any(|c| c.is_whitespace() || c == '?' || c == '&') {
        return Err(BootstrapParseError::InvalidDeviceId(raw.to_string()));
    }
    Ok(DeviceDescriptor::anonymous(raw))
}

/// Parses a pasted signaling blob.
pub fn parse_signal_blob(raw: &str) -> Result<SignalEnvelope, BootstrapParseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(BootstrapParseError::Empty);
    }
    let envelope =
        SignalEnvelope::from_json(raw).map_err(|e| BootstrapParseError::InvalidSignalBlob(e.to_string()))?;
    if envelope.from.is_empty() {
        return Err(BootstrapParseError::MissingDeviceId);
    }
    Ok(envelope)
}

/// Identity of the sender of an envelope, falling back to the id as name.
pub fn descriptor_from_envelope(envelope: &SignalEnvelope) -> DeviceDescriptor {
    DeviceDescriptor::new(
        envelope.from.clone(),
        envelope
            .from_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| envelope.from.to_string()),
        envelope.from_platform.unwrap_or_default(),
    )
}

fn query_part(raw: &str) -> Option<String> {
    if let Ok(url) = Url::parse(raw) {
        if let Some(query) = url.query() {
            return Some(query.to_string());
        }
    }
    match raw.split_once('?') {
        Some((_, query)) => Some(query.to_string()),
        None if raw.contains("id=") => Some(raw.to_string()),
        None => None,
    }
}

fn descriptor_from_query(query: &str) -> Result<DeviceDescriptor, BootstrapParseError> {
    let mut id = None;
    let mut name = None;
    let mut platform = Platform::Unknown;

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "id" => id = Some(value.trim().to_string()),
            "name" => name = Some(value.trim().to_string()),
            "platform" => platform = Platform::from(value.into_owned()),
            _ => {}
        }
    }

    let id = id
        .filter(|id| !id.is_empty())
        .ok_or(BootstrapParseError::MissingDeviceId)?;
    let name = name.filter(|n| !n.is_empty()).unwrap_or_else(|| id.clone());
    Ok(DeviceDescriptor::new(id, name, platform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use crate::network::SignalKind;

    #[test]
    fn test_bare_id_is_accepted() {
        let descriptor = parse_scanned("  device-42 ").unwrap();
        assert_eq!(descriptor.device_id.as_str(), "device-42");
        assert_eq!(descriptor.name, "device-42");
        assert_eq!(descriptor.platform, Platform::Unknown);
    }

    #[test]
    fn test_url_with_query_params() {
        let descriptor = parse_scanned("peerdrop://pair?id=abc&name=My%20Phone&platform=android").unwrap();
        assert_eq!(descriptor.device_id.as_str(), "abc");
        assert_eq!(descriptor.name, "My Phone");
        assert_eq!(descriptor.platform, Platform::Android);
    }

    #[test]
    fn test_relative_query_without_scheme() {
        let descriptor = parse_scanned("?id=xyz&name=Desk").unwrap();
        assert_eq!(descriptor.device_id.as_str(), "xyz");
        assert_eq!(descriptor.name, "Desk");
    }

    #[test]
    fn test_query_without_id_is_rejected() {
        assert_eq!(
            parse_scanned("https://example.com/pair?name=Desk"),
            Err(BootstrapParseError::MissingDeviceId)
        );
        assert_eq!(parse_scanned("   "), Err(BootstrapParseError::Empty));
        assert!(matches!(
            parse_scanned("two words"),
            Err(BootstrapParseError::InvalidDeviceId(_))
        ));
    }

    #[test]
    fn test_code_input_is_normalized() {
        assert_eq!(BootstrapInput::code("123 456"), Ok(BootstrapInput::Code("123456".into())));
        assert_eq!(BootstrapInput::code("12ab56"), Err(BootstrapParseError::InvalidCodeFormat));
    }

    #[test]
    fn test_signal_blob_roundtrips_sender_identity() {
        let ctx = DeviceContext::new("laptop", "Work Laptop", Platform::MacOS);
        let envelope = SignalEnvelope::new(&ctx, "phone".into(), SignalKind::Offer, serde_json::json!({}));
        let parsed = parse_signal_blob(&envelope.to_json().unwrap()).unwrap();

        let descriptor = descriptor_from_envelope(&parsed);
        assert_eq!(descriptor, DeviceDescriptor::new("laptop", "Work Laptop", Platform::MacOS));
        assert!(parse_signal_blob("{not json").is_err());
    }
}
