//! Inbound settings adapter: decode the `settings` JSON of an inbound and
//! pull out its client list as [`ClientConfigEntry`] values.
//!
//! Decoding is lenient at the collection level: a malformed inbound or client
//! object is reported as a [`SettingsDecodeError`] and skipped, and the rest of
//! the inbounds are still processed. Callers decide how to log the errors.

use serde_json::{Map, Value};

use crate::{ClientConfigEntry, InboundRow, ProtocolAllowList};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsDecodeError {
    /// `settings` is not valid JSON.
    InvalidJson { inbound_id: i64, message: String },
    /// `settings` parsed but is not a JSON object.
    NotAnObject { inbound_id: i64 },
    /// `settings.clients` exists but is not an array.
    ClientsNotArray { inbound_id: i64 },
    /// An element of `settings.clients` is not an object.
    ClientNotObject { inbound_id: i64, index: usize },
    /// A client object has no usable `email`.
    MissingEmail { inbound_id: i64, index: usize },
    /// Re-serializing rebuilt settings failed.
    Encode { inbound_id: i64, message: String },
}

impl std::fmt::Display for SettingsDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson {
                inbound_id,
                message,
            } => write!(f, "inbound {inbound_id}: settings is not valid JSON: {message}"),
            Self::NotAnObject { inbound_id } => {
                write!(f, "inbound {inbound_id}: settings is not a JSON object")
            }
            Self::ClientsNotArray { inbound_id } => {
                write!(f, "inbound {inbound_id}: settings.clients is not an array")
            }
            Self::ClientNotObject { inbound_id, index } => {
                write!(f, "inbound {inbound_id}: client #{index} is not an object")
            }
            Self::MissingEmail { inbound_id, index } => {
                write!(f, "inbound {inbound_id}: client #{index} has no email")
            }
            Self::Encode {
                inbound_id,
                message,
            } => write!(f, "inbound {inbound_id}: settings re-encode failed: {message}"),
        }
    }
}

impl std::error::Error for SettingsDecodeError {}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Parse an inbound's settings into a JSON object.
///
/// `Ok(None)` when the inbound has no settings at all (NULL or empty string).
pub(crate) fn decode_settings(
    inbound: &InboundRow,
) -> Result<Option<Map<String, Value>>, SettingsDecodeError> {
    let raw = match inbound.settings.as_deref() {
        Some(s) if !s.trim().is_empty() => s,
        _ => return Ok(None),
    };

    let parsed: Value =
        serde_json::from_str(raw).map_err(|e| SettingsDecodeError::InvalidJson {
            inbound_id: inbound.id,
            message: e.to_string(),
        })?;

    match parsed {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(SettingsDecodeError::NotAnObject {
            inbound_id: inbound.id,
        }),
    }
}

/// The raw `clients` array of a decoded settings object. A missing key is an
/// empty list.
pub(crate) fn client_values(
    inbound_id: i64,
    settings: &Map<String, Value>,
) -> Result<Vec<Value>, SettingsDecodeError> {
    match settings.get("clients") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(SettingsDecodeError::ClientsNotArray { inbound_id }),
    }
}

/// Collect the client entries of every allowed inbound.
///
/// Returns the entries in inbound order, then client order, plus one error
/// per skipped inbound or skipped client object.
pub fn extract_client_entries(
    inbounds: &[InboundRow],
    allow: &ProtocolAllowList,
) -> (Vec<ClientConfigEntry>, Vec<SettingsDecodeError>) {
    let mut entries: Vec<ClientConfigEntry> = Vec::new();
    let mut errors: Vec<SettingsDecodeError> = Vec::new();

    for inbound in inbounds.iter().filter(|ib| allow.allows(&ib.protocol)) {
        let settings = match decode_settings(inbound) {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        let clients = match client_values(inbound.id, &settings) {
            Ok(c) => c,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        for (index, client) in clients.into_iter().enumerate() {
            let Value::Object(object) = client else {
                errors.push(SettingsDecodeError::ClientNotObject {
                    inbound_id: inbound.id,
                    index,
                });
                continue;
            };
            match ClientConfigEntry::from_object(inbound.id, object) {
                Some(entry) => entries.push(entry),
                None => errors.push(SettingsDecodeError::MissingEmail {
                    inbound_id: inbound.id,
                    index,
                }),
            }
        }
    }

    (entries, errors)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
