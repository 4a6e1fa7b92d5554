//! Datapoint payload decoding.
//! Turns decrypted payload bytes into a DP index -> value map, tolerating
//! the several shapes doorbell firmware has been observed to emit, and
//! provides best-effort helpers for the media blobs carried by button and
//! motion datapoints.

use crate::error::{Result, TuyaError};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use log::debug;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Decoded datapoint state: DP index -> value.
pub type DpsMap = BTreeMap<u32, Value>;

/// Bucket used for doorbell snapshot uploads when the payload names none.
const DEFAULT_BUCKET: &str = "ty-us-storage30-pic";

/// One batch of datapoint changes pushed by (or queried from) the device.
#[derive(Debug, Clone)]
pub struct DatapointEvent {
    pub device_id: String,
    pub dps: DpsMap,
    pub received_at: SystemTime,
}

/// Decode a decrypted payload into a DP map.
///
/// Accepted shapes: a bare `{"<idx>": value}` object, the usual
/// `{"devId":..,"dps":{..}}` wrapper, the v3.4 `{"data":{"dps":{..}}}`
/// nesting, and any of those double-encoded as a JSON string. Keys that do
/// not parse as DP indexes and values that are unusable are skipped
/// per-key; one garbled DP never blocks the rest of the payload.
pub fn decode_dps(raw: &[u8]) -> Result<DpsMap> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| TuyaError::Unparseable("payload is not UTF-8".into()))?;
    let mut root: Value = serde_json::from_str(text)
        .map_err(|e| TuyaError::Unparseable(format!("not JSON: {e}")))?;

    // Double-encoded: the whole object arrived wrapped in a JSON string.
    if let Value::String(inner) = &root {
        root = serde_json::from_str(inner)
            .map_err(|e| TuyaError::Unparseable(format!("string-wrapped but not JSON: {e}")))?;
    }

    let obj = root
        .as_object()
        .ok_or_else(|| TuyaError::Unparseable("payload is not an object".into()))?;

    let dps = find_dps_object(obj)
        .ok_or_else(|| TuyaError::Unparseable("no dps object in payload".into()))?;

    let mut map = DpsMap::new();
    for (key, value) in dps {
        match key.parse::<u32>() {
            Ok(index) => {
                map.insert(index, normalize_value(value));
            }
            Err(_) => {
                debug!("Skipping non-datapoint key '{key}'");
            }
        }
    }
    Ok(map)
}

fn find_dps_object(obj: &Map<String, Value>) -> Option<&Map<String, Value>> {
    if let Some(dps) = obj.get("dps").and_then(Value::as_object) {
        return Some(dps);
    }
    if let Some(dps) = obj
        .get("data")
        .and_then(Value::as_object)
        .and_then(|d| d.get("dps"))
        .and_then(Value::as_object)
    {
        return Some(dps);
    }
    // A bare map of numeric keys is itself the dps object.
    if !obj.is_empty() && obj.keys().all(|k| k.parse::<u32>().is_ok()) {
        return Some(obj);
    }
    None
}

/// Firmware stringifies booleans in some report paths.
fn normalize_value(value: &Value) -> Value {
    match value.as_str() {
        Some("true") => Value::Bool(true),
        Some("false") => Value::Bool(false),
        _ => value.clone(),
    }
}

/// Decode the media blob a button or motion DP carries.
///
/// Observed encodings, tried in order: base64-wrapped JSON, direct JSON in
/// a string, already-decoded JSON object. Returns `None` when the value is
/// none of those; never an error, since the surrounding DP update stays
/// valid either way.
pub fn decode_media_value(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) => {
            if let Ok(decoded) = BASE64.decode(s.trim()) {
                if let Ok(parsed) = serde_json::from_slice::<Value>(&decoded) {
                    return Some(parsed);
                }
            }
            serde_json::from_str(s).ok()
        }
        Value::Object(_) | Value::Array(_) => Some(value.clone()),
        _ => None,
    }
}

/// Best-effort search for a snapshot URL in a decoded media payload.
///
/// There is no canonical schema; firmware variants emit a cloud-bucket
/// shape (`{"bucket": .., "files": [[path, ..], ..]}`), a bare URL field,
/// or either of those nested deeper in the object. First match wins;
/// `None` when nothing matches.
pub fn extract_image_url(value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => {
            if let Some(url) = bucket_file_url(obj) {
                return Some(url);
            }
            for key in ["url", "image_url", "image"] {
                if let Some(s) = obj.get(key).and_then(Value::as_str) {
                    if let Some(url) = path_to_url(s) {
                        return Some(url);
                    }
                }
            }
            obj.values().find_map(extract_image_url)
        }
        Value::Array(items) => items.iter().find_map(extract_image_url),
        Value::String(s) if s.starts_with("https://") || s.starts_with("http://") => {
            Some(s.clone())
        }
        _ => None,
    }
}

fn bucket_file_url(obj: &Map<String, Value>) -> Option<String> {
    let files = obj.get("files")?.as_array()?;
    let first = files.first()?;
    let path = match first {
        Value::Array(entry) => entry.first()?.as_str()?,
        Value::String(s) => s.as_str(),
        _ => return None,
    };
    let bucket = obj
        .get("bucket")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_BUCKET);
    Some(format!("https://{bucket}.oss-us-west-1.aliyuncs.com{path}"))
}

fn path_to_url(s: &str) -> Option<String> {
    if s.starts_with("https://") || s.starts_with("http://") {
        Some(s.to_string())
    } else if s.starts_with('/') {
        Some(format!("https://{DEFAULT_BUCKET}.oss-us-west-1.aliyuncs.com{s}"))
    } else {
        None
    }
}
