//! CloudEvents envelope carried by broker messages.
//!
//! Two encodings are understood:
//!
//! - **binary**: attributes travel as `ce-*` headers, the payload is the data
//! - **structured**: the payload is a JSON object holding attributes and
//!   either `data` or `data_base64`

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};

use crate::broker::BrokerMessage;
use crate::error::DispatchError;

pub const SPEC_VERSION: &str = "1.0";
pub const HEADER_PREFIX: &str = "ce-";
pub const CONTENT_TYPE_HEADER: &str = "content-type";
const JSON_CONTENT_TYPE: &str = "application/json";

const ATTR_ID: &str = "id";
const ATTR_SOURCE: &str = "source";
const ATTR_TYPE: &str = "type";
const ATTR_SPEC_VERSION: &str = "specversion";
const ATTR_CONTENT_TYPE: &str = "datacontenttype";
const ATTR_SUBJECT: &str = "subject";
const ATTR_TIME: &str = "time";
const ATTR_DATA: &str = "data";
const ATTR_DATA_BASE64: &str = "data_base64";

/// A decoded event: CloudEvents 1.0 attributes plus raw data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub spec_version: String,
    pub data_content_type: Option<String>,
    pub subject: Option<String>,
    pub time: Option<String>,
    /// Extension attributes, lowercase names.
    pub extensions: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

impl EventEnvelope {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            spec_version: SPEC_VERSION.to_string(),
            data_content_type: None,
            subject: None,
            time: None,
            extensions: BTreeMap::new(),
            data: data.into(),
        }
    }

    /// JSON data, with `datacontenttype` set accordingly.
    pub fn json(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: &Value,
    ) -> Self {
        Self::new(id, source, event_type, data.to_string().into_bytes())
            .with_content_type(JSON_CONTENT_TYPE)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.data_content_type = Some(content_type.into());
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Decode from whichever mode the message uses.
    pub fn decode(message: &BrokerMessage) -> Result<Self, DispatchError> {
        if header(&message.headers, &format!("{HEADER_PREFIX}{ATTR_SPEC_VERSION}")).is_some() {
            Self::from_binary(&message.headers, &message.payload)
        } else {
            Self::from_structured(&message.payload)
        }
    }

    pub fn from_binary(
        headers: &BTreeMap<String, String>,
        payload: &[u8],
    ) -> Result<Self, DispatchError> {
        let mut attributes = BTreeMap::new();
        let mut content_type = None;
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if name == CONTENT_TYPE_HEADER {
                content_type = Some(value.clone());
            } else if let Some(attribute) = name.strip_prefix(HEADER_PREFIX) {
                attributes.insert(attribute.to_string(), value.clone());
            }
        }

        let mut envelope = Self::from_attributes(attributes, payload.to_vec())?;
        if envelope.data_content_type.is_none() {
            envelope.data_content_type = content_type;
        }
        Ok(envelope)
    }

    pub fn from_structured(payload: &[u8]) -> Result<Self, DispatchError> {
        let object: Map<String, Value> = serde_json::from_slice(payload)
            .map_err(|e| DispatchError::Decode(format!("structured event is not a JSON object: {e}")))?;

        let mut attributes = BTreeMap::new();
        let mut data = None;
        let mut data_base64 = None;
        for (name, value) in object {
            match name.as_str() {
                ATTR_DATA => data = Some(value),
                ATTR_DATA_BASE64 => data_base64 = Some(value),
                _ => {
                    let value = match value {
                        Value::String(s) => s,
                        Value::Null => continue,
                        Value::Bool(_) | Value::Number(_) => value.to_string(),
                        other => {
                            return Err(DispatchError::Decode(format!(
                                "attribute {name} must be a scalar, got {other}"
                            )))
                        }
                    };
                    attributes.insert(name.to_ascii_lowercase(), value);
                }
            }
        }

        let bytes = match (data, data_base64) {
            (Some(_), Some(_)) => {
                return Err(DispatchError::Decode(
                    "both data and data_base64 are set".to_string(),
                ))
            }
            (None, Some(Value::String(encoded))) => BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| DispatchError::Decode(format!("invalid data_base64: {e}")))?,
            (None, Some(_)) => {
                return Err(DispatchError::Decode(
                    "data_base64 must be a string".to_string(),
                ))
            }
            (Some(Value::String(text)), None) if !is_json(attributes.get(ATTR_CONTENT_TYPE)) => {
                text.into_bytes()
            }
            (Some(value), None) => value.to_string().into_bytes(),
            (None, None) => Vec::new(),
        };

        Self::from_attributes(attributes, bytes)
    }

    fn from_attributes(
        mut attributes: BTreeMap<String, String>,
        data: Vec<u8>,
    ) -> Result<Self, DispatchError> {
        let mut required = |name: &str| {
            attributes
                .remove(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| DispatchError::Decode(format!("missing required attribute {name}")))
        };
        let spec_version = required(ATTR_SPEC_VERSION)?;
        let id = required(ATTR_ID)?;
        let source = required(ATTR_SOURCE)?;
        let event_type = required(ATTR_TYPE)?;
        if spec_version != SPEC_VERSION {
            return Err(DispatchError::Decode(format!(
                "unsupported specversion {spec_version}"
            )));
        }

        Ok(Self {
            id,
            source,
            event_type,
            spec_version,
            data_content_type: attributes.remove(ATTR_CONTENT_TYPE),
            subject: attributes.remove(ATTR_SUBJECT),
            time: attributes.remove(ATTR_TIME),
            extensions: attributes,
            data,
        })
    }

    /// Binary-mode attribute headers, `content-type` included when known.
    pub fn binary_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        let mut put = |name: &str, value: &str| {
            headers.insert(format!("{HEADER_PREFIX}{name}"), value.to_string());
        };
        put(ATTR_SPEC_VERSION, &self.spec_version);
        put(ATTR_ID, &self.id);
        put(ATTR_SOURCE, &self.source);
        put(ATTR_TYPE, &self.event_type);
        if let Some(subject) = &self.subject {
            put(ATTR_SUBJECT, subject);
        }
        if let Some(time) = &self.time {
            put(ATTR_TIME, time);
        }
        for (name, value) in &self.extensions {
            put(name, value);
        }
        if let Some(content_type) = &self.data_content_type {
            headers.insert(CONTENT_TYPE_HEADER.to_string(), content_type.clone());
        }
        headers
    }

    /// Structured-mode JSON payload. JSON data is embedded as-is, anything
    /// else goes into `data_base64`.
    pub fn to_structured(&self) -> Vec<u8> {
        let mut object = Map::new();
        let mut put = |name: &str, value: &str| {
            object.insert(name.to_string(), Value::String(value.to_string()));
        };
        put(ATTR_SPEC_VERSION, &self.spec_version);
        put(ATTR_ID, &self.id);
        put(ATTR_SOURCE, &self.source);
        put(ATTR_TYPE, &self.event_type);
        if let Some(content_type) = &self.data_content_type {
            put(ATTR_CONTENT_TYPE, content_type);
        }
        if let Some(subject) = &self.subject {
            put(ATTR_SUBJECT, subject);
        }
        if let Some(time) = &self.time {
            put(ATTR_TIME, time);
        }
        for (name, value) in &self.extensions {
            put(name, value);
        }

        let json_data = is_json(self.data_content_type.as_ref())
            .then(|| serde_json::from_slice::<Value>(&self.data).ok())
            .flatten();
        match json_data {
            Some(value) => {
                object.insert(ATTR_DATA.to_string(), value);
            }
            None if !self.data.is_empty() => {
                object.insert(
                    ATTR_DATA_BASE64.to_string(),
                    Value::String(BASE64.encode(&self.data)),
                );
            }
            None => {}
        }
        Value::Object(object).to_string().into_bytes()
    }
}

fn header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn is_json(content_type: Option<&String>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let media = ct.split(';').next().unwrap_or_default().trim();
            media.eq_ignore_ascii_case(JSON_CONTENT_TYPE) || media.ends_with("+json")
        }
    }
}
