//! Lanshake wire protocol.
//!
//! Every request and response is a JSON object whose field names come from a
//! fixed vocabulary (see [`keys`]). Objects travel over TCP inside a simple
//! length-delimited frame:
//!
//! ```text
//! ┌────────────────┬──────────────────────────────────┐
//! │     Length     │             Payload              │
//! │ 4 bytes (BE)   │  UTF-8 JSON object (Length bytes) │
//! └────────────────┴──────────────────────────────────┘
//! ```
//!
//! The handshake is an empty object answered with `deviceInfo` + `appInfo`.
//! Unknown fields are ignored on decode; a missing required field fails with
//! [`Error::MissingField`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Length prefix size in bytes
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Field names and fixed values of the wire vocabulary.
///
/// These strings are part of the protocol and must never change.
pub mod keys {
    /// Request discriminator
    pub const REQUEST: &str = "request";
    /// Outcome of a request
    pub const RESULT: &str = "result";
    /// Transfer request value of [`REQUEST`]
    pub const REQUEST_TRANSFER: &str = "requestTransfer";
    /// Reply value of [`REQUEST`]
    pub const REQUEST_RESPONSE: &str = "requestResponse";
    /// Clipboard request value of [`REQUEST`]
    pub const REQUEST_CLIPBOARD: &str = "requestClipboard";
    /// Entry number in the data phase
    pub const REQUEST_ID: &str = "requestId";
    /// Transfer group id
    pub const GROUP_ID: &str = "groupId";
    /// Data-phase port
    pub const SOCKET_PORT: &str = "socketPort";
    /// Accept/reject decision
    pub const IS_ACCEPTED: &str = "isAccepted";
    /// Clipboard payload
    pub const CLIPBOARD_TEXT: &str = "clipboardText";
    /// Auxiliary status flag
    pub const FLAG: &str = "flag";
    /// Value of [`FLAG`] when the group id is already taken
    pub const FLAG_GROUP_EXISTS: &str = "flagGroupExists";
    /// File index array
    pub const FILES_INDEX: &str = "filesIndex";
    /// Entry name
    pub const FILE: &str = "file";
    /// Entry size in bytes
    pub const FILE_SIZE: &str = "fileSize";
    /// Entry MIME type
    pub const FILE_MIME: &str = "fileMime";
    /// Entry is a directory
    pub const DIRECTORY: &str = "directory";
    /// Device description object
    pub const DEVICE_INFO: &str = "deviceInfo";
    /// Device brand
    pub const BRAND: &str = "brand";
    /// Device model
    pub const MODEL: &str = "model";
    /// Device nickname
    pub const USER: &str = "user";
    /// Device id
    pub const DEVICE_ID: &str = "deviceId";
    /// Application description object
    pub const APP_INFO: &str = "appInfo";
    /// Application version name
    pub const VERSION_NAME: &str = "versionName";
    /// Application version code
    pub const VERSION_CODE: &str = "versionCode";
    /// Bytes of the current entry already delivered
    pub const SKIPPED_BYTES: &str = "skippedBytes";
    /// Error discriminator
    pub const ERROR: &str = "error";
    /// Value of [`ERROR`] for refused requests
    pub const NOT_ALLOWED: &str = "notAllowed";
    /// Value of [`ERROR`] for unknown requests
    pub const NOT_FOUND: &str = "notFound";
}

/// Error values carried in the `error` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requester is not allowed to do this
    NotAllowed,
    /// The request or target is unknown
    NotFound,
}

impl ErrorKind {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAllowed => keys::NOT_ALLOWED,
            Self::NotFound => keys::NOT_FOUND,
        }
    }

    /// Parse the wire representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            keys::NOT_ALLOWED => Some(Self::NotAllowed),
            keys::NOT_FOUND => Some(Self::NotFound),
            _ => None,
        }
    }
}

/// A keyed message: one JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message(Map<String, Value>);

impl Message {
    /// Create an empty message (the handshake request).
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Whether the message carries no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a field is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Raw field access.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The `request` discriminator, if any.
    #[must_use]
    pub fn request(&self) -> Option<&str> {
        self.opt_str(keys::REQUEST)
    }

    /// The `result` flag; absent counts as `false`.
    #[must_use]
    pub fn result(&self) -> bool {
        self.opt_bool(keys::RESULT).unwrap_or(false)
    }

    /// The `error` field, if it holds a known value.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.opt_str(keys::ERROR).and_then(ErrorKind::parse)
    }

    /// Optional string field.
    #[must_use]
    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Optional unsigned integer field.
    #[must_use]
    pub fn opt_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// Optional boolean field.
    #[must_use]
    pub fn opt_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Required string field.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.opt_str(key)
            .ok_or_else(|| Error::MissingField(key.to_string()))
    }

    /// Required signed integer field.
    pub fn require_i64(&self, key: &str) -> Result<i64> {
        self.0
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::MissingField(key.to_string()))
    }

    /// Required unsigned integer field.
    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.opt_u64(key)
            .ok_or_else(|| Error::MissingField(key.to_string()))
    }

    /// Required boolean field.
    pub fn require_bool(&self, key: &str) -> Result<bool> {
        self.opt_bool(key)
            .ok_or_else(|| Error::MissingField(key.to_string()))
    }

    /// Required nested object field.
    pub fn require_message(&self, key: &str) -> Result<Self> {
        match self.0.get(key) {
            Some(Value::Object(map)) => Ok(Self(map.clone())),
            _ => Err(Error::MissingField(key.to_string())),
        }
    }

    /// Encode to a JSON byte payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a JSON byte payload; anything other than an object is malformed.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(data).map_err(|e| Error::MalformedMessage(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::MalformedMessage(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Self::Object(message.0)
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `deviceInfo` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Manufacturer or OS family
    pub brand: String,
    /// Hardware model
    pub model: String,
    /// User-visible nickname (`user` on the wire)
    pub nickname: String,
    /// Stable device id
    pub device_id: String,
}

impl DeviceInfo {
    fn to_message(&self) -> Message {
        Message::new()
            .with(keys::BRAND, self.brand.as_str())
            .with(keys::MODEL, self.model.as_str())
            .with(keys::USER, self.nickname.as_str())
            .with(keys::DEVICE_ID, self.device_id.as_str())
    }

    fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            brand: message.require_str(keys::BRAND)?.to_string(),
            model: message.require_str(keys::MODEL)?.to_string(),
            nickname: message.require_str(keys::USER)?.to_string(),
            device_id: message.require_str(keys::DEVICE_ID)?.to_string(),
        })
    }
}

/// `appInfo` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    /// Human-readable version
    pub version_name: String,
    /// Monotonic version number
    pub version_code: i64,
}

impl AppInfo {
    fn to_message(&self) -> Message {
        Message::new()
            .with(keys::VERSION_NAME, self.version_name.as_str())
            .with(keys::VERSION_CODE, self.version_code)
    }

    fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            version_name: message.require_str(keys::VERSION_NAME)?.to_string(),
            version_code: message.require_i64(keys::VERSION_CODE)?,
        })
    }
}

/// Identity block carried by handshake replies and by transfer and clipboard requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Device description
    pub device: DeviceInfo,
    /// Application description
    pub app: AppInfo,
}

impl HandshakePayload {
    /// Write `deviceInfo` and `appInfo` into an existing message.
    pub fn write_into(&self, message: &mut Message) {
        message.insert(keys::DEVICE_INFO, self.device.to_message());
        message.insert(keys::APP_INFO, self.app.to_message());
    }

    /// Standalone message holding only the identity block.
    #[must_use]
    pub fn to_message(&self) -> Message {
        let mut message = Message::new();
        self.write_into(&mut message);
        message
    }

    /// Read the identity block from a message.
    pub fn from_message(message: &Message) -> Result<Self> {
        let device = DeviceInfo::from_message(&message.require_message(keys::DEVICE_INFO)?)?;
        let app = AppInfo::from_message(&message.require_message(keys::APP_INFO)?)?;
        Ok(Self { device, app })
    }
}

/// One entry of a `filesIndex` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexEntry {
    /// Relative name
    #[serde(rename = "file")]
    pub name: String,
    /// Size in bytes (0 for directories)
    #[serde(rename = "fileSize", default)]
    pub size: u64,
    /// MIME type
    #[serde(rename = "fileMime", default = "default_mime")]
    pub mime: String,
    /// Whether this entry is a directory
    #[serde(rename = "directory", default)]
    pub is_directory: bool,
    /// Where the bytes come from on the sending side; never transmitted
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

/// Encode a file index as a JSON array value.
pub fn encode_index(entries: &[FileIndexEntry]) -> Result<Value> {
    serde_json::to_value(entries).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode the `filesIndex` field of a message.
pub fn decode_index(message: &Message) -> Result<Vec<FileIndexEntry>> {
    let value = message
        .get(keys::FILES_INDEX)
        .ok_or_else(|| Error::MissingField(keys::FILES_INDEX.to_string()))?;
    serde_json::from_value(value.clone()).map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// Read one length-delimited frame.
///
/// # Errors
///
/// Returns an error if reading fails or the announced length is too large.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(Error::MalformedMessage(format!(
            "payload too large: {length} bytes"
        )));
    }

    let mut payload = vec![0u8; length];
    if length > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok(payload)
}

/// Write one length-delimited frame.
///
/// # Errors
///
/// Returns an error if writing fails or the payload is too large.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::InvalidInput(format!(
            "payload too large: {} bytes",
            payload.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read and decode one message.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader).await?;
    Message::decode(&payload)
}

/// Encode and write one message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &message.encode()?).await
}

/// Read one message, failing with `Error::Timeout` after `duration`.
pub async fn read_message_with_timeout<R>(reader: &mut R, duration: Duration) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    timeout(duration, read_message(reader))
        .await
        .map_err(|_| Error::Timeout(millis(duration)))?
}

/// Write one message, failing with `Error::Timeout` after `duration`.
pub async fn write_message_with_timeout<W>(
    writer: &mut W,
    message: &Message,
    duration: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(duration, write_message(writer, message))
        .await
        .map_err(|_| Error::Timeout(millis(duration)))?
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
