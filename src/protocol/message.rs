//! Wire envelope exchanged with the coordination server.
//!
//! Messages are JSON objects. Field names follow the server's camelCase
//! schema; the PascalCase spelling used by older servers is accepted on
//! decode. Unknown fields are ignored.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::runner::task::Outcome;

/// The only protocol revision this runner speaks.
pub const PROTOCOL_VERSION: i64 = 1;

/// Message type tag, carried on the wire as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum MessageType {
    Register = 1,
    Error = 2,
    RequestBuild = 3,
    Idle = 4,
    BuildResult = 5,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        Self::Register,
        Self::Error,
        Self::RequestBuild,
        Self::Idle,
        Self::BuildResult,
    ];
}

impl TryFrom<i64> for MessageType {
    type Error = ProtocolError;

    fn try_from(code: i64) -> Result<Self, ProtocolError> {
        match code {
            1 => Ok(MessageType::Register),
            2 => Ok(MessageType::Error),
            3 => Ok(MessageType::RequestBuild),
            4 => Ok(MessageType::Idle),
            5 => Ok(MessageType::BuildResult),
            _ => Err(ProtocolError::UnsupportedType { code }),
        }
    }
}

impl From<MessageType> for i64 {
    fn from(kind: MessageType) -> Self {
        kind as i64
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Register => "register",
            Self::Error => "error",
            Self::RequestBuild => "request_build",
            Self::Idle => "idle",
            Self::BuildResult => "build_result",
        };
        write!(f, "{s}")
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(alias = "Version")]
    pub version: i64,

    #[serde(rename = "type", alias = "Type")]
    pub kind: MessageType,

    #[serde(
        rename = "runnerUUID",
        alias = "RunnerUUID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub runner_uuid: String,

    /// Empty until a task is assigned.
    #[serde(
        rename = "buildUUID",
        alias = "BuildUUID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub build_uuid: String,

    #[serde(rename = "errCode", alias = "ErrCode", default)]
    pub err_code: i64,

    #[serde(
        rename = "errContent",
        alias = "ErrContent",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub err_content: String,

    #[serde(
        rename = "eventName",
        alias = "EventName",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub event_name: String,

    #[serde(
        rename = "eventPayload",
        alias = "EventPayload",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub event_payload: String,

    /// Restricts execution to one job of the workflow; empty means all jobs.
    #[serde(
        rename = "jobID",
        alias = "JobID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub job_id: String,
}

/// Just enough of the envelope to gate on version and type before the
/// full decode.
#[derive(Deserialize)]
struct Header {
    #[serde(default, alias = "Version")]
    version: i64,
    #[serde(default, rename = "type", alias = "Type")]
    kind: i64,
}

impl Message {
    /// An empty version-1 message of the given type.
    pub fn new(kind: MessageType, runner_uuid: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            runner_uuid: runner_uuid.into(),
            build_uuid: String::new(),
            err_code: 0,
            err_content: String::new(),
            event_name: String::new(),
            event_payload: String::new(),
            job_id: String::new(),
        }
    }

    /// Announce this runner after connecting.
    pub fn register(runner_uuid: impl Into<String>) -> Self {
        Self::new(MessageType::Register, runner_uuid)
    }

    /// Ask the server for work.
    pub fn request_build(runner_uuid: impl Into<String>) -> Self {
        Self::new(MessageType::RequestBuild, runner_uuid)
    }

    /// Report the terminal outcome of one task.
    pub fn build_result(
        runner_uuid: impl Into<String>,
        build_uuid: impl Into<String>,
        outcome: &Outcome,
    ) -> Self {
        Self {
            build_uuid: build_uuid.into(),
            err_code: outcome.err_code(),
            err_content: outcome.err_content(),
            ..Self::new(MessageType::BuildResult, runner_uuid)
        }
    }

    /// Decode one message, rejecting unsupported versions and types.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header: Header = serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)?;
        if header.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                version: header.version,
            });
        }
        MessageType::try_from(header.kind)?;
        serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)
    }

    /// Encode to the JSON text sent over the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}
