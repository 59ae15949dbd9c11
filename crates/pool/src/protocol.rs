//! Messages exchanged between the coordinating side and execution units.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use nanoid::nanoid;
use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::image::RuntimeImage;

const ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

/// Correlation identity of one request/reply exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates `RequestId`s as `<prefix>-<salt>-<seq>`: the salt is random per
/// generator and the sequence never repeats within it.
pub struct RequestIdGen {
    prefix: &'static str,
    salt: String,
    seq: AtomicU64,
}

impl RequestIdGen {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            salt: nanoid!(8, &ID_ALPHABET),
            seq: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        RequestId(format!("{}-{}-{}", self.prefix, self.salt, seq))
    }
}

/// Identity of an execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn numbered(index: usize) -> Self {
        Self(format!("unit-{}", index + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Work a caller asks the pool to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    /// Require a script from the installed document root.
    Run { path: String },
    /// Run PHP source as given.
    RunInline { code: String },
}

impl Request {
    pub fn run(path: impl Into<String>) -> Self {
        Self::Run { path: path.into() }
    }

    pub fn inline(code: impl Into<String>) -> Self {
        Self::RunInline { code: code.into() }
    }

    /// Decode a request from its JSON wire form.
    pub fn from_json(value: serde_json::Value) -> Result<Self, PoolError> {
        let kind = value
            .get("type")
            .and_then(|kind| kind.as_str())
            .map(str::to_string);
        serde_json::from_value(value).map_err(|err| match kind {
            Some(kind) if kind != "run" && kind != "runInline" => {
                PoolError::Protocol(format!("unsupported message type: {kind}"))
            }
            _ => PoolError::Protocol(format!("malformed request: {err}")),
        })
    }
}

/// Messages delivered to an execution unit.
#[derive(Debug)]
pub enum UnitMessage {
    LoadImage(RuntimeImage),
    Configure { id: RequestId, debug: bool },
    CheckInstalled { id: RequestId },
    Install { id: RequestId },
    Execute {
        id: RequestId,
        request: Request,
        debug: bool,
    },
}

impl UnitMessage {
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            UnitMessage::LoadImage(_) => None,
            UnitMessage::Configure { id, .. }
            | UnitMessage::CheckInstalled { id }
            | UnitMessage::Install { id }
            | UnitMessage::Execute { id, .. } => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "camelCase")]
pub enum ReplyBody {
    Configured,
    Installed(bool),
    Output(String),
}

/// A unit's answer to one correlated message.
#[derive(Debug, Clone)]
pub struct UnitReply {
    pub id: RequestId,
    pub unit: UnitId,
    pub result: Result<ReplyBody, PoolError>,
}

impl UnitReply {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_per_generator_and_across_generators() {
        let first = RequestIdGen::new("req");
        let second = RequestIdGen::new("req");
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(first.next_id()));
            assert!(seen.insert(second.next_id()));
        }
        assert!(first.next_id().as_str().starts_with("req-"));
    }

    #[test]
    fn test_request_wire_form() {
        let value = serde_json::to_value(Request::inline("<?php echo 1;")).unwrap();
        assert_eq!(value, json!({ "type": "runInline", "code": "<?php echo 1;" }));
        let parsed = Request::from_json(json!({ "type": "run", "path": "index.php" })).unwrap();
        assert_eq!(parsed, Request::run("index.php"));
    }

    #[test]
    fn test_unknown_request_type_is_protocol_error() {
        let err = Request::from_json(json!({ "type": "evalJs", "code": "1" })).unwrap_err();
        assert_eq!(
            err,
            PoolError::Protocol("unsupported message type: evalJs".to_string())
        );
        let err = Request::from_json(json!({ "type": "run" })).unwrap_err();
        assert!(matches!(err, PoolError::Protocol(message) if message.starts_with("malformed")));
    }

    #[test]
    fn test_reply_body_shape() {
        let value = serde_json::to_value(ReplyBody::Installed(true)).unwrap();
        assert_eq!(value, json!({ "status": "installed", "result": true }));
        let value = serde_json::to_value(ReplyBody::Configured).unwrap();
        assert_eq!(value, json!({ "status": "configured" }));
    }
}
