//! Request and response messages exchanged between master and remote

use std::collections::BTreeMap;
use std::fmt;

use graft_core::{Handle, Wire};
use serde::{Deserialize, Deserializer, Serialize};

/// `nargout` value that lets the remote pick the number of outputs
pub const AUTO_NARGOUT: i64 = -1;

/// Error identifiers raised by the runtime itself rather than by user code
pub mod identifiers {
    /// Global variable does not exist
    pub const NO_VARIABLE: &str = "GRAFT:novariable";
    /// Function or method does not exist
    pub const NO_FUNCTION: &str = "GRAFT:nofunction";
    /// Object has no such property
    pub const NO_PROPERTY: &str = "GRAFT:noproperty";
    /// Handle was never allocated or has been released
    pub const INVALID_HANDLE: &str = "GRAFT:invalidHandle";
    /// Call aborted by an interrupt
    pub const INTERRUPTED: &str = "GRAFT:interrupted";
    /// Argument of the wrong type or count
    pub const BAD_ARGUMENT: &str = "GRAFT:badArgument";
    /// Value could not be decoded
    pub const BAD_VALUE: &str = "GRAFT:badValue";

    /// Identifiers meaning "no such name or handle"
    pub fn is_lookup(identifier: &str) -> bool {
        matches!(
            identifier,
            NO_VARIABLE | NO_FUNCTION | NO_PROPERTY | INVALID_HANDLE
        )
    }
}

/// Messages sent from the master to the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Shut the remote down after acknowledging
    Die,

    /// Assign a global variable
    #[serde(alias = "put")]
    SetGlobal { name: String, value: Wire },

    /// Read a global variable
    #[serde(alias = "get")]
    GetGlobal { name: String },

    /// Assign a property of a remote object
    SetProxy {
        handle: Handle,
        name: String,
        value: Wire,
    },

    /// Read a property of a remote object
    GetProxy { handle: Handle, name: String },

    /// Release a handle
    DelProxy { handle: Handle },

    /// Invoke a function by name or handle
    Call {
        name: CallTarget,
        #[serde(default)]
        args: Vec<Wire>,
        #[serde(default)]
        kwargs: BTreeMap<String, Wire>,
        #[serde(default = "auto_nargout", deserialize_with = "lenient_int")]
        nargout: i64,
    },
}

impl Request {
    /// Message kind as written in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Die => "die",
            Request::SetGlobal { .. } => "set_global",
            Request::GetGlobal { .. } => "get_global",
            Request::SetProxy { .. } => "set_proxy",
            Request::GetProxy { .. } => "get_proxy",
            Request::DelProxy { .. } => "del_proxy",
            Request::Call { .. } => "call",
        }
    }

    /// Call with positional arguments only and remote-chosen output count
    pub fn call(name: impl Into<CallTarget>, args: Vec<Wire>) -> Self {
        Request::Call {
            name: name.into(),
            args,
            kwargs: BTreeMap::new(),
            nargout: AUTO_NARGOUT,
        }
    }
}

fn auto_nargout() -> i64 {
    AUTO_NARGOUT
}

/// What a `call` request invokes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallTarget {
    Handle(Handle),
    Name(String),
}

impl From<&str> for CallTarget {
    fn from(name: &str) -> Self {
        CallTarget::Name(name.to_string())
    }
}

impl From<String> for CallTarget {
    fn from(name: String) -> Self {
        CallTarget::Name(name)
    }
}

impl From<Handle> for CallTarget {
    fn from(handle: Handle) -> Self {
        CallTarget::Handle(handle)
    }
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Handle(h) => write!(f, "<function {}>", h),
            CallTarget::Name(name) => f.write_str(name),
        }
    }
}

/// Messages sent from the remote to the master; exactly one per request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Value { value: Wire },
    Error(ErrorReply),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ack => "ack",
            Response::Value { .. } => "value",
            Response::Error(_) => "error",
        }
    }
}

/// Payload of an `error` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
    #[serde(default)]
    pub identifier: String,
    /// Innermost frame first; a single bare frame is accepted and wrapped
    #[serde(default, deserialize_with = "one_or_many_frames")]
    pub stack: Vec<StackFrame>,
    #[serde(default)]
    pub original_message: Option<String>,
}

impl ErrorReply {
    pub fn new(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            original_message: Some(message.clone()),
            message,
            identifier: identifier.into(),
            stack: Vec::new(),
        }
    }

    pub fn with_stack(mut self, stack: Vec<StackFrame>) -> Self {
        self.stack = stack;
        self
    }
}

/// One frame of a remote stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub line: i64,
    #[serde(default)]
    pub name: String,
}

impl StackFrame {
    pub fn new(file: Option<String>, line: i64, name: impl Into<String>) -> Self {
        Self {
            file,
            line,
            name: name.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StackRepr {
    Frames(Vec<StackFrame>),
    Single(StackFrame),
}

/// Normalise a stack sent as a list, a single frame, or nothing
fn one_or_many_frames<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<StackFrame>, D::Error> {
    Ok(match Option::<StackRepr>::deserialize(deserializer)? {
        Some(StackRepr::Frames(frames)) => frames,
        Some(StackRepr::Single(frame)) => vec![frame],
        None => Vec::new(),
    })
}

/// Integer that may have been sent as an integral float
fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let wire = Wire::deserialize(deserializer)?;
    wire.as_i64().ok_or_else(|| {
        serde::de::Error::custom(format!("expected an integer, got {}", wire.kind()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::MessageFormat;

    #[test]
    fn test_request_tags() {
        let json = serde_json::to_value(Request::GetGlobal {
            name: "x".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "get_global", "name": "x"}));

        let json = serde_json::to_value(Request::DelProxy { handle: Handle(3) }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "del_proxy", "handle": 3}));

        assert_eq!(serde_json::to_value(Request::Die).unwrap(), serde_json::json!({"type": "die"}));
    }

    #[test]
    fn test_short_aliases() {
        let put: Request = serde_json::from_str(r#"{"type": "put", "name": "a", "value": 1}"#).unwrap();
        assert_eq!(
            put,
            Request::SetGlobal {
                name: "a".to_string(),
                value: Wire::Int(1)
            }
        );
        let get: Request = serde_json::from_str(r#"{"type": "get", "name": "a"}"#).unwrap();
        assert_eq!(get.kind(), "get_global");
    }

    #[test]
    fn test_call_defaults_and_targets() {
        let call: Request = serde_json::from_str(r#"{"type": "call", "name": 4.0}"#).unwrap();
        assert_eq!(
            call,
            Request::Call {
                name: CallTarget::Handle(Handle(4)),
                args: vec![],
                kwargs: BTreeMap::new(),
                nargout: AUTO_NARGOUT,
            }
        );
        let call: Request =
            serde_json::from_str(r#"{"type": "call", "name": "sum", "args": [1], "nargout": 2.0}"#)
                .unwrap();
        let Request::Call { name, nargout, .. } = call else {
            panic!("expected a call");
        };
        assert_eq!(name, CallTarget::from("sum"));
        assert_eq!(nargout, 2);
    }

    #[test]
    fn test_single_frame_stack_is_wrapped() {
        let reply: Response = serde_json::from_str(
            r#"{"type": "error", "message": "boom", "identifier": "X:y",
                "stack": {"file": "/tmp/a.rs", "line": 3.0, "name": "f"}}"#,
        )
        .unwrap();
        let Response::Error(err) = reply else {
            panic!("expected an error reply");
        };
        assert_eq!(
            err.stack,
            vec![StackFrame::new(Some("/tmp/a.rs".to_string()), 3, "f")]
        );
        assert_eq!(err.original_message, None);

        let reply: Response =
            serde_json::from_str(r#"{"type": "error", "message": "m", "stack": null}"#).unwrap();
        let Response::Error(err) = reply else {
            panic!("expected an error reply");
        };
        assert!(err.stack.is_empty());
    }

    #[test]
    fn test_cbor_carries_binary_values() {
        let request = Request::SetProxy {
            handle: Handle(1),
            name: "data".to_string(),
            value: Wire::Bin(vec![9, 8, 7]),
        };
        let bytes = MessageFormat::Cbor.to_bytes(&request).unwrap();
        let back: Request = MessageFormat::Cbor.from_bytes(&bytes).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_error_reply_roundtrip() {
        let reply = Response::Error(
            ErrorReply::new("GRAFT:novariable", "Undefined variable 'q'")
                .with_stack(vec![StackFrame::new(None, 0, "get_global")]),
        );
        for format in [MessageFormat::Json, MessageFormat::Cbor] {
            let bytes = format.to_bytes(&reply).unwrap();
            let back: Response = format.from_bytes(&bytes).unwrap();
            assert_eq!(back, reply);
        }
    }
}
