//! Client API protocol implementation for the Calliope document server.
//!
//! Everything that crosses the WebSocket between a Calliope client and the
//! server is described here: outbound [`Message`]s carrying a [`Functor`] to
//! invoke on a remote target, inbound [`Response`]s correlated by message id,
//! the [`Remote`] sentinel that directs a client to materialize a proxy, and
//! the [`CodedError`] shape used for all server-reported failures.
//!
//! Frames are JSON text; encoding and decoding is plain [`serde_json`] over
//! the types in this crate.

#![allow(clippy::module_name_repetitions)]
#![warn(missing_docs)]

mod delta;
mod state;

use std::fmt;

use derive_more::{Display, From};
use serde::{de::Deserializer, ser::Serializer, Deserialize, Serialize};
use serde_json::Value;

#[doc(inline)]
pub use self::{
    delta::{Delta, DeltaOp, DeltaRangeError},
    state::{
        Change, PropertyChange, PropertyDelta, PropertyOp, PropertySnapshot,
        Snapshot,
    },
};

/// Well-known wire-visible error codes.
pub mod codes {
    /// Outer wrapping code applied by a client to every error that arrived
    /// from the remote side of a connection.
    pub const REMOTE_ERROR: &str = "remoteError";

    /// A blocking call gave up waiting. Clients treat this as a benign
    /// signal to re-poll, not as a failure.
    pub const TIMED_OUT: &str = "timedOut";
}

/// ID of a server-side object addressable over a connection.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, PartialEq, Serialize, Deserialize,
)]
#[from(forward)]
pub struct TargetId(pub String);

/// Opaque credential usable in place of a [`TargetId`].
///
/// The transport coerces it into a [`TargetId`] when resolving a send, so a
/// caller holding only a token can address the target it authorizes.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, PartialEq, Serialize, Deserialize,
)]
#[from(forward)]
pub struct BearerToken(pub String);

impl BearerToken {
    /// Coerces this token into the [`TargetId`] it authorizes.
    #[must_use]
    pub fn target_id(&self) -> TargetId {
        TargetId(self.0.clone())
    }
}

/// Short string assigned by the server to a single connection.
///
/// Included in log messages and in every connection-level error raised
/// against that connection.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, PartialEq, Serialize, Deserialize,
)]
#[from(forward)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Placeholder id used before the handshake completes and after a
    /// connection reset.
    #[must_use]
    pub fn unknown() -> Self {
        Self(String::from("unknown"))
    }

    /// Indicates whether this id is the pre-handshake placeholder.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == "unknown"
    }
}

/// ID of a document hosted by the server.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, PartialEq, Serialize, Deserialize,
)]
#[from(forward)]
pub struct DocumentId(pub String);

/// ID of a caret within a document.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, PartialEq, Serialize, Deserialize,
)]
#[from(forward)]
pub struct CaretId(pub String);

/// Document revision number. Non-decreasing over the life of a session.
#[derive(
    Clone, Copy, Debug, Default, Display, Eq, Hash, Ord, PartialEq,
    PartialOrd, Serialize, Deserialize,
)]
pub struct RevNum(pub u64);

/// `(name, args)` pair identifying a method to invoke on a target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Functor {
    /// Name of the method.
    pub name: String,

    /// Positional arguments, already in wire form.
    pub args: Vec<Value>,
}

impl Functor {
    /// Builds a new [`Functor`] from a method name and its arguments.
    #[inline]
    #[must_use]
    pub fn new<N: Into<String>>(name: N, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for Functor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} args)", self.name, self.args.len())
    }
}

/// Outbound method call addressed to a target.
///
/// Ids are assigned monotonically from `0` for the life of a single
/// transport connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id of this call.
    pub id: u64,

    /// Target the call is addressed to.
    pub target: TargetId,

    /// Method to invoke.
    pub payload: Functor,
}

/// Structured error reported by the server (or wrapped by a client).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodedError {
    /// Machine-readable error code.
    pub code: String,

    /// Code-specific details.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<Value>,

    /// Underlying error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<CodedError>>,
}

impl CodedError {
    /// Builds a new [`CodedError`] with the given `code` and `info`.
    #[must_use]
    pub fn new<C: Into<String>>(code: C, info: Vec<Value>) -> Self {
        Self {
            code: code.into(),
            info,
            cause: None,
        }
    }

    /// Returns this error with the given `cause` attached.
    #[must_use]
    pub fn caused_by(mut self, cause: CodedError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Builds the [`codes::TIMED_OUT`] error for the given budget.
    #[must_use]
    pub fn timed_out(millis: u64) -> Self {
        Self::new(codes::TIMED_OUT, vec![Value::from(millis)])
    }

    /// Wraps `original` into the [`codes::REMOTE_ERROR`] envelope naming the
    /// connection it arrived over, preserving the original payload as the
    /// cause.
    #[must_use]
    pub fn remote_error(connection_id: &ConnectionId, original: Self) -> Self {
        Self::new(codes::REMOTE_ERROR, vec![Value::from(connection_id.0.as_str())])
            .caused_by(original)
    }

    /// Indicates whether this error, or any error in its cause chain,
    /// carries the given `code`.
    #[must_use]
    pub fn has_code(&self, code: &str) -> bool {
        let mut cur = Some(self);
        while let Some(err) = cur {
            if err.code == code {
                return true;
            }
            cur = err.cause.as_deref();
        }
        false
    }
}

impl fmt::Display for CodedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(cause) = &self.cause {
            write!(f, " <- {}", cause)?;
        }
        Ok(())
    }
}

/// Tag key marking class-tagged values inside an otherwise untyped
/// [`Response`] result.
const TYPE_TAG: &str = "@type";

/// Tag value of the [`Remote`] sentinel.
const REMOTE_TAG: &str = "remote";

/// Sentinel result directing a client to materialize a proxy for the named
/// target instead of treating the result as plain data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Remote {
    /// Target the proxy should address.
    pub target_id: TargetId,
}

impl Remote {
    /// Recognizes the [`Remote`] sentinel in a decoded result value.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.get(TYPE_TAG)?.as_str()? != REMOTE_TAG {
            return None;
        }
        let target_id = map.get("targetId")?.as_str()?;
        Some(Self {
            target_id: TargetId::from(target_id),
        })
    }

    /// Encodes this sentinel into its wire value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(TYPE_TAG.into(), Value::from(REMOTE_TAG));
        map.insert("targetId".into(), Value::from(self.target_id.0.as_str()));
        Value::Object(map)
    }
}

/// Reply to a [`Message`], correlated by id.
///
/// Carries exactly one of a result value or a [`CodedError`]; the
/// constructors and the decoder both enforce this.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Id of the [`Message`] this responds to.
    pub id: u64,

    payload: Result<Value, CodedError>,
}

impl Response {
    /// Builds a successful [`Response`].
    #[inline]
    #[must_use]
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            payload: Ok(result),
        }
    }

    /// Builds a failed [`Response`].
    #[inline]
    #[must_use]
    pub fn error(id: u64, error: CodedError) -> Self {
        Self {
            id,
            payload: Err(error),
        }
    }

    /// Borrows the payload of this [`Response`].
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &Result<Value, CodedError> {
        &self.payload
    }

    /// Unwraps this [`Response`] into its payload.
    #[inline]
    #[must_use]
    pub fn into_payload(self) -> Result<Value, CodedError> {
        self.payload
    }
}

impl Serialize for Response {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct as _;

        let mut frame = serializer.serialize_struct("Response", 2)?;
        frame.serialize_field("id", &self.id)?;
        match &self.payload {
            Ok(result) => frame.serialize_field("result", result)?,
            Err(error) => frame.serialize_field("error", error)?,
        }
        frame.end()
    }
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as _;

        let frame = Value::deserialize(deserializer)?;
        response_from_value(frame).map_err(D::Error::custom)
    }
}

/// Decodes a [`Response`] out of an already-parsed frame [`Value`].
fn response_from_value(frame: Value) -> Result<Response, String> {
    let map = frame
        .as_object()
        .ok_or_else(|| format!("response is not an object [{:?}]", frame))?;

    let id = map
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("response without a valid id [{:?}]", frame))?;

    let error = map.get("error").filter(|e| !e.is_null());
    let result = map.get("result").filter(|r| !r.is_null());
    match (result, error) {
        (Some(_), Some(_)) => {
            Err(format!("response with both result and error [{:?}]", frame))
        }
        (_, Some(err)) => {
            let err: CodedError = serde_json::from_value(err.clone())
                .map_err(|e| format!("malformed coded error: {}", e))?;
            Ok(Response::error(id, err))
        }
        (result, None) => {
            Ok(Response::ok(id, result.cloned().unwrap_or(Value::Null)))
        }
    }
}

/// Frame received by a client from the server.
///
/// Almost always a [`Response`] to an earlier call, but the server may also
/// originate [`Message`]s of its own (the in-band `meta.close` notification).
#[derive(Clone, Debug, From, PartialEq)]
pub enum ServerFrame {
    /// Reply to an earlier client call.
    Response(Response),

    /// Unsolicited call originated by the server.
    Message(Message),
}

impl Serialize for ServerFrame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Response(response) => response.serialize(serializer),
            Self::Message(message) => message.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ServerFrame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as _;

        let frame = Value::deserialize(deserializer)?;
        let map = frame.as_object().ok_or_else(|| {
            D::Error::custom(format!("frame is not an object [{:?}]", frame))
        })?;

        if map.contains_key("target") {
            serde_json::from_value::<Message>(frame.clone())
                .map(Self::Message)
                .map_err(|e| {
                    D::Error::custom(format!("malformed message: {}", e))
                })
        } else {
            response_from_value(frame).map(Self::Response).map_err(D::Error::custom)
        }
    }
}
