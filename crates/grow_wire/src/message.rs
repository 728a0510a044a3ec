use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorKind, RemoteError};

/// Caller identity used for everything that originates in the orchestrator.
pub const ORCHESTRATOR: &str = "@field";

/// Name of the proc that lives inside the orchestrator's own runtime.
pub const MAIN_PROC: &str = "main";

/// A remote method invocation.
///
/// `call_id` is unique per call and is what the answering [`CallResult`] is
/// correlated by. `session_id` and `request_id` ride along untouched through
/// every hop so nested calls stay attributable to the original request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub caller: String,
    pub receiver: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub request_id: String,
    pub call_id: String,
}

impl Call {
    pub fn new(
        caller: impl Into<String>,
        receiver: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            caller: caller.into(),
            receiver: receiver.into(),
            method: method.into(),
            args,
            session_id: String::new(),
            request_id: Uuid::new_v4().to_string(),
            call_id: Uuid::new_v4().to_string(),
        }
    }
}

/// The answer to exactly one [`Call`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CallResult {
    Success {
        #[serde(default)]
        result: Value,
        receiver: String,
        call_id: String,
    },
    Error {
        name: String,
        message: String,
        receiver: String,
        call_id: String,
    },
}

impl CallResult {
    /// Success answer addressed back to the caller of `call`.
    pub fn success(call: &Call, result: Value) -> Self {
        CallResult::Success {
            result,
            receiver: call.caller.clone(),
            call_id: call.call_id.clone(),
        }
    }

    pub fn failure(call: &Call, error: RemoteError) -> Self {
        CallResult::Error {
            name: error.name,
            message: error.message,
            receiver: call.caller.clone(),
            call_id: call.call_id.clone(),
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            CallResult::Success { call_id, .. } | CallResult::Error { call_id, .. } => call_id,
        }
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            CallResult::Success { result, .. } => Ok(result),
            CallResult::Error { name, message, .. } => Err(RemoteError { name, message }),
        }
    }
}

/// Fire-and-forget message delivered through the reliable queue.
///
/// `args[0]` is what listeners match against; the receiving proc answers
/// with a [`SendAck`] carrying the same `send_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMsg {
    pub caller: String,
    pub receiver: String,
    pub receiver_proc: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub request_id: String,
    pub send_id: String,
}

impl SendMsg {
    pub fn ack(&self) -> SendAck {
        SendAck {
            caller: self.caller.clone(),
            receiver: self.receiver.clone(),
            send_id: self.send_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    #[serde(default)]
    pub caller: String,
    pub receiver: String,
    pub send_id: String,
}

/// Everything a proc needs to bootstrap itself.
///
/// `field` is the transferable (contract-free) view of the validated field.
/// `port_names` lists the peer procs whose ports travel alongside this
/// message; it is empty for procs that are reached over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    pub field: Value,
    pub proc: String,
    #[serde(default)]
    pub port_names: Vec<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

/// Envelope exchanged between procs, over ports as well as over the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Message {
    Ready {},
    Init(InitParams),
    Reinit(InitParams),
    InitComplete {},
    InitFailure(RemoteError),
    Call(Call),
    CallResult(CallResult),
    Send(SendMsg),
    SendAck(SendAck),
    RestartMe {},
    Kill {},
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ready {} => "ready",
            Message::Init(_) => "init",
            Message::Reinit(_) => "reinit",
            Message::InitComplete {} => "initComplete",
            Message::InitFailure(_) => "initFailure",
            Message::Call(_) => "call",
            Message::CallResult(_) => "callResult",
            Message::Send(_) => "send",
            Message::SendAck(_) => "sendAck",
            Message::RestartMe {} => "restartMe",
            Message::Kill {} => "kill",
        }
    }
}

/// Body of a bridge request. Control messages that an external proc sends
/// to the orchestrator name themselves through `proc_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_name: Option<String>,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self { proc_name: None, message }
    }

    pub fn from_proc(proc_name: impl Into<String>, message: Message) -> Self {
        Self {
            proc_name: Some(proc_name.into()),
            message,
        }
    }
}

/// Error body returned by the bridge for rejected requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeFault {
    pub error: ErrorKind,
    #[serde(default)]
    pub message: String,
}
