//! Worker wire protocol.
//!
//! One message per websocket frame: a numeric type discriminant followed by
//! space-separated arguments. The last argument of a message takes the rest
//! of the frame verbatim, so free-form payloads (tokens, task data) may
//! contain spaces, quotes and JSON.

use crate::error::ProtocolError;
use crate::router::session::WorkerId;
use crate::task::TaskId;

/// Numeric discriminants shared with the browser client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ClearQueue = 0,
    Auth = 1,
    TaskStart = 2,
    TaskDone = 3,
    TaskFail = 4,
    NewTask = 5,
    CancelTask = 6,
    Reset = 7,
    BadAuthToken = 8,
    BadWorkerId = 9,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::ClearQueue,
            1 => Self::Auth,
            2 => Self::TaskStart,
            3 => Self::TaskDone,
            4 => Self::TaskFail,
            5 => Self::NewTask,
            6 => Self::CancelTask,
            7 => Self::Reset,
            8 => Self::BadAuthToken,
            9 => Self::BadWorkerId,
            _ => return None,
        })
    }

    /// Name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::ClearQueue => "CLEAR_QUEUE",
            Self::Auth => "AUTH",
            Self::TaskStart => "DS_TASK_START",
            Self::TaskDone => "DS_TASK_DONE",
            Self::TaskFail => "DS_TASK_FAIL",
            Self::NewTask => "DW_NEW_TASK",
            Self::CancelTask => "DW_CANCEL_TASK",
            Self::Reset => "DW_RESET",
            Self::BadAuthToken => "DW_BAD_AUTH_TOKEN",
            Self::BadWorkerId => "DW_BAD_WORKER_ID",
        }
    }
}

/// A decoded wire message, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// worker → router: stop sending me work, I want to disconnect.
    ClearQueue,
    /// worker → router: authenticate this socket as `worker_id`.
    Auth { token: String, worker_id: WorkerId },
    /// router → worker: authentication accepted. Shares the AUTH code.
    AuthAccepted,
    /// worker → router
    TaskStart { task_id: TaskId },
    /// worker → router
    TaskDone { task_id: TaskId },
    /// worker → router
    TaskFail { task_id: TaskId },
    /// router → worker: run this task.
    NewTask {
        task_id: TaskId,
        function_id: String,
        additional_data: String,
    },
    /// router → worker: advisory, the worker may ignore it.
    CancelTask { task_id: TaskId },
    /// router → worker: router is restarting, reconnect later.
    Reset,
    /// router → worker: log in again.
    BadAuthToken,
    /// router → worker: register again.
    BadWorkerId,
}

impl WsMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::ClearQueue => MessageType::ClearQueue,
            Self::Auth { .. } | Self::AuthAccepted => MessageType::Auth,
            Self::TaskStart { .. } => MessageType::TaskStart,
            Self::TaskDone { .. } => MessageType::TaskDone,
            Self::TaskFail { .. } => MessageType::TaskFail,
            Self::NewTask { .. } => MessageType::NewTask,
            Self::CancelTask { .. } => MessageType::CancelTask,
            Self::Reset => MessageType::Reset,
            Self::BadAuthToken => MessageType::BadAuthToken,
            Self::BadWorkerId => MessageType::BadWorkerId,
        }
    }

    /// Encode as a single text frame.
    pub fn encode(&self) -> String {
        let code = self.kind().code();
        match self {
            Self::ClearQueue
            | Self::AuthAccepted
            | Self::Reset
            | Self::BadAuthToken
            | Self::BadWorkerId => code.to_string(),
            Self::Auth { token, worker_id } => format!("{code} {token} {worker_id}"),
            Self::TaskStart { task_id }
            | Self::TaskDone { task_id }
            | Self::TaskFail { task_id }
            | Self::CancelTask { task_id } => format!("{code} {task_id}"),
            Self::NewTask {
                task_id,
                function_id,
                additional_data,
            } => format!("{code} {task_id} {function_id} {additional_data}"),
        }
    }

    /// Decode a text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let frame = frame.trim_start();
        if frame.trim_end().is_empty() {
            return Err(ProtocolError::Empty);
        }

        let (type_token, rest) = match frame.split_once(' ') {
            Some((t, rest)) => (t, Some(rest)),
            None => (frame.trim_end(), None),
        };

        let kind = type_token
            .parse::<u8>()
            .ok()
            .and_then(MessageType::from_code)
            .ok_or_else(|| ProtocolError::UnknownType(type_token.to_string()))?;

        match kind {
            MessageType::ClearQueue => Ok(Self::ClearQueue),
            MessageType::Reset => Ok(Self::Reset),
            MessageType::BadAuthToken => Ok(Self::BadAuthToken),
            MessageType::BadWorkerId => Ok(Self::BadWorkerId),
            MessageType::Auth => decode_auth(rest),
            MessageType::TaskStart => Ok(Self::TaskStart {
                task_id: single_task_id(kind, rest)?,
            }),
            MessageType::TaskDone => Ok(Self::TaskDone {
                task_id: single_task_id(kind, rest)?,
            }),
            MessageType::TaskFail => Ok(Self::TaskFail {
                task_id: single_task_id(kind, rest)?,
            }),
            MessageType::CancelTask => Ok(Self::CancelTask {
                task_id: single_task_id(kind, rest)?,
            }),
            MessageType::NewTask => decode_new_task(rest),
        }
    }

    /// Decode a binary frame carrying UTF-8 text.
    pub fn decode_bytes(frame: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(text)
    }
}

/// Function ids travel as a single space-delimited argument, so they must be
/// non-empty and contain no spaces.
pub fn check_function_id(function_id: &str) -> Result<(), ProtocolError> {
    if function_id.is_empty() || function_id.contains(' ') {
        return Err(ProtocolError::InvalidFunctionId(function_id.to_string()));
    }
    Ok(())
}

// AUTH without arguments is the router's acknowledgement. From a worker it
// carries `<token> <workerId>`; the token may itself contain spaces
// (`Bearer abc`), so the worker id is taken from after the last space.
fn decode_auth(rest: Option<&str>) -> Result<WsMessage, ProtocolError> {
    let Some(rest) = rest.filter(|r| !r.trim().is_empty()) else {
        return Ok(WsMessage::AuthAccepted);
    };

    let Some((token, worker_id)) = rest.trim_end().rsplit_once(' ') else {
        return Err(ProtocolError::MissingArgs {
            kind: MessageType::Auth.name(),
            expected: 2,
            got: 1,
        });
    };

    Ok(WsMessage::Auth {
        token: token.to_string(),
        worker_id: parse_id("workerId", worker_id)?,
    })
}

fn decode_new_task(rest: Option<&str>) -> Result<WsMessage, ProtocolError> {
    let args: Vec<&str> = rest.map(|r| r.splitn(3, ' ').collect()).unwrap_or_default();
    if args.len() < 3 {
        return Err(ProtocolError::MissingArgs {
            kind: MessageType::NewTask.name(),
            expected: 3,
            got: args.iter().filter(|a| !a.is_empty()).count(),
        });
    }

    Ok(WsMessage::NewTask {
        task_id: parse_id("taskId", args[0])?,
        function_id: args[1].to_string(),
        additional_data: args[2].to_string(),
    })
}

fn single_task_id(kind: MessageType, rest: Option<&str>) -> Result<TaskId, ProtocolError> {
    match rest.map(str::trim).filter(|r| !r.is_empty()) {
        Some(raw) => parse_id("taskId", raw),
        None => Err(ProtocolError::MissingArgs {
            kind: kind.name(),
            expected: 1,
            got: 0,
        }),
    }
}

fn parse_id(field: &'static str, raw: &str) -> Result<i64, ProtocolError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ProtocolError::InvalidNumber {
            field,
            value: raw.to_string(),
        })
}
