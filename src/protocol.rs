//! Newline-delimited JSON requests and replies.
//!
//! A request is one JSON object per line:
//! `{"user": "priya@campus.edu", "op": "book", "game": "Tennis", "date": "2026-10-23", "time": "15:00"}`.
//! `user` is the handle the upstream identity provider already verified.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::allocator::BookingError;
use crate::ledger::LedgerError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Envelope {
    pub user: String,
    #[serde(flatten)]
    pub command: Command,
}

/// `game` accepts either a game id or its name (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Book {
        game: String,
        date: NaiveDate,
        #[serde(deserialize_with = "crate::policy::de_hhmm")]
        time: NaiveTime,
    },
    Cancel {
        booking: Ulid,
    },
    Slots {
        game: String,
        date: NaiveDate,
    },
    Week {
        game: String,
    },
    Games,
    MyBookings,
    AllBookings,
    Users,
    /// Admin only. `target` is the handle to remove.
    DeleteUser {
        target: String,
    },
    Stats,
}

#[derive(Debug)]
pub enum ProtocolError {
    Parse(String),
    LineTooLong,
    Io(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Parse(e) => write!(f, "bad request: {e}"),
            ProtocolError::LineTooLong => write!(f, "request line too long"),
            ProtocolError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub fn parse_request(line: &str) -> Result<Envelope, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::Parse(e.to_string()))?;
    if envelope.user.trim().is_empty() {
        return Err(ProtocolError::Parse("missing user".into()));
    }
    Ok(envelope)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReply {
    pub code: &'static str,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<BookingError> for ErrorReply {
    fn from(e: BookingError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<ProtocolError> for ErrorReply {
    fn from(e: ProtocolError) -> Self {
        let code = match &e {
            ProtocolError::Parse(_) => "bad_request",
            ProtocolError::LineTooLong => "line_too_long",
            ProtocolError::Io(_) => "io_error",
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<LedgerError> for ErrorReply {
    fn from(e: LedgerError) -> Self {
        let code = match &e {
            LedgerError::AlreadyExists(_) => "already_exists",
            LedgerError::LimitExceeded(_) => "limit_exceeded",
            e if e.is_transient() => "store_unavailable",
            _ => "store_error",
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

/// `{"status":"ok", ...fields}`. Non-object bodies land under `data`.
pub fn ok_reply(body: Value) -> String {
    let mut out = Map::new();
    out.insert("status".into(), Value::from("ok"));
    match body {
        Value::Object(fields) => out.extend(fields),
        Value::Null => {}
        other => {
            out.insert("data".into(), other);
        }
    }
    Value::Object(out).to_string()
}

/// `{"status":"error","code":...,"message":...}`
pub fn error_reply(e: impl Into<ErrorReply>) -> String {
    let ErrorReply { code, message } = e.into();
    serde_json::json!({
        "status": "error",
        "code": code,
        "message": message,
    })
    .to_string()
}
