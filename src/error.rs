// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error handling for distributed training operations

use std::fmt;
use std::time::Duration;

/// Numeric status codes surfaced across the handle boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok = 0,
    Invalid = 4,
    IoError = 5,
    UnknownError = 9,
    NotImplemented = 10,
    SerializationError = 11,
    DeviceError = 12,
    CollectiveTimeout = 20,
    CollectiveMismatch = 21,
    RendezvousError = 22,
    HandleError = 23,
    ExecutionError = 42,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok => write!(f, "OK"),
            Code::Invalid => write!(f, "Invalid"),
            Code::IoError => write!(f, "IO error"),
            Code::UnknownError => write!(f, "Unknown error"),
            Code::NotImplemented => write!(f, "Not implemented"),
            Code::SerializationError => write!(f, "Serialization error"),
            Code::DeviceError => write!(f, "Device error"),
            Code::CollectiveTimeout => write!(f, "Collective timed out"),
            Code::CollectiveMismatch => write!(f, "Collective mismatch"),
            Code::RendezvousError => write!(f, "Rendezvous error"),
            Code::HandleError => write!(f, "Handle error"),
            Code::ExecutionError => write!(f, "Execution error"),
        }
    }
}

/// Main error type
#[derive(thiserror::Error, Debug)]
pub enum SpmdError {
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    Invalid(String),

    #[error("Device error: {0}")]
    Device(String),

    /// A peer never reached the collective within the configured timeout.
    #[error("Collective {op} (seq {seq}) timed out after {waited:?}")]
    CollectiveTimeout {
        op: String,
        seq: u64,
        waited: Duration,
    },

    /// Ranks issued different collectives for the same sequence number.
    #[error("Collective mismatch: {0}")]
    CollectiveMismatch(String),

    #[error("Buffer size mismatch: {0}")]
    SizeMismatch(String),

    #[error("Rendezvous error: {0}")]
    Rendezvous(String),

    #[error("Handle error: {0}")]
    Handle(String),

    #[error("Generic error with code {code}: {message}")]
    Generic { code: Code, message: String },
}

impl SpmdError {
    /// Create a new error with a specific code and message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        SpmdError::Generic {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(op: impl Into<String>, seq: u64, waited: Duration) -> Self {
        SpmdError::CollectiveTimeout {
            op: op.into(),
            seq,
            waited,
        }
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            SpmdError::Arrow(_) => Code::Invalid,
            SpmdError::Io(_) => Code::IoError,
            SpmdError::Serialization(_) => Code::SerializationError,
            SpmdError::Invalid(_) => Code::Invalid,
            SpmdError::Device(_) => Code::DeviceError,
            SpmdError::CollectiveTimeout { .. } => Code::CollectiveTimeout,
            SpmdError::CollectiveMismatch(_) => Code::CollectiveMismatch,
            SpmdError::SizeMismatch(_) => Code::CollectiveMismatch,
            SpmdError::Rendezvous(_) => Code::RendezvousError,
            SpmdError::Handle(_) => Code::HandleError,
            SpmdError::Generic { code, .. } => *code,
        }
    }

    /// True when the error came from a peer that never showed up
    pub fn is_timeout(&self) -> bool {
        self.code() == Code::CollectiveTimeout
    }
}

impl From<bincode::Error> for SpmdError {
    fn from(err: bincode::Error) -> Self {
        SpmdError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SpmdError {
    fn from(err: serde_json::Error) -> Self {
        SpmdError::Serialization(err.to_string())
    }
}

/// Type alias for Results using SpmdError
pub type SpmdResult<T> = Result<T, SpmdError>;

/// Error used when a shared lock was poisoned by a panicking rank thread
pub(crate) fn poisoned(what: &str) -> SpmdError {
    SpmdError::new(Code::ExecutionError, format!("{} lock poisoned", what))
}

/// Flat status value for callers that only consume codes
#[derive(Debug, Clone)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
        }
    }

    pub fn get_code(&self) -> Code {
        self.code
    }

    pub fn get_msg(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl From<SpmdError> for Status {
    fn from(error: SpmdError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

impl<T> From<&SpmdResult<T>> for Status {
    fn from(result: &SpmdResult<T>) -> Self {
        match result {
            Ok(_) => Status::ok(),
            Err(e) => Self {
                code: e.code(),
                message: e.to_string(),
            },
        }
    }
}

impl From<Status> for SpmdResult<()> {
    fn from(status: Status) -> Self {
        if status.is_ok() {
            Ok(())
        } else {
            Err(SpmdError::new(status.get_code(), status.get_msg()))
        }
    }
}
