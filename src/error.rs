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

//! Error handling for shuffle operations

use std::fmt;

/// Status codes shared by every error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok = 0,
    KeyError = 2,
    TypeError = 3,
    Invalid = 4,
    IoError = 5,
    CapacityError = 6,
    UnknownError = 9,
    SerializationError = 11,
    ExecutionError = 42,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok => write!(f, "OK"),
            Code::KeyError => write!(f, "Key error"),
            Code::TypeError => write!(f, "Type error"),
            Code::Invalid => write!(f, "Invalid"),
            Code::IoError => write!(f, "IO error"),
            Code::CapacityError => write!(f, "Capacity error"),
            Code::UnknownError => write!(f, "Unknown error"),
            Code::SerializationError => write!(f, "Serialization error"),
            Code::ExecutionError => write!(f, "Execution error"),
        }
    }
}

/// Main error type
#[derive(thiserror::Error, Debug)]
pub enum CylonError {
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    Invalid(String),

    /// Target task is not part of the routing plan's target set
    #[error("Unknown task {task} on edge {edge}")]
    UnknownTask { task: i32, edge: i32 },

    #[error("Schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch { expected: String, actual: String },

    /// The transport refused or failed a send. Never retried here.
    #[error("Transport rejected send: {0}")]
    TransportRejected(String),

    #[error("Callback rejected table from worker {worker} for task {task}")]
    CallbackRejected { worker: i32, task: i32 },

    #[error("Transport closed for edge {edge}")]
    TransportClosed { edge: i32 },

    /// A task reachable during routing has no owning worker
    #[error("Malformed task plan: {0}")]
    MalformedPlan(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Generic error with code {code}: {message}")]
    Generic { code: Code, message: String },
}

impl CylonError {
    /// Create a new error with a specific code and message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        CylonError::Generic {
            code,
            message: message.into(),
        }
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            CylonError::Arrow(_) => Code::Invalid,
            CylonError::Io(_) => Code::IoError,
            CylonError::Serialization(_) => Code::SerializationError,
            CylonError::Invalid(_) => Code::Invalid,
            CylonError::UnknownTask { .. } => Code::KeyError,
            CylonError::SchemaMismatch { .. } => Code::TypeError,
            CylonError::TransportRejected(_) => Code::IoError,
            CylonError::CallbackRejected { .. } => Code::ExecutionError,
            CylonError::TransportClosed { .. } => Code::IoError,
            CylonError::MalformedPlan(_) => Code::Invalid,
            CylonError::Communication(_) => Code::IoError,
            CylonError::Generic { code, .. } => *code,
        }
    }

    /// Check if the error represents success
    pub fn is_ok(&self) -> bool {
        self.code() == Code::Ok
    }

    /// Whether the failing call can never succeed again on this edge
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, CylonError::TransportClosed { .. })
    }
}

impl From<serde_json::Error> for CylonError {
    fn from(e: serde_json::Error) -> Self {
        CylonError::Serialization(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for CylonError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        CylonError::Invalid(format!("lock poisoned: {}", e))
    }
}

/// Type alias for Results using CylonError
pub type CylonResult<T> = Result<T, CylonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shuffle_error_codes() {
        assert_eq!(CylonError::UnknownTask { task: 99, edge: 1 }.code(), Code::KeyError);
        assert_eq!(
            CylonError::SchemaMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .code(),
            Code::TypeError
        );
        assert_eq!(CylonError::TransportRejected("full".into()).code(), Code::IoError);
        assert_eq!(
            CylonError::CallbackRejected { worker: 0, task: 2 }.code(),
            Code::ExecutionError
        );
        assert_eq!(CylonError::MalformedPlan("x".into()).code(), Code::Invalid);
        assert!(CylonError::TransportClosed { edge: 3 }.is_transport_closed());
        assert!(!CylonError::Invalid("x".into()).is_transport_closed());
    }

    #[test]
    fn test_error_display() {
        let e = CylonError::UnknownTask { task: 99, edge: 7 };
        assert_eq!(e.to_string(), "Unknown task 99 on edge 7");

        let e = CylonError::new(Code::CapacityError, "too many");
        assert_eq!(e.code(), Code::CapacityError);
        assert_eq!(e.to_string(), "Generic error with code Capacity error: too many");
    }
}
