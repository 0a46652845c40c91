use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::panic_message;

/// Message of the placeholder used when an error cannot be carried over.
pub const UNCLONABLE_ERROR: &str = "unclonable error";

/// An error raised inside a spawned thread, in transferable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    pub fn unclonable() -> Self {
        Self::new("Error", UNCLONABLE_ERROR)
    }

    pub fn is_unclonable(&self) -> bool {
        self.message == UNCLONABLE_ERROR
    }

    /// Capture an error returned by a thread's entry point. The source
    /// chain becomes the cause, the debug rendering the stack.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let causes: Vec<String> = err.chain().skip(1).map(|e| e.to_string()).collect();
        Self {
            name: "Error".into(),
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
            cause: (!causes.is_empty()).then(|| causes.join(": ")),
        }
    }

    /// Capture a panic payload. Only string payloads carry over.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        match panic_message(payload) {
            Some(message) => Self::new("panic", message),
            None => Self::unclonable(),
        }
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for SerializedError {}
