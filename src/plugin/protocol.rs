//! Wire format between the agent and its sandbox child.
//!
//! One JSON document per line in each direction. Every request carries an
//! id that its reply echoes, so replies may arrive in any order.

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Operations the sandbox accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    LoadModule { path: PathBuf },
    LoadSliceDescriptors { path: PathBuf },
    RunCheck { key: String },
    LongRunningResults,
    PopulateSlice { type_name: String },
    AllocatedBytes,
    Shutdown,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Self::LoadModule { .. } => "load_module",
            Self::LoadSliceDescriptors { .. } => "load_slice_descriptors",
            Self::RunCheck { .. } => "run_check",
            Self::LongRunningResults => "long_running_results",
            Self::PopulateSlice { .. } => "populate_slice",
            Self::AllocatedBytes => "allocated_bytes",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Reply to one request: `ok` on success, `err` on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Reply {
    pub fn ok(id: u64, value: Value) -> Self {
        Self {
            id,
            ok: Some(value),
            err: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: None,
            err: Some(message.into()),
        }
    }

    /// A JSON `null` result and an absent one are the same thing.
    pub fn into_result(self) -> Result<Value, SandboxError> {
        match self.err {
            Some(message) => Err(SandboxError::Remote(message)),
            None => Ok(self.ok.unwrap_or(Value::Null)),
        }
    }
}
