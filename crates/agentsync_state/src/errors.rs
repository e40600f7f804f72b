use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A delta that cannot be applied. The whole patch is rejected and the
/// state it targeted is left unchanged. `index` is the failing operation.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PatchError {
    #[error("op {index}: malformed operation at `{path}`: {reason}")]
    Malformed {
        index: usize,
        path: String,
        reason: String,
    },
    #[error("op {index}: cannot apply at `{path}`: {reason}")]
    Rejected {
        index: usize,
        path: String,
        reason: String,
    },
}

impl PatchError {
    pub fn index(&self) -> usize {
        match self {
            Self::Malformed { index, .. } | Self::Rejected { index, .. } => *index,
        }
    }
}
