use agentsync_protocol::PatchOp;
use json_patch::{Patch, PatchOperation};
use serde_json::Value;

use crate::errors::PatchError;

/// Apply an ordered patch to a copy of `base`.
/// All-or-nothing: the first failing op aborts the patch and `base` is untouched.
/// Allocation: one deep clone of `base`.
pub fn apply_patch(base: &Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
    let patch = to_json_patch(ops)?;
    let mut working = base.clone();
    json_patch::patch(&mut working, &patch).map_err(|err| PatchError::Rejected {
        index: err.operation,
        path: err.path.to_string(),
        reason: err.kind.to_string(),
    })?;
    Ok(working)
}

/// Same as `apply_patch`, committing into `state` only on success.
pub fn apply_patch_in_place(state: &mut Value, ops: &[PatchOp]) -> Result<(), PatchError> {
    let next = apply_patch(state, ops)?;
    *state = next;
    Ok(())
}

/// Wire ops share the RFC 6902 object shape, so each one converts through
/// its serialized form. Malformed pointers fail here, before any op runs.
fn to_json_patch(ops: &[PatchOp]) -> Result<Patch, PatchError> {
    ops.iter()
        .enumerate()
        .map(|(index, op)| {
            serde_json::to_value(op)
                .and_then(serde_json::from_value::<PatchOperation>)
                .map_err(|err| PatchError::Malformed {
                    index,
                    path: op.path().to_owned(),
                    reason: err.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Patch)
}
