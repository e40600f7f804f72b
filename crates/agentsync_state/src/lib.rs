pub mod errors;
pub mod merge;
pub mod patch;
pub mod sync;

pub use errors::PatchError;
pub use merge::{deep_merge, merged};
pub use patch::{apply_patch, apply_patch_in_place};
pub use sync::{StateKey, StateSynchronizer, StateUpdate, VersionedState, WriteKind, WriteOrigin};
