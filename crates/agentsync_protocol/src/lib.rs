pub mod codec;
pub mod errors;
pub mod event;
pub mod tools;
pub mod validator;

use serde::{Deserialize, Serialize};

pub use codec::{decode_line, encode_line, encode_sse, FrameDecoder, Framing};
pub use errors::{CodecError, ProtocolError, ToolSchemaError};
pub use event::{ContextItem, Event, Message, PatchOp, Role, ToolCall};
pub use tools::{ParameterKind, ToolDefinition, ToolParameter};
pub use validator::StreamValidator;

/// Version of the event contract an adapter was built against.
/// Minor bumps add optional fields; major bumps change event shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub const fn is_compatible_with(self, other: Self) -> bool {
        self.major == other.major
    }
}
