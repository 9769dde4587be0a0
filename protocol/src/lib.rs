//! Wire protocol shared by the relay and the agent: the tagged-union
//! control-message codec and the length-prefixed binary frame format.

pub mod error;
pub mod frame;
pub mod messages;
pub mod session_code;

pub use error::{ErrorKind, ProtocolError};
pub use frame::{decode_binary, encode_binary, MAX_SHELL_ID_LEN};
pub use messages::{decode, encode, ControlMessage};
