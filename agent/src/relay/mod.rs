mod connection;
mod frame;

pub use connection::{ReconnectState, RelayClient, RelayEvent};
pub use frame::{RelayFrame, RELAY_QUEUE_CAPACITY};
