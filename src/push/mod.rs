//! Server push: connection lifecycle, event routing and the socket backend.

mod channel;
mod dispatch;
mod event;
mod state;
mod transport;

pub use channel::{PushChannel, NORMAL_CLOSURE};
pub use dispatch::{dispatch, plan, CacheAction, Dispatch};
pub use event::ChannelEvent;
pub use state::{Backoff, ConnectionState};
pub use transport::{Connection, Connector, Frame, WsConnection, WsConnector};
