mod connection;
mod multiplexer;

pub use connection::{Connection, ReadyListener};
pub use multiplexer::{AcceptListener, ConnectListener, Multiplexer};
