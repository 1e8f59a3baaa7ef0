pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod pages;
pub mod requests;
pub mod session;
pub mod shutdown;
pub mod visibility;

pub use connection::{Connection, ConnectionState};
pub use error::{DashError, Result};
pub use session::{PollHandle, PollOptions, Session};
pub use visibility::Visibility;
