#[macro_use]
extern crate log;

pub mod auth;
pub mod config;
pub mod peer;
pub mod result;
pub mod retry;
pub mod session;
pub mod signaller;
pub mod stream;
pub mod subscribers;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use crate::auth::Credentials;
pub use crate::config::Config;
pub use crate::peer::{MediaStream, MediaTrack, TrackKind};
pub use crate::result::Result;
pub use crate::session::Session;
pub use crate::stream::{Direction, StreamEvent};
pub use crate::transfer::{FileTransferEvent, TransferKey, TransferState};
