//! Reads the exception store of an LVM copy-on-write snapshot and replays the
//! chunks the origin has changed onto a (usually remote) destination device.
//!
//! The three pieces of the data path live in their own modules and compose in
//! one direction only: [`exception_store`] enumerates changed chunks,
//! [`sender`] turns them into a framed byte stream, and [`receiver`] applies
//! that stream to a destination. [`protocol`] defines the framing both sides
//! agree on; [`device_locator`] resolves a user-supplied snapshot name to the
//! real device-mapper devices it's backed by.

pub mod config;
pub mod device_locator;
pub mod endian;
pub mod error;
pub mod exception_store;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use config::SyncConfig;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
