//! An embeddable, single-node, log-structured key-value store modeled
//! on the Bitcask design.
//!
//! All writes append to immutable-once-rotated data segments; an
//! in-memory keydir maps each live key to the segment location of its
//! latest value, giving O(1) point reads after one disk seek. Merge
//! compacts old segments and emits hint files for fast keydir
//! reconstruction. A directory-level advisory lock coordinates one
//! exclusive writer process with any number of shared readers.
//!
//! The [`Caskdb`] facade in [`db`] is the embedder API; [`server`]
//! wraps it in a line-protocol TCP server launched by the binary.

pub mod command;
pub mod datastore;
pub mod db;
pub mod error;
pub mod keydir;
pub mod recfmt;
pub mod server;
pub mod sio;

pub use command::Cli;
pub use db::{Caskdb, ConfigOpt};
pub use error::{Error, Result};
