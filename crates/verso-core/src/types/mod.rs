//! Core types for verso.

mod filter;
mod key;
mod record;

pub use filter::*;
pub use key::RecordKey;
pub use record::{Payload, Record, VersionRow};
