//! **`can-core`** — shared CAN/CAN-FD abstractions for the `muxcan` workspace.
//!
//! Everything here is OS-free: identifier and filter types, the owned frame
//! record, the DLC/length codec and the error taxonomy. The Linux socket
//! plumbing lives in the `muxcan` crate.

mod error;
pub use error::*;
mod frame;
pub use frame::*;
mod identifier;
pub use identifier::*;
pub mod utils;
