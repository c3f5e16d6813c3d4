//! **`muxcan`** — user-space multiplexer for Linux SocketCAN interfaces.
//!
//! Each interface carries one shared TX endpoint and any number of RX
//! endpoints, each with its own kernel acceptance filter. A reactor watches
//! all of them together and routes data frames, link-error frames and
//! overflow notifications to registered handlers, either from an owned
//! driver thread or from explicit [`CanInterface::poll`] calls.

mod ancillary;
mod config;
pub use config::*;
mod endpoint;
pub use endpoint::CanEvent;
mod frame;
mod iface;
pub use iface::{CanInterface, DEFAULT_ERROR_HANDLER};
mod netlink;
pub use netlink::{BerrCounter, CanLink, CanState, DeviceStats, LinkOps, UnmanagedLink};
mod reactor;
mod socket;
pub use socket::CanAddr;

pub use can_core::{utils, CanError, CanErrorMask, CanFrame, Filter, Id, IdentifierFlags};
