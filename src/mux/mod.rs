//! Connection multiplexing over a single gateway pipe.
//!
//! Hosts that sit behind a bastion cannot each get their own ssh
//! session from the controller. Instead one pipe is opened to the
//! gateway and every channel to hosts behind it is multiplexed over
//! that pipe with a small binary framing. [`frame`] defines the wire
//! format, [`transport`] the controller side and [`serve`] the remote
//! side.

pub mod frame;
pub mod serve;
pub mod transport;

pub use frame::{ClientFrame, ServerFrame};
pub use transport::{MuxChannel, MuxTransport};
