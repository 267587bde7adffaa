//! Wire protocol for the Huddle signaling socket
//!
//! Every frame is a JSON object `{"type": .., "data": {..}}`, except error
//! frames which are sent bare as `{"status": .., "statusText": ..}`.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
