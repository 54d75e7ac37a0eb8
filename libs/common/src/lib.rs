pub mod id;
pub mod protocol;

pub use protocol::{ClientEvent, PresenceStatus, RoomTarget, ServerEvent, Topic};
