//! Line-delimited JSON protocol spoken between the bridge and the unit
//! controllers.
//!
//! Every message is one JSON object terminated by `\n`. The `CMD` field
//! selects the variant; all other field names are the uppercase wire aliases
//! (`TANK_ID`, `IDX`, ...).

pub mod codec;
pub mod framing;
pub mod message;

pub use codec::{decode, decode_command, encode, DecodeError};
pub use framing::{FrameError, LineFramer};
pub use message::{
    tank_id_for_unit, wire_unit_id, Ack, AckInitialize, Command, Message, Power, SensorPacket,
    SensorValue, TankState, GPIO_COUNT, TANK_ID_OFFSET, UNIT_COUNT,
};
