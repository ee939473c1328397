//! Wire shapes for inbound reports and outbound commands.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Number of unit boards in a fleet. Tank slots map 1:1 onto units.
pub const UNIT_COUNT: u32 = 32;

/// `tank_id = unit_id + TANK_ID_OFFSET`
pub const TANK_ID_OFFSET: u32 = 101;

/// Controllers number their boards from 1.
const UNIT_ID_OFFSET: u32 = 1;

/// GPIO outputs per unit board.
pub const GPIO_COUNT: usize = 8;

pub fn tank_id_for_unit(unit_id: u32) -> u32 {
    unit_id + TANK_ID_OFFSET
}

pub fn wire_unit_id(unit_id: u32) -> u32 {
    unit_id + UNIT_ID_OFFSET
}

// ---------------------------------------------------------------------------
// Controller -> bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorValue {
    #[serde(rename = "TANK_ID", deserialize_with = "lenient_u32")]
    pub tank_id: u32,
    #[serde(rename = "SENSOR_ID", deserialize_with = "lenient_u32")]
    pub sensor_id: u32,
    /// Kept as text; controllers format readings themselves.
    #[serde(rename = "VALUE", deserialize_with = "value_text")]
    pub value: String,
}

/// One row of a tank state table. Used both in telemetry and in the
/// outbound `STATE` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TankState {
    #[serde(rename = "TANK_ID", deserialize_with = "lenient_u32")]
    pub tank_id: u32,
    #[serde(rename = "STAGE")]
    pub stage: u32,
    #[serde(rename = "STATUS")]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPacket {
    #[serde(rename = "ORDER")]
    pub order: u64,
    #[serde(rename = "DATE")]
    pub date: String,
    #[serde(rename = "TIME")]
    pub time: String,
    #[serde(rename = "VALUES")]
    pub values: Vec<SensorValue>,
    #[serde(rename = "STATE")]
    pub state: Vec<TankState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "IDX", deserialize_with = "lenient_u64")]
    pub idx: u64,
    #[serde(rename = "NOTE", default = "default_note")]
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckInitialize {
    #[serde(rename = "IDX", deserialize_with = "lenient_u64")]
    pub idx: u64,
    #[serde(rename = "FW_VERSION", deserialize_with = "lenient_u32")]
    pub fw_version: u32,
    #[serde(rename = "NOTE", default = "default_note")]
    pub note: String,
}

/// Everything a controller may send on the telemetry connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "CMD")]
pub enum Message {
    #[serde(rename = "SENSOR")]
    Sensor(SensorPacket),
    #[serde(rename = "ACK")]
    Ack(Ack),
    #[serde(rename = "ACK_INITIALIZE")]
    AckInitialize(AckInitialize),
}

impl Message {
    pub const KINDS: &'static [&'static str] = &["SENSOR", "ACK", "ACK_INITIALIZE"];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sensor(_) => "SENSOR",
            Self::Ack(_) => "ACK",
            Self::AckInitialize(_) => "ACK_INITIALIZE",
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge -> controller
// ---------------------------------------------------------------------------

/// Motor power switch as spelled on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Power {
    On,
    Off,
}

/// The closed set of commands the bridge sends to a controller.
///
/// `unit_id` and `tank_id` are the wire values (see [`wire_unit_id`] and
/// [`tank_id_for_unit`]), not the dashboard's zero-based unit index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "CMD", rename_all_fields = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    #[serde(rename = "SET_GPIO")]
    SetGpio {
        unit_id: u32,
        idx: u64,
        tank_id: u32,
        #[serde(rename = "VALUE")]
        gpio: [bool; GPIO_COUNT],
        send: bool,
    },
    #[serde(rename = "TEMP_RPM")]
    Motor {
        unit_id: u32,
        idx: u64,
        tank_id: u32,
        speed: u32,
        dir: u8,
        #[serde(rename = "ONOFF")]
        power: Power,
        time: u32,
        send: bool,
    },
    #[serde(rename = "FIRMWARE_UPDATE")]
    FirmwareUpdate {
        unit_id: u32,
        idx: u64,
        file: String,
        send: bool,
    },
    #[serde(rename = "GET_VERSION")]
    GetVersion { unit_id: u32, idx: u64, send: bool },
    /// Operator recipe, passed through as-is (without its `CMD` key).
    #[serde(rename = "REF")]
    Recipe(Map<String, Value>),
    #[serde(rename = "STATE")]
    State { idx: u64, state: Vec<TankState> },
    #[serde(rename = "PING")]
    Ping {
        idx: u64,
        #[serde(default = "default_note")]
        note: String,
    },
}

impl Command {
    pub const KINDS: &'static [&'static str] = &[
        "SET_GPIO",
        "TEMP_RPM",
        "FIRMWARE_UPDATE",
        "GET_VERSION",
        "REF",
        "STATE",
        "PING",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetGpio { .. } => "SET_GPIO",
            Self::Motor { .. } => "TEMP_RPM",
            Self::FirmwareUpdate { .. } => "FIRMWARE_UPDATE",
            Self::GetVersion { .. } => "GET_VERSION",
            Self::Recipe(_) => "REF",
            Self::State { .. } => "STATE",
            Self::Ping { .. } => "PING",
        }
    }

    /// The send index, if the command carries a numeric one. Recipes carry
    /// whatever `IDX` the recipe file had.
    pub fn index(&self) -> Option<u64> {
        match self {
            Self::SetGpio { idx, .. }
            | Self::Motor { idx, .. }
            | Self::FirmwareUpdate { idx, .. }
            | Self::GetVersion { idx, .. }
            | Self::State { idx, .. }
            | Self::Ping { idx, .. } => Some(*idx),
            Self::Recipe(body) => body.get("IDX").and_then(number_from_value),
        }
    }
}

// ---------------------------------------------------------------------------
// Lenient field parsing
// ---------------------------------------------------------------------------

fn default_note() -> String {
    "OK".to_string()
}

/// Controllers send ids either as numbers or as numeric strings.
fn number_from_value(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let v = Value::deserialize(d)?;
    number_from_value(&v)
        .ok_or_else(|| D::Error::custom(format!("expected a non-negative integer, got {v}")))
}

fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let n = lenient_u64(d)?;
    u32::try_from(n).map_err(|_| D::Error::custom(format!("{n} does not fit in 32 bits")))
}

fn value_text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}
