use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use unitboard_protocol::{tank_id_for_unit, SensorPacket, GPIO_COUNT, TANK_ID_OFFSET, UNIT_COUNT};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<UnitMirror>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// What the bridge last told, or heard from, each unit board.
pub struct UnitMirror {
    pub started_at: Instant,
    pub rx_connected: bool,
    pub tx_connected: bool,
    pub units: Vec<UnitState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct UnitState {
    pub unit_id: u32,
    pub tank_id: u32,
    pub gpio: [bool; GPIO_COUNT],
    pub motor: MotorState,
    pub fw_version: Option<u32>,
    pub last_idx: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_telemetry: Option<OffsetDateTime>,
}

#[derive(Clone, Copy, Default, Serialize)]
pub struct MotorState {
    pub on: bool,
    pub speed: u32,
    pub time: u32,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Command,
    Ack,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct MirrorStatus {
    pub uptime_secs: u64,
    pub rx_connected: bool,
    pub tx_connected: bool,
    pub units: Vec<UnitState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for UnitMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitMirror {
    pub fn new() -> Self {
        let units = (0..UNIT_COUNT)
            .map(|unit_id| UnitState {
                unit_id,
                tank_id: tank_id_for_unit(unit_id),
                gpio: [false; GPIO_COUNT],
                motor: MotorState::default(),
                fw_version: None,
                last_idx: None,
                last_telemetry: None,
            })
            .collect();

        Self {
            started_at: Instant::now(),
            rx_connected: false,
            tx_connected: false,
            units,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn unit(&self, unit_id: u32) -> Option<&UnitState> {
        self.units.get(unit_id as usize)
    }

    /// Record an inbound telemetry packet against the units whose tanks it
    /// mentions.
    pub fn record_telemetry(&mut self, packet: &SensorPacket) {
        let now = OffsetDateTime::now_utc();
        for v in &packet.values {
            if let Some(unit) = v
                .tank_id
                .checked_sub(TANK_ID_OFFSET)
                .and_then(|u| self.units.get_mut(u as usize))
            {
                unit.last_telemetry = Some(now);
            }
        }

        self.push_event(
            EventKind::Telemetry,
            format!(
                "SENSOR order={} readings={} states={}",
                packet.order,
                packet.values.len(),
                packet.state.len()
            ),
        );
    }

    /// Record a command that went out on the wire.
    pub fn record_command(&mut self, unit_id: Option<u32>, kind: &str, idx: Option<u64>) {
        if let (Some(unit), Some(idx)) = (unit_id.and_then(|u| self.unit_mut(u)), idx) {
            unit.last_idx = Some(idx);
        }

        let detail = match (unit_id, idx) {
            (Some(u), Some(i)) => format!("{kind} unit={u} idx={i}"),
            (None, Some(i)) => format!("{kind} idx={i}"),
            (Some(u), None) => format!("{kind} unit={u}"),
            (None, None) => kind.to_string(),
        };
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_gpio(&mut self, unit_id: u32, gpio: [bool; GPIO_COUNT]) {
        if let Some(unit) = self.unit_mut(unit_id) {
            unit.gpio = gpio;
        }
    }

    pub fn record_motor(&mut self, unit_id: u32, motor: MotorState) {
        if let Some(unit) = self.unit_mut(unit_id) {
            unit.motor = motor;
        }
    }

    pub fn record_ack(&mut self, idx: u64, note: &str) {
        self.push_event(EventKind::Ack, format!("ACK idx={idx} note={note}"));
    }

    pub fn record_fw_version(&mut self, unit_id: u32, idx: u64, fw_version: u32) {
        if let Some(unit) = self.unit_mut(unit_id) {
            unit.fw_version = Some(fw_version);
        }
        self.push_event(
            EventKind::Ack,
            format!("ACK_INITIALIZE idx={idx} unit={unit_id} fw={fw_version}"),
        );
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn set_link(&mut self, rx: bool, tx: bool) {
        self.rx_connected = rx;
        self.tx_connected = tx;
    }

    /// Build the JSON-serialisable status snapshot. Newest events first.
    pub fn to_status(&self) -> MirrorStatus {
        MirrorStatus {
            uptime_secs: self.started_at.elapsed().as_secs(),
            rx_connected: self.rx_connected,
            tx_connected: self.tx_connected,
            units: self.units.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn unit_mut(&mut self, unit_id: u32) -> Option<&mut UnitState> {
        self.units.get_mut(unit_id as usize)
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitboard_protocol::SensorValue;

    #[test]
    fn every_unit_present_with_its_tank() {
        let m = UnitMirror::new();
        assert_eq!(m.units.len(), UNIT_COUNT as usize);
        assert_eq!(m.unit(5).unwrap().tank_id, 106);
        assert!(m.unit(UNIT_COUNT).is_none());
    }

    #[test]
    fn event_ring_is_bounded() {
        let mut m = UnitMirror::new();
        for i in 0..(MAX_EVENTS + 25) {
            m.record_system(format!("event {i}"));
        }
        assert_eq!(m.events.len(), MAX_EVENTS);

        let status = m.to_status();
        assert_eq!(status.events[0].detail, format!("event {}", MAX_EVENTS + 24));
        assert_eq!(status.events.last().unwrap().detail, "event 25");
    }

    #[test]
    fn telemetry_marks_matching_units() {
        let mut m = UnitMirror::new();
        m.record_telemetry(&SensorPacket {
            order: 1,
            date: String::new(),
            time: String::new(),
            values: vec![
                SensorValue {
                    tank_id: 103,
                    sensor_id: 1,
                    value: "1".into(),
                },
                // Outside the fleet; ignored.
                SensorValue {
                    tank_id: 100,
                    sensor_id: 1,
                    value: "1".into(),
                },
            ],
            state: vec![],
        });
        assert!(m.unit(2).unwrap().last_telemetry.is_some());
        assert!(m.unit(0).unwrap().last_telemetry.is_none());
        assert_eq!(m.events.back().unwrap().kind, EventKind::Telemetry);
    }

    #[test]
    fn command_updates_last_idx() {
        let mut m = UnitMirror::new();
        m.record_command(Some(4), "SET_GPIO", Some(12));
        m.record_gpio(4, [true; GPIO_COUNT]);
        let unit = m.unit(4).unwrap();
        assert_eq!(unit.last_idx, Some(12));
        assert!(unit.gpio.iter().all(|&g| g));
        assert_eq!(m.events.back().unwrap().detail, "SET_GPIO unit=4 idx=12");
    }

    #[test]
    fn fw_version_recorded() {
        let mut m = UnitMirror::new();
        m.record_fw_version(9, 3, 102);
        assert_eq!(m.unit(9).unwrap().fw_version, Some(102));
    }
}
