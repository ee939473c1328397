//! Command handling and telemetry assembly for one simulated controller.

use std::collections::BTreeMap;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info};
use unitboard_protocol::{
    Ack, AckInitialize, Command, Message, Power, SensorPacket, SensorValue, TankState, GPIO_COUNT,
    TANK_ID_OFFSET,
};

use crate::sim::TankSim;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TankControl {
    pub stage: u32,
    pub status: String,
    pub gpio: [bool; GPIO_COUNT],
    pub motor_on: bool,
    pub motor_speed: u32,
}

impl Default for TankControl {
    fn default() -> Self {
        Self {
            stage: 0,
            status: "None".to_string(),
            gpio: [false; GPIO_COUNT],
            motor_on: false,
            motor_speed: 0,
        }
    }
}

pub struct Controller {
    fw_version: u32,
    order: u64,
    /// Keyed by tank id, ascending.
    tanks: BTreeMap<u32, TankControl>,
    /// Last image path a FIRMWARE_UPDATE pointed at.
    pending_firmware: Option<String>,
}

impl Controller {
    /// A controller owning `tank_count` tanks starting at the first tank id.
    pub fn new(tank_count: usize, fw_version: u32) -> Self {
        let tanks = (0..tank_count as u32)
            .map(|i| (TANK_ID_OFFSET + i, TankControl::default()))
            .collect();
        Self {
            fw_version,
            order: 0,
            tanks,
            pending_firmware: None,
        }
    }

    pub fn tank(&self, tank_id: u32) -> Option<&TankControl> {
        self.tanks.get(&tank_id)
    }

    pub fn pending_firmware(&self) -> Option<&str> {
        self.pending_firmware.as_deref()
    }

    /// Apply one command and build the reply. Commands for tanks this
    /// controller does not own are acknowledged but otherwise ignored.
    pub fn apply(&mut self, cmd: &Command) -> Message {
        let idx = cmd.index().unwrap_or(0);
        debug!(kind = cmd.kind(), idx, "applying command");

        match cmd {
            Command::SetGpio { tank_id, gpio, .. } => {
                if let Some(t) = self.tanks.get_mut(tank_id) {
                    t.gpio = *gpio;
                }
            }
            Command::Motor {
                tank_id,
                speed,
                power,
                ..
            } => {
                if let Some(t) = self.tanks.get_mut(tank_id) {
                    t.motor_on = *power == Power::On;
                    t.motor_speed = *speed;
                }
            }
            Command::FirmwareUpdate { file, .. } => {
                info!(%file, "firmware update requested");
                self.pending_firmware = Some(file.clone());
            }
            Command::GetVersion { .. } => {
                return Message::AckInitialize(AckInitialize {
                    idx,
                    fw_version: self.fw_version,
                    note: "OK".to_string(),
                });
            }
            Command::Recipe(body) => {
                info!(fields = body.len(), "recipe received");
            }
            Command::State { state, .. } => {
                for row in state {
                    if let Some(t) = self.tanks.get_mut(&row.tank_id) {
                        if t.status != row.status {
                            info!(tank_id = row.tank_id, from = %t.status, to = %row.status, "tank status changed");
                        }
                        t.status = row.status.clone();
                        t.stage = row.stage;
                    }
                }
            }
            Command::Ping { .. } => {}
        }

        Message::Ack(Ack {
            idx,
            note: "OK".to_string(),
        })
    }

    /// Advance the simulator one tick and report every probe of every tank.
    pub fn sample(&mut self, sim: &mut TankSim, now: OffsetDateTime) -> SensorPacket {
        self.order += 1;

        let mut values = Vec::new();
        let mut state = Vec::with_capacity(self.tanks.len());
        for (i, (tank_id, t)) in self.tanks.iter().enumerate() {
            sim.set_heating(i, t.status.eq_ignore_ascii_case("run"));
            sim.step(i);
            for probe in 0..sim.probe_count(i) {
                values.push(SensorValue {
                    tank_id: *tank_id,
                    sensor_id: probe as u32 + 1,
                    value: format!("{:.1}", sim.read(i, probe)),
                });
            }
            state.push(TankState {
                tank_id: *tank_id,
                stage: t.stage,
                status: t.status.clone(),
            });
        }

        SensorPacket {
            order: self.order,
            date: now
                .format(format_description!("[year]-[month]-[day]"))
                .unwrap_or_default(),
            time: now
                .format(format_description!("[hour]:[minute]:[second]"))
                .unwrap_or_default(),
            values,
            state,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
