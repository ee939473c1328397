//! Last commanded status of every tank slot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use unitboard_protocol::{TankState, TANK_ID_OFFSET, UNIT_COUNT};

/// Stage sent with every STATE row unless the caller picks another.
pub const DEFAULT_STAGE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TankStatus {
    #[default]
    None,
    Initial,
    Run,
    Pause,
    Stop,
}

impl TankStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Initial => "Initial",
            Self::Run => "Run",
            Self::Pause => "Pause",
            Self::Stop => "Stop",
        }
    }
}

impl fmt::Display for TankStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TankError {
    #[error("unknown tank id {0}")]
    UnknownTank(u32),
    #[error("unknown tank status {0:?}")]
    UnknownStatus(String),
}

impl FromStr for TankStatus {
    type Err = TankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "initial" => Ok(Self::Initial),
            "run" => Ok(Self::Run),
            "pause" => Ok(Self::Pause),
            "stop" => Ok(Self::Stop),
            _ => Err(TankError::UnknownStatus(s.to_string())),
        }
    }
}

/// Fixed table of tank slots `101..=132`. Every slot exists from
/// construction on; only its status changes.
#[derive(Debug, Clone)]
pub struct TankTable {
    slots: BTreeMap<u32, TankStatus>,
}

impl Default for TankTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TankTable {
    pub fn new() -> Self {
        let first = TANK_ID_OFFSET;
        let slots = (first..first + UNIT_COUNT)
            .map(|tank_id| (tank_id, TankStatus::None))
            .collect();
        Self { slots }
    }

    pub fn set(&mut self, tank_id: u32, status: TankStatus) -> Result<(), TankError> {
        let slot = self
            .slots
            .get_mut(&tank_id)
            .ok_or(TankError::UnknownTank(tank_id))?;
        *slot = status;
        Ok(())
    }

    pub fn get(&self, tank_id: u32) -> Option<TankStatus> {
        self.slots.get(&tank_id).copied()
    }

    /// All slots in ascending tank order, ready for a STATE command.
    pub fn snapshot(&self, stage: u32) -> Vec<TankState> {
        self.slots
            .iter()
            .map(|(&tank_id, status)| TankState {
                tank_id,
                stage,
                status: status.as_str().to_string(),
            })
            .collect()
    }
}
