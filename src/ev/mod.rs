use crate::ev::state::DEFAULT_DETECTION_DELAY_SECONDS;
use crate::ev::vehicle::Vehicle;
use crate::modbus::ev_control::ControlRegisters;
use crate::modbus::meter::MeterRegister;
use crate::modbus::ModbusError;
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;

pub mod charger;
pub mod soc;
pub mod soc_script;
pub mod state;
pub mod vehicle;

pub const DEFAULT_CONFIG_PATH: &str = "ev_charger.json";

#[derive(Debug, thiserror::Error)]
pub enum ChargerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("SOC script: {0}")]
    Script(String),

    #[error(transparent)]
    Modbus(#[from] ModbusError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize, Debug, Clone)]
pub struct ModbusConfig {
    pub address: SocketAddr,

    #[serde(default = "default_unit")]
    pub unit: u8,
}

fn default_unit() -> u8 {
    1
}

fn default_poll_interval() -> u64 {
    20
}

fn default_detection_delay() -> u32 {
    DEFAULT_DETECTION_DELAY_SECONDS
}

#[derive(Deserialize, Debug, Clone)]
pub struct ChargerConfig {
    pub appliance_id: String,

    /// Seconds between two control cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Seconds the relay stays on waiting for the vehicle to start charging
    #[serde(default = "default_detection_delay")]
    pub start_charging_state_detection_delay: u32,

    pub modbus: ModbusConfig,

    pub control: ControlRegisters,

    /// Energy meter of the charger, if any
    #[serde(default)]
    pub meter: Option<MeterRegister>,

    pub vehicles: Vec<Vehicle>,
}

impl ChargerConfig {
    pub fn load(path: &str) -> Result<ChargerConfig, ChargerError> {
        let mut file = File::open(path)?;
        let mut json = String::new();
        file.read_to_string(&mut json)?;
        ChargerConfig::parse(&json)
    }

    pub fn parse(json: &str) -> Result<ChargerConfig, ChargerError> {
        let cfg: ChargerConfig = serde_json::from_str(json)?;
        if let Some(v) = cfg.vehicles.iter().find(|v| v.battery_capacity_wh == 0) {
            return Err(ChargerError::Config(format!(
                "Battery capacity of vehicle {} must be greater than 0",
                v.id
            )));
        }
        if let Some(v) = cfg.vehicles.iter().find(|v| v.target_soc.map_or(false, |t| t > 100)) {
            return Err(ChargerError::Config(format!(
                "Target SOC of vehicle {} exceeds 100%",
                v.id
            )));
        }
        Ok(cfg)
    }
}
