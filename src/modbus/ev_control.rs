use crate::ev::charger::EvControl;
use crate::ev::state::ControlSignals;
use crate::ev::ChargerError;
use crate::modbus::client::{ModbusClient, ReadKind};
use crate::modbus::codec::{encode, FullMatch, IntegerRegister, RegisterWidth};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, error};

fn default_width() -> RegisterWidth {
    RegisterWidth::Bits16
}

fn default_write_bits() -> u16 {
    16
}

/// Register whose value signals a charger state when it matches `regex`.
#[derive(Deserialize, Debug, Clone)]
pub struct ReadRegister {
    pub address: u16,

    #[serde(default = "default_width")]
    pub width: RegisterWidth,

    #[serde(default)]
    pub kind: ReadKind,

    pub regex: FullMatch,
}

impl ReadRegister {
    fn key(&self) -> RegisterKey {
        (self.kind, self.address, self.width)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct WriteRegister {
    pub address: u16,

    /// Width in bits, 16 or 32
    #[serde(default = "default_write_bits")]
    pub width: u16,

    pub value: i64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ControlRegisters {
    #[serde(default)]
    pub vehicle_not_connected: Option<ReadRegister>,
    #[serde(default)]
    pub vehicle_connected: Option<ReadRegister>,
    #[serde(default)]
    pub charging: Option<ReadRegister>,
    #[serde(default)]
    pub error: Option<ReadRegister>,

    pub start_charging: WriteRegister,
    pub stop_charging: WriteRegister,
}

pub enum ControlRegister {
    VehicleNotConnected,
    VehicleConnected,
    Charging,
    Error,
}

type RegisterKey = (ReadKind, u16, RegisterWidth);

impl ControlRegisters {
    fn map_register(&self, reg: ControlRegister) -> Option<&ReadRegister> {
        match reg {
            ControlRegister::VehicleNotConnected => self.vehicle_not_connected.as_ref(),
            ControlRegister::VehicleConnected => self.vehicle_connected.as_ref(),
            ControlRegister::Charging => self.charging.as_ref(),
            ControlRegister::Error => self.error.as_ref(),
        }
    }

    fn read_registers(&self) -> Vec<&ReadRegister> {
        [
            &self.vehicle_not_connected,
            &self.vehicle_connected,
            &self.charging,
            &self.error,
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Derive the control signals from the register values read in one cycle.
    fn signals(&self, values: &HashMap<RegisterKey, IntegerRegister>) -> ControlSignals {
        let matches = |reg: ControlRegister| match self.map_register(reg) {
            Some(r) => values
                .get(&r.key())
                .map_or(false, |v| v.value_matches(&r.regex)),
            None => false,
        };
        ControlSignals {
            vehicle_not_connected: matches(ControlRegister::VehicleNotConnected),
            vehicle_connected: matches(ControlRegister::VehicleConnected),
            charging: matches(ControlRegister::Charging),
            in_error: matches(ControlRegister::Error),
        }
    }
}

/// Charger controlled through Modbus registers.
pub struct ModbusEvControl {
    appliance_id: String,
    client: ModbusClient,
    registers: ControlRegisters,
}

impl ModbusEvControl {
    pub fn new(appliance_id: &str, client: ModbusClient, registers: ControlRegisters) -> Self {
        Self {
            appliance_id: appliance_id.to_owned(),
            client,
            registers,
        }
    }

    async fn write(&mut self, reg: WriteRegister) -> Result<(), ChargerError> {
        let value = match encode(reg.value, reg.width) {
            Some(v) => v,
            None => {
                error!(appliance = %self.appliance_id, "Skipping write to register {}", reg.address);
                return Ok(());
            }
        };
        debug!(
            appliance = %self.appliance_id,
            "Writing {}bit register {}: {:?}", value.width.bits(), reg.address, value.words
        );
        self.client.write_registers(reg.address, &value.words).await?;
        Ok(())
    }
}

#[async_trait]
impl EvControl for ModbusEvControl {
    async fn signals(&mut self) -> Result<ControlSignals, ChargerError> {
        let mut values: HashMap<RegisterKey, IntegerRegister> = HashMap::new();
        let regs: Vec<ReadRegister> = self.registers.read_registers().into_iter().cloned().collect();
        for reg in regs {
            if values.contains_key(&reg.key()) {
                continue;
            }
            let words = self
                .client
                .read_registers(reg.kind, reg.address, reg.width.words())
                .await?;
            let mut value = IntegerRegister::new(reg.width);
            value.set_words(&words);
            debug!(appliance = %self.appliance_id, "Register {} value={:?}", reg.address, value.value());
            values.insert(reg.key(), value);
        }
        Ok(self.registers.signals(&values))
    }

    async fn start_charging(&mut self) -> Result<(), ChargerError> {
        self.write(self.registers.start_charging.clone()).await
    }

    async fn stop_charging(&mut self) -> Result<(), ChargerError> {
        self.write(self.registers.stop_charging.clone()).await
    }
}
