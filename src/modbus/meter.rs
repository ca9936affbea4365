use crate::ev::charger::EnergyMeter;
use crate::ev::ChargerError;
use crate::modbus::client::{ModbusClient, ReadKind};
use crate::modbus::codec::{IntegerRegister, RegisterWidth};
use crate::modbus::ModbusError;
use async_trait::async_trait;
use serde::Deserialize;

fn default_width() -> RegisterWidth {
    RegisterWidth::Bits32
}

fn default_scale() -> f64 {
    1.0
}

/// Register holding the cumulative energy counter of the charger
#[derive(Deserialize, Debug, Clone)]
pub struct MeterRegister {
    pub address: u16,

    #[serde(default = "default_width")]
    pub width: RegisterWidth,

    #[serde(default)]
    pub kind: ReadKind,

    /// Wh per counter unit
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl MeterRegister {
    pub fn energy_wh(&self, words: &[u16]) -> Option<f64> {
        let mut value = IntegerRegister::new(self.width);
        value.set_words(words);
        value.value().map(|v| v as f64 * self.scale)
    }
}

pub struct ModbusEnergyMeter {
    client: ModbusClient,
    register: MeterRegister,
}

impl ModbusEnergyMeter {
    pub fn new(client: ModbusClient, register: MeterRegister) -> Self {
        Self { client, register }
    }
}

#[async_trait]
impl EnergyMeter for ModbusEnergyMeter {
    async fn energy_wh(&mut self) -> Result<f64, ChargerError> {
        let reg = &self.register;
        let words = self
            .client
            .read_registers(reg.kind, reg.address, reg.width.words())
            .await?;
        let energy = self.register.energy_wh(&words).ok_or(ModbusError::Codec(format!(
            "No energy value in register {}",
            self.register.address
        )))?;
        Ok(energy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_scaled() {
        let reg: MeterRegister = serde_json::from_str(r#"{ "address": 300, "scale": 10.0 }"#).unwrap();
        assert_eq!(reg.width, RegisterWidth::Bits32);
        assert_eq!(reg.kind, ReadKind::Holding);
        assert_eq!(reg.energy_wh(&[0x0001, 0x0000]), Some(655360.0));
        assert_eq!(reg.energy_wh(&[1, 2, 3]), None);
    }
}
