use crate::modbus::ModbusError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};

/// Register table a read goes to.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ReadKind {
    #[default]
    Holding,
    Input,
}

pub struct ModbusClient {
    client: Context,
}

impl ModbusClient {
    pub async fn new(addr: SocketAddr) -> Result<Self, ModbusError> {
        let ctx = tcp::connect(addr).await?;
        Ok(Self { client: ctx })
    }

    pub fn set_unit(&mut self, unit: u8) {
        self.client.set_slave(Slave(unit))
    }

    pub async fn read_registers(
        &mut self,
        kind: ReadKind,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let words = match kind {
            ReadKind::Holding => self.client.read_holding_registers(addr, count).await,
            ReadKind::Input => self.client.read_input_registers(addr, count).await,
        }
        .map_err(|e| ModbusError::Transport(e.to_string()))?
        .map_err(|e| ModbusError::Exception(format!("{:?}", e)))?;
        Ok(words)
    }

    pub async fn write_registers(&mut self, addr: u16, words: &[u16]) -> Result<(), ModbusError> {
        match words {
            [w] => self.client.write_single_register(addr, *w).await,
            _ => self.client.write_multiple_registers(addr, words).await,
        }
        .map_err(|e| ModbusError::Transport(e.to_string()))?
        .map_err(|e| ModbusError::Exception(format!("{:?}", e)))?;
        Ok(())
    }
}
