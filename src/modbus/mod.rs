pub mod client;
pub mod codec;
pub mod ev_control;
pub mod meter;

#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    #[error("modbus transport: {0}")]
    Transport(String),

    #[error("modbus exception: {0}")]
    Exception(String),

    #[error("{0}")]
    Codec(String),
}

impl From<std::io::Error> for ModbusError {
    fn from(e: std::io::Error) -> Self {
        ModbusError::Transport(e.to_string())
    }
}
