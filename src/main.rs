use crate::ev::charger::{EnergyMeter, EvCharger};
use crate::ev::soc::SocEstimator;
use crate::ev::soc_script::SocScriptExecutor;
use crate::ev::state::ChargingStateMachine;
use crate::ev::{ChargerConfig, ChargerError, DEFAULT_CONFIG_PATH};
use crate::modbus::client::ModbusClient;
use crate::modbus::ev_control::ModbusEvControl;
use crate::modbus::meter::ModbusEnergyMeter;
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod ev;
mod modbus;

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> Result<(), ChargerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args().nth(1).unwrap_or(DEFAULT_CONFIG_PATH.to_owned());
    let cfg = ChargerConfig::load(&path)?;
    info!(appliance = %cfg.appliance_id, "Loaded {} with {} vehicles", path, cfg.vehicles.len());

    let mut client = ModbusClient::new(cfg.modbus.address).await?;
    client.set_unit(cfg.modbus.unit);
    let control = ModbusEvControl::new(&cfg.appliance_id, client, cfg.control.clone());

    let meter: Option<Box<dyn EnergyMeter>> = match &cfg.meter {
        Some(reg) => {
            let mut client = ModbusClient::new(cfg.modbus.address).await?;
            client.set_unit(cfg.modbus.unit);
            Some(Box::new(ModbusEnergyMeter::new(client, reg.clone())))
        }
        None => None,
    };

    let (executor, readings) = SocScriptExecutor::new(&cfg.appliance_id, &cfg.vehicles);
    let mut charger = EvCharger::new(
        &cfg.appliance_id,
        control,
        meter,
        ChargingStateMachine::new(&cfg.appliance_id, cfg.start_charging_state_detection_delay),
        SocEstimator::new(&cfg.appliance_id, cfg.vehicles.clone()),
        executor,
        readings,
    );

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.poll_interval_seconds));
    loop {
        interval.tick().await;
        match charger.tick(Utc::now()).await {
            Ok(status) => info!(
                appliance = %cfg.appliance_id,
                "{}",
                serde_json::to_string(&status).unwrap_or_default()
            ),
            Err(e) => warn!(appliance = %cfg.appliance_id, "Control cycle failed: {}", e),
        }
    }
}
