use crate::ev::soc::{DemandRequest, MeterSample, SocEstimator, SocReading, SocRetrieval, SocValues};
use crate::ev::state::{ChargerState, ChargingStateMachine, ControlSignals};
use crate::ev::vehicle::SocTargetRequest;
use crate::ev::ChargerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Charger hardware: polled for its state, told to start and stop charging.
#[async_trait]
pub trait EvControl: Send {
    async fn signals(&mut self) -> Result<ControlSignals, ChargerError>;

    async fn start_charging(&mut self) -> Result<(), ChargerError>;

    async fn stop_charging(&mut self) -> Result<(), ChargerError>;
}

#[async_trait]
pub trait EnergyMeter: Send {
    /// Cumulative energy in Wh
    async fn energy_wh(&mut self) -> Result<f64, ChargerError>;
}

/// Snapshot published after each control cycle
#[derive(Serialize, Debug, Clone)]
pub struct ChargerStatus {
    pub state: ChargerState,
    pub relay_on: bool,
    pub soc: SocValues,
    pub charge_loss: f64,
    pub vehicle_id: Option<u32>,
}

/// One charging point: the state machine, SOC estimation and the hardware they drive.
pub struct EvCharger<C: EvControl, R: SocRetrieval> {
    appliance_id: String,
    control: C,
    meter: Option<Box<dyn EnergyMeter>>,
    state_machine: ChargingStateMachine,
    estimator: SocEstimator,
    retrieval: R,
    readings: UnboundedReceiver<SocReading>,
    relay_on: bool,
}

impl<C: EvControl, R: SocRetrieval> EvCharger<C, R> {
    pub fn new(
        appliance_id: &str,
        control: C,
        meter: Option<Box<dyn EnergyMeter>>,
        state_machine: ChargingStateMachine,
        estimator: SocEstimator,
        retrieval: R,
        readings: UnboundedReceiver<SocReading>,
    ) -> Self {
        Self {
            appliance_id: appliance_id.to_owned(),
            control,
            meter,
            state_machine,
            estimator,
            retrieval,
            readings,
            relay_on: false,
        }
    }

    #[cfg(test)]
    pub fn state_machine(&self) -> &ChargingStateMachine {
        &self.state_machine
    }

    #[cfg(test)]
    pub fn estimator(&self) -> &SocEstimator {
        &self.estimator
    }

    pub fn start_charging(&mut self) {
        info!(appliance = %self.appliance_id, "Start charging requested");
        self.state_machine.request_start_charging();
    }

    pub fn stop_charging(&mut self) {
        info!(appliance = %self.appliance_id, "Stop charging requested");
        self.state_machine.request_stop_charging(true);
    }

    /// Energy still missing to reach the target SOC of the connected vehicle
    pub fn demand(&self) -> Option<SocTargetRequest> {
        let vehicle = self.estimator.connected_or_first_vehicle()?;
        let soc = self.estimator.soc_values();
        // estimates before the first reading are meaningless
        soc.initial?;
        Some(SocTargetRequest {
            battery_capacity_wh: vehicle.battery_capacity_wh,
            current_soc: soc.current?,
            target_soc: vehicle.target_soc?,
        })
    }

    fn fold_readings(&mut self) {
        while let Ok(reading) = self.readings.try_recv() {
            match reading.outcome {
                Ok(result) => {
                    self.estimator
                        .soc_retrieved(reading.request, result, reading.timestamp);
                }
                Err(e) => self.estimator.soc_retrieval_failed(reading.request, &e),
            }
        }
    }

    /// Run one control cycle.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<ChargerStatus, ChargerError> {
        self.fold_readings();

        let signals = self.control.signals().await?;
        debug!(appliance = %self.appliance_id, "{:?}", signals);
        let eval = self.state_machine.evaluate(&signals, now);
        for state in &eval.entered {
            match state {
                ChargerState::NotConnected => self.estimator.on_vehicle_disconnected(),
                ChargerState::ChargingCompleted => self.estimator.on_charging_completed(),
                _ => {}
            }
        }

        if eval.relay_on != self.relay_on {
            if eval.relay_on {
                self.control.start_charging().await?;
            } else {
                self.control.stop_charging().await?;
            }
            self.relay_on = eval.relay_on;
        }

        if let Some(meter) = self.meter.as_mut() {
            match meter.energy_wh().await {
                Ok(energy_wh) => self.estimator.set_meter_sample(MeterSample {
                    energy_wh,
                    timestamp: now,
                }),
                Err(e) => warn!(appliance = %self.appliance_id, "Energy meter not available: {}", e),
            }
        }

        if eval.state != ChargerState::NotConnected {
            let demand = self.demand();
            let changed = self.estimator.update_soc(
                now,
                demand.as_ref().map(|d| d as &dyn DemandRequest),
                &mut self.retrieval,
            );
            if changed {
                info!(appliance = %self.appliance_id, "SOC changed: {:?}", self.estimator.soc_values().current);
            }
        }

        self.follow_demand(now);

        Ok(ChargerStatus {
            state: eval.state,
            relay_on: self.relay_on,
            soc: self.estimator.soc_values().clone(),
            charge_loss: self.estimator.charge_loss(),
            vehicle_id: self.estimator.connected_vehicle_id(),
        })
    }

    /// Request start or stop from the target SOC of the connected vehicle.
    fn follow_demand(&mut self, now: DateTime<Utc>) {
        let demand = match self.demand() {
            Some(d) => d.get_max(now),
            None => return,
        };
        let session = self.state_machine.session();
        let requested = session.start_requested || session.stop_requested;
        match self.state_machine.state() {
            ChargerState::Connected if demand > 0 && !requested => self.start_charging(),
            ChargerState::Charging if demand <= 0 => self.stop_charging(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ev::soc::{SocRequest, SocScriptResult};
    use crate::ev::state::DEFAULT_DETECTION_DELAY_SECONDS;
    use crate::ev::vehicle::{SocScript, Vehicle};
    use chrono::{Duration, TimeZone};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    #[derive(Default)]
    struct Hardware {
        signals: ControlSignals,
        starts: usize,
        stops: usize,
        energy_wh: f64,
    }

    #[derive(Clone, Default)]
    struct FakeControl(Arc<Mutex<Hardware>>);

    #[async_trait]
    impl EvControl for FakeControl {
        async fn signals(&mut self) -> Result<ControlSignals, ChargerError> {
            Ok(self.0.lock().unwrap().signals)
        }

        async fn start_charging(&mut self) -> Result<(), ChargerError> {
            self.0.lock().unwrap().starts += 1;
            Ok(())
        }

        async fn stop_charging(&mut self) -> Result<(), ChargerError> {
            self.0.lock().unwrap().stops += 1;
            Ok(())
        }
    }

    #[async_trait]
    impl EnergyMeter for FakeControl {
        async fn energy_wh(&mut self) -> Result<f64, ChargerError> {
            Ok(self.0.lock().unwrap().energy_wh)
        }
    }

    #[derive(Default)]
    struct Recorder(Vec<SocRequest>);

    impl SocRetrieval for Recorder {
        fn trigger_execution(&mut self, request: SocRequest) {
            self.0.push(request);
        }
    }

    fn charger(target_soc: Option<u8>) -> (EvCharger<FakeControl, Recorder>, FakeControl, UnboundedSender<SocReading>) {
        let vehicle = Vehicle {
            id: 1,
            name: "EV".to_owned(),
            battery_capacity_wh: 10000,
            target_soc,
            soc_script: Some(SocScript {
                script: "/bin/true".to_owned(),
                update_after_increase: None,
                update_after_seconds: None,
                extraction_regex: None,
                plugged_in_regex: None,
                timeout_seconds: None,
            }),
        };
        let hw = FakeControl::default();
        let (tx, rx) = unbounded_channel();
        let charger = EvCharger::new(
            "TEST",
            hw.clone(),
            Some(Box::new(hw.clone()) as Box<dyn EnergyMeter>),
            ChargingStateMachine::new("TEST", DEFAULT_DETECTION_DELAY_SECONDS),
            SocEstimator::new("TEST", vec![vehicle]),
            Recorder::default(),
            rx,
        );
        (charger, hw, tx)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn set(hw: &FakeControl, connected: bool, charging: bool, energy_wh: f64) {
        let mut h = hw.0.lock().unwrap();
        h.signals = ControlSignals {
            vehicle_connected: connected,
            vehicle_not_connected: !connected,
            charging,
            in_error: false,
        };
        h.energy_wh = energy_wh;
    }

    fn reading(request: SocRequest, soc: u8) -> SocReading {
        SocReading {
            request,
            timestamp: t0(),
            outcome: Ok(SocScriptResult {
                plugged_in: Some(true),
                soc,
            }),
        }
    }

    #[tokio::test]
    async fn charging_session() {
        let (mut c, hw, tx) = charger(Some(80));

        set(&hw, true, false, 1000.0);
        let status = c.tick(t0()).await.unwrap();
        assert_eq!(status.state, ChargerState::Connected);
        assert!(!status.relay_on);
        assert_eq!(c.retrieval.0.len(), 1, "initial SOC requested");

        tx.send(reading(c.retrieval.0[0], 50)).unwrap();
        let status = c.tick(t0() + Duration::seconds(20)).await.unwrap();
        assert_eq!(status.soc.initial, Some(50));
        assert_eq!(status.vehicle_id, Some(1));
        // target 80% starts charging on the next cycle
        assert!(c.state_machine().session().start_requested);

        let status = c.tick(t0() + Duration::seconds(40)).await.unwrap();
        assert!(status.relay_on);
        assert_eq!(hw.0.lock().unwrap().starts, 1);

        set(&hw, true, true, 3000.0);
        let status = c.tick(t0() + Duration::seconds(60)).await.unwrap();
        assert_eq!(status.state, ChargerState::Charging);
        assert_eq!(status.soc.current, Some(70));

        // vehicle stops on its own
        set(&hw, true, false, 3000.0);
        let status = c.tick(t0() + Duration::seconds(80)).await.unwrap();
        assert_eq!(status.state, ChargerState::ChargingCompleted);
        assert!(!status.relay_on);
        assert_eq!(hw.0.lock().unwrap().stops, 1);

        set(&hw, false, false, 3000.0);
        let status = c.tick(t0() + Duration::seconds(100)).await.unwrap();
        assert_eq!(status.state, ChargerState::NotConnected);
        assert_eq!(status.soc, SocValues::default());
        assert_eq!(status.vehicle_id, None);
    }

    #[tokio::test]
    async fn stale_reading_after_disconnect() {
        let (mut c, hw, tx) = charger(None);
        set(&hw, true, false, 1000.0);
        c.tick(t0()).await.unwrap();
        let request = c.retrieval.0[0];

        set(&hw, false, false, 1000.0);
        c.tick(t0() + Duration::seconds(20)).await.unwrap();

        tx.send(reading(request, 50)).unwrap();
        set(&hw, true, false, 1000.0);
        let status = c.tick(t0() + Duration::seconds(40)).await.unwrap();
        assert_eq!(status.soc.initial, None);
        assert_eq!(c.retrieval.0.len(), 2);
        assert_eq!(c.retrieval.0[1].epoch, 1);
    }

    #[tokio::test]
    async fn relay_released_when_vehicle_does_not_charge() {
        let (mut c, hw, _tx) = charger(None);
        set(&hw, true, false, 0.0);
        c.tick(t0()).await.unwrap();

        c.start_charging();
        let status = c.tick(t0() + Duration::seconds(20)).await.unwrap();
        assert!(status.relay_on);

        let status = c
            .tick(t0() + Duration::seconds(20 + DEFAULT_DETECTION_DELAY_SECONDS as i64 + 1))
            .await
            .unwrap();
        assert!(!status.relay_on);
        assert_eq!(status.state, ChargerState::Connected);
        let h = hw.0.lock().unwrap();
        assert_eq!((h.starts, h.stops), (1, 1));
    }

    #[tokio::test]
    async fn start_retried_after_vehicle_did_not_charge() {
        let (mut c, hw, tx) = charger(Some(80));
        set(&hw, true, false, 1000.0);
        c.tick(t0()).await.unwrap();
        tx.send(reading(c.retrieval.0[0], 50)).unwrap();
        c.tick(t0() + Duration::seconds(20)).await.unwrap();

        let attempt = t0() + Duration::seconds(40);
        assert!(c.tick(attempt).await.unwrap().relay_on);

        let expired = attempt + Duration::seconds(DEFAULT_DETECTION_DELAY_SECONDS as i64 + 1);
        let status = c.tick(expired).await.unwrap();
        assert!(!status.relay_on);
        assert_eq!(status.state, ChargerState::Connected);
        // the target SOC is still not reached
        assert!(c.state_machine().session().start_requested);

        let status = c.tick(expired + Duration::seconds(20)).await.unwrap();
        assert!(status.relay_on);
        let h = hw.0.lock().unwrap();
        assert_eq!((h.starts, h.stops), (2, 1));
    }

    #[tokio::test]
    async fn repeated_tick_is_stable() {
        let (mut c, hw, _tx) = charger(None);
        set(&hw, true, true, 0.0);
        c.start_charging();
        let first = c.tick(t0()).await.unwrap();
        let second = c.tick(t0()).await.unwrap();
        assert_eq!(first.state, ChargerState::Charging);
        assert_eq!(second.state, ChargerState::Charging);
        assert_eq!(hw.0.lock().unwrap().starts, 1);
        assert_eq!(c.retrieval.0.len(), 1);
    }
}
