//! State of charge estimation.
//!
//! Vehicles only report their SOC through a slow external script. Between two
//! readings the SOC is interpolated from the energy metered since the last
//! reading, corrected by a charge loss which is recalibrated from every
//! reading.

use crate::ev::vehicle::Vehicle;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, trace};

/// Remaining energy in Wh below which charging is considered almost completed
pub const ALMOST_COMPLETED_ENERGY_WH: i64 = 1000;

/// Energy demand of the scheduling subsystem
pub trait DemandRequest {
    /// Maximum energy in Wh still to be charged at `now`
    fn get_max(&self, now: DateTime<Utc>) -> i64;
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct MeterSample {
    /// Cumulative energy in Wh
    pub energy_wh: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct SocValues {
    pub initial: Option<u8>,
    pub current: Option<u8>,
    pub retrieved: Option<u8>,
    pub initial_timestamp: Option<DateTime<Utc>>,
    pub retrieved_timestamp: Option<DateTime<Utc>>,
    pub battery_capacity_wh: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocScriptResult {
    pub plugged_in: Option<bool>,
    pub soc: u8,
}

/// Request for a ground-truth SOC reading. `epoch` identifies the session the
/// reading was requested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocRequest {
    pub vehicle_id: u32,
    pub epoch: u64,
}

/// Result of a SOC script run, delivered asynchronously
#[derive(Debug, Clone, PartialEq)]
pub struct SocReading {
    pub request: SocRequest,
    pub timestamp: DateTime<Utc>,
    pub outcome: Result<SocScriptResult, String>,
}

pub trait SocRetrieval {
    fn trigger_execution(&mut self, request: SocRequest);
}

pub fn percent(v: f64) -> String {
    format!("{:.0}%", v)
}

pub struct SocEstimator {
    appliance_id: String,
    vehicles: Vec<Vehicle>,
    /// Only set once a SOC reading identified the plugged in vehicle
    connected_vehicle_id: Option<u32>,
    epoch: u64,
    /// Meter energy at the last SOC reading
    baseline_energy_wh: Option<f64>,
    meter_sample: Option<MeterSample>,
    soc_values: SocValues,
    calculation_required: bool,
    charge_loss: f64,
    almost_completed: bool,
    almost_completed_retrieved: bool,
    /// Vehicles with a reading requested but not delivered yet
    pending: BTreeSet<u32>,
}

impl SocEstimator {
    pub fn new(appliance_id: &str, vehicles: Vec<Vehicle>) -> Self {
        Self {
            appliance_id: appliance_id.to_owned(),
            vehicles,
            connected_vehicle_id: None,
            epoch: 0,
            baseline_energy_wh: None,
            meter_sample: None,
            soc_values: SocValues::default(),
            calculation_required: false,
            charge_loss: 0.0,
            almost_completed: false,
            almost_completed_retrieved: false,
            pending: BTreeSet::new(),
        }
    }

    pub fn soc_values(&self) -> &SocValues {
        &self.soc_values
    }

    pub fn charge_loss(&self) -> f64 {
        self.charge_loss
    }

    #[cfg(test)]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn connected_vehicle_id(&self) -> Option<u32> {
        self.connected_vehicle_id
    }

    pub fn vehicle(&self, id: u32) -> Option<&Vehicle> {
        self.vehicles.iter().find(|v| v.id == id)
    }

    pub fn connected_or_first_vehicle(&self) -> Option<&Vehicle> {
        match self.connected_vehicle_id {
            Some(id) => self.vehicle(id),
            None => self.vehicles.first(),
        }
    }

    /// Store the latest meter reading and schedule a SOC recalculation.
    pub fn set_meter_sample(&mut self, sample: MeterSample) {
        if self.baseline_energy_wh.is_none() {
            self.baseline_energy_wh = Some(sample.energy_wh);
        }
        self.meter_sample = Some(sample);
        self.calculation_required = true;
    }

    pub fn on_vehicle_disconnected(&mut self) {
        self.connected_vehicle_id = None;
        self.soc_values = SocValues::default();
        self.baseline_energy_wh = self.meter_sample.map(|s| s.energy_wh);
        self.almost_completed = false;
        self.almost_completed_retrieved = false;
        self.pending.clear();
        self.epoch += 1;
    }

    pub fn on_charging_completed(&mut self) {
        self.almost_completed_retrieved = false;
    }

    /// Recalculate the current SOC if new meter data arrived and trigger a SOC
    /// reading if required. Returns whether the current SOC changed.
    pub fn update_soc(
        &mut self,
        now: DateTime<Utc>,
        demand: Option<&dyn DemandRequest>,
        retrieval: &mut dyn SocRetrieval,
    ) -> bool {
        let mut changed = false;
        if self.calculation_required {
            if let Some(soc) = self.calculate_current_soc() {
                changed = self.soc_values.current.map_or(false, |c| c != soc);
                self.soc_values.current = Some(soc);
            }
            if let Some(demand) = demand {
                if demand.get_max(now) < ALMOST_COMPLETED_ENERGY_WH {
                    self.almost_completed = true;
                }
            }
            self.calculation_required = false;
        }
        debug!(
            appliance = %self.appliance_id,
            "SOC retrieval: socChanged={} chargingAlmostCompleted={} socRetrievalForChargingAlmostCompleted={}",
            changed, self.almost_completed, self.almost_completed_retrieved
        );

        if self.connected_vehicle_id.is_none() && self.soc_values.initial.is_none() {
            self.identify_vehicle(retrieval);
            return changed;
        }

        let (vehicle_id, update_after_increase, update_after_seconds) =
            match self.connected_or_first_vehicle() {
                Some(Vehicle {
                    id,
                    soc_script: Some(script),
                    ..
                }) => (
                    *id,
                    script.update_after_increase(),
                    script.update_after_seconds,
                ),
                _ => return changed,
            };

        if self.pending.contains(&vehicle_id) {
            debug!(appliance = %self.appliance_id, "SOC retrieval is pending");
            return changed;
        }

        let v = &self.soc_values;
        let increased = match (v.retrieved, v.current) {
            (Some(retrieved), Some(current)) => {
                retrieved as u16 + update_after_increase as u16 <= current as u16
                    && match (update_after_seconds, v.retrieved_timestamp) {
                        (Some(secs), Some(ts)) => now - Duration::seconds(secs as i64) > ts,
                        _ => true,
                    }
            }
            _ => false,
        };
        let required = v.initial.is_none()
            || v.retrieved.is_none()
            || (self.almost_completed && !self.almost_completed_retrieved)
            || increased;

        if required {
            debug!(appliance = %self.appliance_id, "SOC retrieval is required: {:?}", self.soc_values);
            self.request_reading(vehicle_id, retrieval);
        } else {
            debug!(appliance = %self.appliance_id, "SOC retrieval is NOT required: {:?}", self.soc_values);
        }
        changed
    }

    /// Ask every vehicle with a SOC script for a reading. The first one
    /// reporting to be plugged in becomes the connected vehicle.
    fn identify_vehicle(&mut self, retrieval: &mut dyn SocRetrieval) {
        let candidates: Vec<u32> = self
            .vehicles
            .iter()
            .filter(|v| v.soc_script.is_some() && !self.pending.contains(&v.id))
            .map(|v| v.id)
            .collect();
        for vehicle_id in candidates {
            debug!(appliance = %self.appliance_id, "SOC retrieval to identify connected vehicle: id={}", vehicle_id);
            self.request_reading(vehicle_id, retrieval);
        }
    }

    fn request_reading(&mut self, vehicle_id: u32, retrieval: &mut dyn SocRetrieval) {
        self.pending.insert(vehicle_id);
        retrieval.trigger_execution(SocRequest {
            vehicle_id,
            epoch: self.epoch,
        });
    }

    fn calculate_current_soc(&self) -> Option<u8> {
        let vehicle = self.connected_or_first_vehicle()?;
        if vehicle.battery_capacity_wh == 0 {
            return None;
        }
        let energy = self.energy_metered_since_last_retrieval();
        let baseline = self
            .soc_values
            .retrieved
            .or(self.soc_values.initial)
            .unwrap_or(0);
        let soc = (baseline as f64
            + energy as f64 / (vehicle.battery_capacity_wh as f64 * (1.0 + self.charge_loss / 100.0))
                * 100.0)
            .round();
        // the cast saturates at 0
        let current = soc.min(100.0) as u8;
        debug!(
            appliance = %self.appliance_id,
            "SOC calculation: socCurrent={} socRetrievedOrInitial={} batteryCapacity={}Wh energyMeteredSinceLastSocScriptExecution={}Wh chargeLoss={}",
            percent(current as f64), percent(baseline as f64), vehicle.battery_capacity_wh, energy, percent(self.charge_loss)
        );
        Some(current)
    }

    /// Wh metered since the last SOC reading
    pub fn energy_metered_since_last_retrieval(&self) -> i64 {
        let energy = match (self.meter_sample, self.baseline_energy_wh) {
            (Some(sample), Some(baseline)) => (sample.energy_wh - baseline) as i64,
            _ => 0,
        };
        trace!(
            appliance = %self.appliance_id,
            "energyMeteredSinceLastSocScriptExecution={} meterSample={:?} baseline={:?}",
            energy, self.meter_sample, self.baseline_energy_wh
        );
        energy
    }

    /// Fold a SOC reading into the estimate. Returns false if the reading was
    /// discarded.
    pub fn soc_retrieved(&mut self, request: SocRequest, result: SocScriptResult, now: DateTime<Utc>) -> bool {
        if request.epoch != self.epoch {
            debug!(appliance = %self.appliance_id, "Discarding SOC of previous session: {:?}", request);
            return false;
        }
        self.pending.remove(&request.vehicle_id);
        if let Some(id) = self.connected_vehicle_id {
            if id != request.vehicle_id {
                debug!(appliance = %self.appliance_id, "Discarding SOC of vehicle {} while {} is connected", request.vehicle_id, id);
                return false;
            }
        }

        if self.connected_vehicle_id.is_none() && result.plugged_in == Some(true) {
            info!(appliance = %self.appliance_id, "Connected vehicle identified: id={}", request.vehicle_id);
            self.connected_vehicle_id = Some(request.vehicle_id);
        }
        if result.plugged_in == Some(false) {
            debug!(appliance = %self.appliance_id, "Vehicle {} is not plugged in", request.vehicle_id);
            return false;
        }

        let soc = result.soc.min(100);
        let last_retrieved = self.soc_values.retrieved.or(self.soc_values.initial);
        if self.soc_values.initial.is_none() {
            self.soc_values.initial = Some(soc);
            self.soc_values.initial_timestamp = Some(now);
            self.soc_values.battery_capacity_wh = self.vehicle(request.vehicle_id).map(|v| v.battery_capacity_wh);
        }
        self.soc_values.current = Some(soc);
        if last_retrieved.is_some() {
            let energy = self.energy_metered_since_last_retrieval();
            if let Some(charge_loss) = self.calculate_charge_loss(energy) {
                self.charge_loss = charge_loss.max(0.0);
            }
        }
        self.soc_values.retrieved = Some(soc);
        self.soc_values.retrieved_timestamp = Some(now);
        self.baseline_energy_wh = self.meter_sample.map(|s| s.energy_wh);
        if self.almost_completed {
            self.almost_completed_retrieved = true;
        }
        info!(
            appliance = %self.appliance_id,
            "SOC retrieved: soc={} chargeLoss={}", percent(soc as f64), percent(self.charge_loss)
        );
        true
    }

    pub fn soc_retrieval_failed(&mut self, request: SocRequest, reason: &str) {
        if request.epoch == self.epoch {
            self.pending.remove(&request.vehicle_id);
        }
        info!(appliance = %self.appliance_id, "SOC retrieval failed for vehicle {}: {}", request.vehicle_id, reason);
    }

    /// Charge loss in percent derived from the energy metered and the SOC
    /// gained since the previous reading.
    pub fn calculate_charge_loss(&self, energy_metered_wh: i64) -> Option<f64> {
        let capacity = self
            .soc_values
            .battery_capacity_wh
            .or_else(|| self.connected_or_first_vehicle().map(|v| v.battery_capacity_wh))?;
        if energy_metered_wh <= 0 {
            return None;
        }
        let current = self.soc_values.current?;
        let previous = self.soc_values.retrieved.or(self.soc_values.initial)?;
        let received = (current as f64 - previous as f64) / 100.0 * capacity as f64;
        if received <= 0.0 {
            return None;
        }
        let charge_loss = energy_metered_wh as f64 * 100.0 / received - 100.0;
        debug!(
            appliance = %self.appliance_id,
            "charge loss calculation: chargeLoss={} socCurrent={} socLastRetrieval={} batteryCapacity={}Wh energyMetered={}Wh energyReceivedByEv={}Wh",
            percent(charge_loss), percent(current as f64), percent(previous as f64), capacity, energy_metered_wh, received as i64
        );
        Some(charge_loss)
    }
}
