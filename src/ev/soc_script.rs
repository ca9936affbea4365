use crate::ev::soc::{SocReading, SocRequest, SocRetrieval, SocScriptResult};
use crate::ev::vehicle::{SocScript, Vehicle};
use crate::ev::ChargerError;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT_SECONDS: u64 = 120;

/// Runs SOC scripts in the background and sends their readings to a channel.
/// At most one run per vehicle is in flight; further triggers are dropped.
pub struct SocScriptExecutor {
    appliance_id: String,
    scripts: HashMap<u32, SocScript>,
    running: Arc<Mutex<HashSet<u32>>>,
    readings: UnboundedSender<SocReading>,
}

impl SocScriptExecutor {
    pub fn new(appliance_id: &str, vehicles: &[Vehicle]) -> (Self, UnboundedReceiver<SocReading>) {
        let (tx, rx) = unbounded_channel();
        let scripts = vehicles
            .iter()
            .filter_map(|v| v.soc_script.clone().map(|s| (v.id, s)))
            .collect();
        (
            Self {
                appliance_id: appliance_id.to_owned(),
                scripts,
                running: Arc::new(Mutex::new(HashSet::new())),
                readings: tx,
            },
            rx,
        )
    }

    #[cfg(test)]
    pub fn is_running(&self, vehicle_id: u32) -> bool {
        self.running
            .lock()
            .map(|r| r.contains(&vehicle_id))
            .unwrap_or(false)
    }

    pub fn spawn(&self, request: SocRequest) -> Option<JoinHandle<()>> {
        let script = match self.scripts.get(&request.vehicle_id) {
            Some(s) => s.clone(),
            None => {
                warn!(appliance = %self.appliance_id, "No SOC script configured for vehicle {}", request.vehicle_id);
                return None;
            }
        };
        {
            let mut running = self.running.lock().ok()?;
            if !running.insert(request.vehicle_id) {
                debug!(appliance = %self.appliance_id, "SOC script already running for vehicle {}", request.vehicle_id);
                return None;
            }
        }

        let appliance_id = self.appliance_id.clone();
        let running = self.running.clone();
        let tx = self.readings.clone();
        Some(tokio::spawn(async move {
            info!(appliance = %appliance_id, "Executing SOC script: {}", script.script);
            let outcome = run_script(&script).await.map_err(|e| e.to_string());
            if let Err(e) = &outcome {
                warn!(appliance = %appliance_id, "SOC script failed: {}", e);
            }
            if let Ok(mut r) = running.lock() {
                r.remove(&request.vehicle_id);
            }
            // the receiver is gone when the charger shuts down
            let _ = tx.send(SocReading {
                request,
                timestamp: Utc::now(),
                outcome,
            });
        }))
    }
}

impl SocRetrieval for SocScriptExecutor {
    fn trigger_execution(&mut self, request: SocRequest) {
        self.spawn(request);
    }
}

async fn run_script(script: &SocScript) -> Result<SocScriptResult, ChargerError> {
    let timeout = Duration::from_secs(script.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS));
    let output = tokio::time::timeout(timeout, Command::new(&script.script).kill_on_drop(true).output())
        .await
        .map_err(|_| ChargerError::Script(format!("{} timed out", script.script)))??;
    if !output.status.success() {
        return Err(ChargerError::Script(format!(
            "{} exited with {}",
            script.script, output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!("SOC script output: {}", stdout.trim());
    parse_output(&stdout, script)
}

/// Extract SOC and plugged in state from the output of a SOC script.
pub fn parse_output(output: &str, script: &SocScript) -> Result<SocScriptResult, ChargerError> {
    let soc_str = match &script.extraction_regex {
        Some(re) => re
            .first_capture(output)
            .ok_or(ChargerError::Script(format!("SOC not found in output: {}", output.trim())))?,
        None => output.trim(),
    };
    let soc: f64 = soc_str
        .trim()
        .parse()
        .map_err(|_| ChargerError::Script(format!("Invalid SOC: {}", soc_str)))?;
    if !(0.0..=100.0).contains(&soc) {
        return Err(ChargerError::Script(format!("SOC out of range: {}", soc)));
    }
    let plugged_in = match &script.plugged_in_regex {
        Some(re) => Some(re.is_match(output)),
        None => None,
    };
    Ok(SocScriptResult {
        plugged_in,
        soc: soc as u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ev::vehicle::OutputPattern;

    fn script(extraction_regex: Option<&str>, plugged_in_regex: Option<&str>) -> SocScript {
        SocScript {
            script: "/bin/echo".to_owned(),
            update_after_increase: None,
            update_after_seconds: None,
            extraction_regex: extraction_regex.map(|p| OutputPattern::new(p).unwrap()),
            plugged_in_regex: plugged_in_regex.map(|p| OutputPattern::new(p).unwrap()),
            timeout_seconds: None,
        }
    }

    #[test]
    fn parse_plain_number() {
        let r = parse_output("  42.7\n", &script(None, None)).unwrap();
        assert_eq!(r.soc, 42);
        assert_eq!(r.plugged_in, None);
    }

    #[test]
    fn parse_with_regexes() {
        let s = script(Some(r"soc=(\d+)"), Some(r"plugged=true"));
        let r = parse_output("range=210 soc=67 plugged=true", &s).unwrap();
        assert_eq!(r.soc, 67);
        assert_eq!(r.plugged_in, Some(true));

        let r = parse_output("soc=67 plugged=false", &s).unwrap();
        assert_eq!(r.plugged_in, Some(false));
    }

    #[test]
    fn parse_errors() {
        assert!(parse_output("n/a", &script(None, None)).is_err());
        assert!(parse_output("101", &script(None, None)).is_err());
        assert!(parse_output("range=210", &script(Some(r"soc=(\d+)"), None)).is_err());
    }

    #[tokio::test]
    async fn executor_delivers_reading() {
        let mut s = script(None, None);
        s.script = "/bin/pwd".to_owned();
        let vehicle = Vehicle {
            id: 7,
            name: "EV".to_owned(),
            battery_capacity_wh: 40000,
            target_soc: None,
            soc_script: Some(s),
        };
        let (executor, mut rx) = SocScriptExecutor::new("TEST", &[vehicle]);
        let request = SocRequest {
            vehicle_id: 7,
            epoch: 3,
        };
        let handle = executor.spawn(request).unwrap();
        assert!(executor.spawn(request).is_none(), "coalesced");
        handle.await.unwrap();

        let reading = rx.recv().await.unwrap();
        assert_eq!(reading.request, request);
        // pwd does not print a number
        assert!(reading.outcome.is_err());
        assert!(!executor.is_running(7));
    }

    #[tokio::test]
    async fn executor_without_script() {
        let (executor, _rx) = SocScriptExecutor::new("TEST", &[]);
        assert!(executor
            .spawn(SocRequest {
                vehicle_id: 1,
                epoch: 0
            })
            .is_none());
    }
}
