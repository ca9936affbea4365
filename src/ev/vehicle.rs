use crate::ev::soc::DemandRequest;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

/// SOC increase in percent after which a fresh reading is requested
pub const DEFAULT_UPDATE_SOC_AFTER_INCREASE: u8 = 20;

#[derive(Deserialize, Debug, Clone)]
pub struct Vehicle {
    pub id: u32,

    pub name: String,

    /// Usable battery capacity in Wh
    pub battery_capacity_wh: u32,

    /// SOC the vehicle should be charged to
    #[serde(default)]
    pub target_soc: Option<u8>,

    #[serde(default)]
    pub soc_script: Option<SocScript>,
}

/// External program reporting the SOC of a vehicle.
#[derive(Deserialize, Debug, Clone)]
pub struct SocScript {
    /// Executable to run
    pub script: String,

    /// Percent the estimated SOC has to rise before the script runs again
    #[serde(default)]
    pub update_after_increase: Option<u8>,

    /// Minimum number of seconds between two runs
    #[serde(default)]
    pub update_after_seconds: Option<u32>,

    /// Regex whose first capture group holds the SOC.
    /// Without it the whole output is parsed.
    #[serde(default)]
    pub extraction_regex: Option<OutputPattern>,

    /// Regex matching the output if the vehicle is plugged in
    #[serde(default)]
    pub plugged_in_regex: Option<OutputPattern>,

    /// Seconds after which a run is abandoned
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl SocScript {
    pub fn update_after_increase(&self) -> u8 {
        self.update_after_increase
            .unwrap_or(DEFAULT_UPDATE_SOC_AFTER_INCREASE)
    }
}

/// Regex applied to the output of a SOC script, compiled when the
/// configuration is loaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct OutputPattern(Regex);

impl OutputPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(OutputPattern(Regex::new(pattern)?))
    }

    /// First capture group of the first match
    pub fn first_capture<'a>(&self, s: &'a str) -> Option<&'a str> {
        self.0.captures(s).and_then(|c| c.get(1)).map(|m| m.as_str())
    }

    pub fn is_match(&self, s: &str) -> bool {
        self.0.is_match(s)
    }
}

impl TryFrom<String> for OutputPattern {
    type Error = regex::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        OutputPattern::new(&s)
    }
}

/// Energy still needed to lift a vehicle from its current SOC to a target.
#[derive(Debug, Clone, Copy)]
pub struct SocTargetRequest {
    pub battery_capacity_wh: u32,
    pub current_soc: u8,
    pub target_soc: u8,
}

impl DemandRequest for SocTargetRequest {
    fn get_max(&self, _now: DateTime<Utc>) -> i64 {
        let missing = self.target_soc as i64 - self.current_soc as i64;
        if missing <= 0 {
            return 0;
        }
        missing * self.battery_capacity_wh as i64 / 100
    }
}
