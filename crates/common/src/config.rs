use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub bind_addr: String,
    pub http_addr: String,
    pub data_dir: String,
    pub ride: RideConfig,
    pub fare: FareConfig,
    pub routing: RoutingConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RideConfig {
    pub radius_km: f64,
    pub request_timeout_secs: u64,
    pub commission_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FareConfig {
    pub base_fare: f64,
    pub per_km_rate: f64,
    pub per_minute_rate: f64,
    pub minimum_fare: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Without a key every estimate uses the straight-line fallback.
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    pub stats_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:10000".to_string(),
            http_addr: "0.0.0.0:10001".to_string(),
            data_dir: "data".to_string(),
            ride: RideConfig::default(),
            fare: FareConfig::default(),
            routing: RoutingConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Default for RideConfig {
    fn default() -> Self {
        Self {
            radius_km: 5.0,
            request_timeout_secs: 300,
            commission_rate: 0.15,
        }
    }
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            base_fare: 3.0,
            per_km_rate: 1.8,
            per_minute_rate: 0.3,
            minimum_fare: 8.0,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://maps.googleapis.com/maps/api".to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
            stats_interval_secs: 5 * 60,
        }
    }
}

impl RideConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl MaintenanceConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl DispatchConfig {
    /// Applies `TAXI_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TAXI_BIND_ADDR") {
            self.bind_addr = value;
        }
        if let Some(value) = lookup("TAXI_HTTP_ADDR") {
            self.http_addr = value;
        }
        if let Some(value) = lookup("TAXI_DATA_DIR") {
            self.data_dir = value;
        }
        override_parsed(&lookup, "TAXI_RADIUS_KM", &mut self.ride.radius_km)?;
        override_parsed(
            &lookup,
            "TAXI_REQUEST_TIMEOUT_SECS",
            &mut self.ride.request_timeout_secs,
        )?;
        override_parsed(&lookup, "TAXI_COMMISSION_RATE", &mut self.ride.commission_rate)?;
        override_parsed(&lookup, "TAXI_BASE_FARE", &mut self.fare.base_fare)?;
        override_parsed(&lookup, "TAXI_PER_KM_RATE", &mut self.fare.per_km_rate)?;
        override_parsed(&lookup, "TAXI_PER_MINUTE_RATE", &mut self.fare.per_minute_rate)?;
        override_parsed(&lookup, "TAXI_MINIMUM_FARE", &mut self.fare.minimum_fare)?;
        if let Some(value) = lookup("TAXI_MAPS_API_KEY") {
            self.routing.api_key = if value.trim().is_empty() {
                None
            } else {
                Some(value)
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.ride.radius_km > 0.0) {
            bail!("ride.radius_km must be positive");
        }
        if self.ride.request_timeout_secs == 0 {
            bail!("ride.request_timeout_secs must be positive");
        }
        if !(0.0..1.0).contains(&self.ride.commission_rate) {
            bail!("ride.commission_rate must be in [0, 1)");
        }
        let fare = &self.fare;
        for (name, value) in [
            ("fare.base_fare", fare.base_fare),
            ("fare.per_km_rate", fare.per_km_rate),
            ("fare.per_minute_rate", fare.per_minute_rate),
            ("fare.minimum_fare", fare.minimum_fare),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("{name} must be a non-negative number");
            }
        }
        if self.maintenance.sweep_interval_secs == 0 || self.maintenance.stats_interval_secs == 0 {
            bail!("maintenance intervals must be positive");
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid {key}={raw}: {err}"))?;
    }
    Ok(())
}

pub fn load_config<T: for<'de> Deserialize<'de>>(path: &str) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    Ok(config)
}

/// Loads the file when present, falls back to defaults otherwise, then
/// applies environment overrides and validates.
pub fn load_dispatch_config(path: &str) -> anyhow::Result<DispatchConfig> {
    let mut config = if Path::new(path).exists() {
        load_config(path).with_context(|| format!("reading {path}"))?
    } else {
        DispatchConfig::default()
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DispatchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ride.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.maintenance.retention(), Duration::from_secs(86_400));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: DispatchConfig = toml::from_str(
            r#"
            bind_addr = "127.0.0.1:9000"

            [fare]
            minimum_fare = 10.0
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.fare.minimum_fare, 10.0);
        assert_eq!(config.fare.base_fare, 3.0);
        assert_eq!(config.ride.radius_km, 5.0);
    }

    #[test]
    fn overrides_apply_and_parse() {
        let vars: HashMap<&str, &str> = [
            ("TAXI_RADIUS_KM", "2.5"),
            ("TAXI_COMMISSION_RATE", "0.2"),
            ("TAXI_MAPS_API_KEY", "secret"),
        ]
        .into_iter()
        .collect();
        let mut config = DispatchConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.ride.radius_km, 2.5);
        assert_eq!(config.ride.commission_rate, 0.2);
        assert_eq!(config.routing.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn bad_override_is_an_error() {
        let mut config = DispatchConfig::default();
        let err = config
            .apply_overrides(|key| (key == "TAXI_REQUEST_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("TAXI_REQUEST_TIMEOUT_SECS"));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = DispatchConfig::default();
        config.ride.commission_rate = 1.0;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.ride.radius_km = 0.0;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.fare.per_km_rate = -1.0;
        assert!(config.validate().is_err());
    }
}
