//! Fare pricing and commission split.
//!
//! `fare = max(minimum, base + km * per_km + minutes * per_minute)`

use taxi_common::config::FareConfig;

use crate::error::{validation, DispatchError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FareCalculator {
    pub base_fare: f64,
    pub per_km_rate: f64,
    pub per_minute_rate: f64,
    pub minimum_fare: f64,
}

impl FareCalculator {
    pub fn from_config(config: &FareConfig) -> Self {
        Self {
            base_fare: config.base_fare,
            per_km_rate: config.per_km_rate,
            per_minute_rate: config.per_minute_rate,
            minimum_fare: config.minimum_fare,
        }
    }

    pub fn fare(&self, distance_km: f64, duration_min: f64) -> f64 {
        let distance_km = distance_km.max(0.0);
        let duration_min = duration_min.max(0.0);
        let metered =
            self.base_fare + distance_km * self.per_km_rate + duration_min * self.per_minute_rate;
        metered.max(self.minimum_fare)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommissionSplit {
    pub gross: f64,
    pub commission: f64,
    pub net: f64,
}

impl CommissionSplit {
    pub fn new(gross: f64, commission_rate: f64) -> Self {
        let commission = gross * commission_rate;
        Self {
            gross,
            commission,
            net: gross - commission,
        }
    }
}

pub fn format_money(amount: f64) -> String {
    format!("{amount:.2}")
}

pub fn parse_money(raw: &str) -> Result<f64, DispatchError> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| validation(format!("invalid fare amount {raw:?}")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(validation(format!("invalid fare amount {raw:?}")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> FareCalculator {
        FareCalculator::from_config(&FareConfig::default())
    }

    #[test]
    fn empty_trip_costs_the_minimum() {
        let fares = calculator();
        assert_eq!(fares.fare(0.0, 0.0), fares.minimum_fare);
    }

    #[test]
    fn long_trip_is_metered() {
        let fares = calculator();
        let expected = 3.0 + 10.0 * 1.8 + 20.0 * 0.3;
        assert!((fares.fare(10.0, 20.0) - expected).abs() < 1e-9);
    }

    #[test]
    fn monotonic_in_distance_and_duration() {
        let fares = calculator();
        let steps: Vec<f64> = (0..40).map(|i| i as f64 * 0.75).collect();
        for &t in &steps {
            for pair in steps.windows(2) {
                assert!(fares.fare(pair[1], t) >= fares.fare(pair[0], t));
                assert!(fares.fare(t, pair[1]) >= fares.fare(t, pair[0]));
            }
        }
    }

    #[test]
    fn commission_split_sums_to_gross() {
        let split = CommissionSplit::new(12.5, 0.15);
        assert!((split.commission - 1.875).abs() < 1e-9);
        assert!((split.net - 10.625).abs() < 1e-9);
        assert!((split.net + split.commission - split.gross).abs() < 1e-9);
    }

    #[test]
    fn money_parsing() {
        assert_eq!(parse_money("12.50").unwrap(), 12.5);
        assert_eq!(format_money(12.5), "12.50");
        assert!(parse_money("-1").is_err());
        assert!(parse_money("twelve").is_err());
    }
}
