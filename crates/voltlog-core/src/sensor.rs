//! Voltage sensing through a resistive divider on a 12-bit ADC channel.

use serde::Serialize;

use crate::config::SensorConfig;
use crate::error::SensorError;

/// Largest value a 12-bit conversion can return.
pub const ADC_MAX_RAW: u16 = 4095;

/// Trait for sources of raw ADC conversions.
pub trait VoltageSensor {
    /// Read one raw conversion (0..=4095).
    fn read_raw(&mut self) -> impl Future<Output = Result<u16, SensorError>>;
}

/// A converted reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageReading {
    pub raw: u16,
    /// Volts at the ADC pin
    pub adc_volts: f32,
    /// Volts at the divider input
    pub input_volts: f32,
}

/// Raw-count to volts conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageScale {
    reference_volts: f32,
    resolution: f32,
    calibration: f32,
    divider: f32,
}

impl VoltageScale {
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            reference_volts: config.reference_volts,
            resolution: config.resolution,
            calibration: config.calibration,
            divider: config.divider,
        }
    }

    /// `adc = raw * (reference / resolution) * calibration`, `input = adc * divider`
    pub fn convert(&self, raw: u16) -> VoltageReading {
        let raw = raw.min(ADC_MAX_RAW);
        let adc_volts = f32::from(raw) * (self.reference_volts / self.resolution) * self.calibration;

        VoltageReading {
            raw,
            adc_volts,
            input_volts: adc_volts * self.divider,
        }
    }
}

impl Default for VoltageScale {
    fn default() -> Self {
        Self::new(&SensorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_zero_reading() {
        let reading = VoltageScale::default().convert(0);
        assert_eq!(reading.adc_volts, 0.0);
        assert_eq!(reading.input_volts, 0.0);
    }

    #[test]
    fn test_full_scale_reading() {
        let reading = VoltageScale::default().convert(4095);
        assert!(close(reading.adc_volts, 3.3 * 0.91));
        assert!(close(reading.input_volts, 3.3 * 0.91 * 5.0));
    }

    #[test]
    fn test_mid_scale_reading() {
        let reading = VoltageScale::default().convert(2048);
        let expected_adc = 2048.0 * (3.3 / 4095.0) * 0.91;
        assert!(close(reading.adc_volts, expected_adc));
        assert!(close(reading.input_volts, expected_adc * 5.0));
    }

    #[test]
    fn test_out_of_range_raw_is_clamped() {
        let reading = VoltageScale::default().convert(u16::MAX);
        assert_eq!(reading.raw, ADC_MAX_RAW);
    }
}
