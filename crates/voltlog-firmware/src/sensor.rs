//! Divider input on GPIO4 through ADC1.

use esp_hal::Async;
use esp_hal::analog::adc::{Adc, AdcConfig, AdcPin, Attenuation};
use esp_hal::peripherals::{ADC1, GPIO4};
use voltlog_core::error::SensorError;
use voltlog_core::sensor::{ADC_MAX_RAW, VoltageSensor};

/// One-shot conversions at 11 dB attenuation, the full 0..3.3 V range.
pub struct AdcVoltageSensor {
    adc: Adc<'static, ADC1<'static>, Async>,
    pin: AdcPin<GPIO4<'static>, ADC1<'static>>,
}

impl AdcVoltageSensor {
    pub fn new(adc1: ADC1<'static>, gpio: GPIO4<'static>) -> Self {
        let mut config = AdcConfig::new();
        let pin = config.enable_pin(gpio, Attenuation::_11dB);
        let adc = Adc::new(adc1, config).into_async();
        Self { adc, pin }
    }
}

impl VoltageSensor for AdcVoltageSensor {
    async fn read_raw(&mut self) -> Result<u16, SensorError> {
        let raw = self.adc.read_oneshot(&mut self.pin).await;
        if raw > ADC_MAX_RAW {
            return Err(SensorError::ReadError);
        }
        Ok(raw)
    }
}
