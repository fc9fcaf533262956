use serde::{Deserialize, Serialize};

use crate::{Adc, AdcChannel, Hz, Result};

/// Averaged detector readings in millivolts. Higher reflection means a better
/// match on this detector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionSample {
    pub frequency: Hz,
    pub reflection: i32,
    pub phase: i32,
}

pub struct ReflectionSampler {
    adc: Box<dyn Adc>,
}

impl ReflectionSampler {
    pub fn new(adc: Box<dyn Adc>) -> Self {
        Self { adc }
    }

    fn average(&mut self, channel: AdcChannel, averages: u32) -> Result<i32> {
        if averages == 0 {
            return Ok(0);
        }
        let mut sum: i64 = 0;
        for _ in 0..averages {
            // each reading is truncated to whole millivolts before summing
            sum += (self.adc.read(channel)? * 1000.0) as i64;
        }
        Ok((sum / i64::from(averages)) as i32)
    }

    pub fn reflection(&mut self, averages: u32) -> Result<i32> {
        self.average(AdcChannel::Magnitude, averages)
    }

    pub fn phase(&mut self, averages: u32) -> Result<i32> {
        self.average(AdcChannel::Phase, averages)
    }

    /// Reads both channels at whatever frequency is currently set. `frequency`
    /// only tags the result.
    pub fn sample(&mut self, frequency: Hz, averages: u32) -> Result<ReflectionSample> {
        Ok(ReflectionSample {
            frequency,
            reflection: self.reflection(averages)?,
            phase: self.phase(averages)?,
        })
    }
}
