use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs::read_to_string, io::ErrorKind, path::Path};

use crate::{
    filter::FilterBand,
    stepper::{HomingSettings, MotionProfile},
    synth::Synthesizer,
    tuner::Sweep,
    Error, Hz, Result,
};

pub mod board;
pub mod filters;
pub mod synth;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperSettings {
    /// 200 full steps at 16 microsteps.
    pub steps_per_rotation: i64,
    /// Where both axes park after homing.
    pub rest_position: i64,
    pub profile: MotionProfile,
    pub homing: HomingSettings,
}

impl Default for StepperSettings {
    fn default() -> Self {
        Self {
            steps_per_rotation: 3200,
            rest_position: 10000,
            profile: MotionProfile::default(),
            homing: HomingSettings::default(),
        }
    }
}

/// Averaging counts, windows and budgets of the search loops. Reflection
/// thresholds are in millivolts, delays in milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Wait between a frequency change and the next ADC read, in µs.
    pub sample_settle_us: u32,
    pub coarse_averages: u32,
    pub confirm_averages: u32,
    pub confirm_settle_ms: u32,
    /// A confirmed peak below this is not a resonance.
    pub found_threshold: i32,
    pub refine_window: Hz,
    pub refine_averages: u32,

    pub tuning_iterations: u32,
    pub tuning_window: Hz,
    /// Below this the match is redone during tuning.
    pub matching_threshold: i32,
    pub resonance_averages: u32,
    pub resonance_settle_ms: u32,

    pub matching_iterations: u32,
    pub matching_window: Hz,
    pub matching_settle_ms: u32,
    pub rotation_averages: u32,
    pub lost_penalty_ms: u32,
    /// Search steps are this fraction of a rotation.
    pub step_divisor: i64,

    pub position_averages: u32,
    pub measure_averages: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            sample_settle_us: 50,
            coarse_averages: 4,
            confirm_averages: 16,
            confirm_settle_ms: 50,
            found_threshold: 130,
            refine_window: 300_000,
            refine_averages: 64,
            tuning_iterations: 25,
            tuning_window: 5_000_000,
            matching_threshold: 140,
            resonance_averages: 16,
            resonance_settle_ms: 100,
            matching_iterations: 50,
            matching_window: 1_000_000,
            matching_settle_ms: 50,
            rotation_averages: 64,
            lost_penalty_ms: 1000,
            step_divisor: 20,
            position_averages: 4,
            measure_averages: 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Accepted range of command frequencies.
    pub min_frequency: Hz,
    pub max_frequency: Hz,
    /// Band scanned to find the starting resonance of an automatic tune.
    pub auto_sweep: Sweep,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_frequency: 50_000_000,
            max_frequency: 300_000_000,
            auto_sweep: Sweep {
                start: 35_000_000,
                stop: 110_000_000,
                step: 100_000,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoltageSettings {
    pub min: f32,
    pub max: f32,
    pub averages: u32,
    /// The coarse pass runs this far below the target.
    pub coarse_offset: Hz,
    pub coarse_step: f32,
    pub medium_step: f32,
    pub medium_tuning_window: f32,
    pub fine_step: f32,
    pub fine_tuning_window: f32,
    pub fine_matching_window: f32,
    pub preset_step: f32,
    pub preset_window: f32,
}

impl Default for VoltageSettings {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 5.0,
            averages: 4,
            coarse_offset: 2_000_000,
            coarse_step: 1.0,
            medium_step: 0.05,
            medium_tuning_window: 0.5,
            fine_step: 0.01,
            fine_tuning_window: 0.1,
            fine_matching_window: 0.2,
            preset_step: 0.01,
            preset_window: 0.2,
        }
    }
}

/// gpiochip line offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lines {
    pub le: u32,
    pub filter_a: u32,
    pub filter_b: u32,
    pub rf_switch: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Board {
    pub spi: String,
    pub chip: String,
    pub lines: Lines,
}

impl Default for Board {
    fn default() -> Self {
        Self {
            spi: "/dev/spidev0.0".into(),
            chip: "/dev/gpiochip0".into(),
            lines: board::ATM_V2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub synthesizer: Synthesizer,
    pub filters: Vec<FilterBand>,
    pub stepper: StepperSettings,
    pub search: SearchSettings,
    pub limits: Limits,
    pub voltage: VoltageSettings,
    pub board: Board,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            synthesizer: Synthesizer::default(),
            filters: filters::ATM_V2.to_vec(),
            stepper: StepperSettings::default(),
            search: SearchSettings::default(),
            limits: Limits::default(),
            voltage: VoltageSettings::default(),
            board: Board::default(),
        }
    }
}

impl Config {
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        match read_to_string(path.as_ref()) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{} not found, using defaults", path.as_ref().display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.synthesizer.validate()?;
        if !self.filters.windows(2).all(|w| w[0].cutoff < w[1].cutoff) {
            return Err(Error::Parse("filters must be sorted by ascending cutoff".into()));
        }
        if self.stepper.steps_per_rotation <= 0 || self.search.step_divisor <= 0 {
            return Err(Error::Parse("step sizes must be positive".into()));
        }
        if self.limits.min_frequency > self.limits.max_frequency {
            return Err(Error::Parse("min_frequency above max_frequency".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_default() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn partial_sections() {
        let config = Config::parse(
            r#"
            [synthesizer]
            reference = 100_000_000
            r_counter = 10

            [search]
            found_threshold = 200

            [[filters]]
            cutoff = 150_000_000
            a = true
            b = false
            "#,
        )
        .unwrap();
        assert_eq!(config.synthesizer.pfd(), 10_000_000);
        assert_eq!(config.synthesizer.channel_step, 100_000);
        assert_eq!(config.search.found_threshold, 200);
        assert_eq!(config.search.refine_averages, 64);
        assert_eq!(config.filters, [FilterBand::new(150_000_000, true, false)]);
        assert_eq!(config.stepper.homing.nudge, 1000);
    }

    #[test]
    fn rejects_bad_reference() {
        let err = Config::parse("[synthesizer]\nreference = 300_000_000\n").unwrap_err();
        assert!(matches!(err, Error::ReferenceInvalid(300_000_000)));
    }

    #[test]
    fn rejects_unsorted_filters() {
        let mut config = Config::default();
        config.filters.swap(0, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let text = toml::to_string(&Config::default()).unwrap();
        assert_eq!(Config::parse(&text).unwrap(), Config::default());
    }

    #[test]
    fn sample_file() {
        let config = Config::parse(include_str!("../../tuner.toml")).unwrap();
        assert_eq!(config.synthesizer, synth::REF_25MHZ_DOUBLED);
        assert_eq!(config.board.lines, board::ATM_V2);
        assert_eq!(config.search, SearchSettings::default());
    }

    #[test]
    fn missing_file_is_default() {
        assert_eq!(
            Config::load("/nonexistent/autotm.toml").unwrap(),
            Config::default()
        );
    }
}
