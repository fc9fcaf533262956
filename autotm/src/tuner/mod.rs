//! The tuner context. Owns every piece of hardware state that outlives a
//! single command: the synthesizer register cache, the active filter band,
//! both axes with their direction memory, and the RF path switch.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    config::{Config, Limits, SearchSettings, StepperSettings, VoltageSettings},
    filter::FilterBank,
    sampler::{ReflectionSample, ReflectionSampler},
    stepper::{AxisId, Stepper},
    synth::Adf4351,
    Adc, Axis, Dac, DacChannel, Delay, Hz, OutputLines, RegisterSink, Result,
};

mod matching;
mod position;
mod resonance;
mod tuning;
mod voltage;

pub use position::{PositionOptimum, PositionWindow};
pub use resonance::Sweep;
pub use tuning::TuningOutcome;
pub use voltage::{grid, grid_len, VoltageOptimum};

/// The collaborators a [`Tuner`] is built from.
pub struct Hardware {
    pub sink: Box<dyn RegisterSink>,
    pub filter_lines: Box<dyn OutputLines>,
    pub rf_switch: Box<dyn OutputLines>,
    pub adc: Box<dyn Adc>,
    pub dac: Box<dyn Dac>,
    pub tuning: Box<dyn Axis>,
    pub matching: Box<dyn Axis>,
    pub delay: Box<dyn Delay>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfPath {
    Preamp,
    Atm,
}

impl RfPath {
    pub fn name(self) -> &'static str {
        match self {
            Self::Preamp => "preamp",
            Self::Atm => "atm system",
        }
    }
}

struct RfSwitch {
    lines: Box<dyn OutputLines>,
    path: RfPath,
}

impl RfSwitch {
    fn new(mut lines: Box<dyn OutputLines>) -> Result<Self> {
        lines.set_values(&[false])?;
        Ok(Self {
            lines,
            path: RfPath::Atm,
        })
    }

    /// Returns false if `path` was already selected.
    fn select(&mut self, path: RfPath) -> Result<bool> {
        if self.path == path {
            return Ok(false);
        }
        self.lines.set_values(&[path == RfPath::Preamp])?;
        self.path = path;
        Ok(true)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisReport {
    pub position: i64,
    pub last_direction: i8,
}

impl From<&Stepper> for AxisReport {
    fn from(stepper: &Stepper) -> Self {
        Self {
            position: stepper.position(),
            last_direction: stepper.last_direction(),
        }
    }
}

/// Outcome of one tuning command.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub target: Option<Hz>,
    pub resonance: Option<Hz>,
    pub tuning: AxisReport,
    pub matching: AxisReport,
    pub voltages: Option<[f32; 2]>,
}

pub struct Tuner {
    synth: Adf4351<Box<dyn RegisterSink>>,
    filters: FilterBank,
    sampler: ReflectionSampler,
    tuning: Stepper,
    matching: Stepper,
    dac: Box<dyn Dac>,
    rf_switch: RfSwitch,
    delay: Box<dyn Delay>,
    search: SearchSettings,
    stepper: StepperSettings,
    limits: Limits,
    voltage: VoltageSettings,
}

impl Tuner {
    pub fn new(config: &Config, hw: Hardware) -> Result<Self> {
        config.validate()?;
        let profile = config.stepper.profile;
        Ok(Self {
            synth: Adf4351::new(config.synthesizer.clone(), hw.sink),
            filters: FilterBank::new(config.filters.clone(), hw.filter_lines),
            sampler: ReflectionSampler::new(hw.adc),
            tuning: Stepper::new("tuner", hw.tuning, profile)?,
            matching: Stepper::new("matcher", hw.matching, profile)?,
            dac: hw.dac,
            rf_switch: RfSwitch::new(hw.rf_switch)?,
            delay: hw.delay,
            search: config.search.clone(),
            stepper: config.stepper.clone(),
            limits: config.limits.clone(),
            voltage: config.voltage.clone(),
        })
    }

    pub fn synth(&self) -> &Adf4351<Box<dyn RegisterSink>> {
        &self.synth
    }

    pub fn filters(&self) -> &FilterBank {
        &self.filters
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn stepper(&self, id: AxisId) -> &Stepper {
        match id {
            AxisId::Tuning => &self.tuning,
            AxisId::Matching => &self.matching,
        }
    }

    fn stepper_mut(&mut self, id: AxisId) -> &mut Stepper {
        match id {
            AxisId::Tuning => &mut self.tuning,
            AxisId::Matching => &mut self.matching,
        }
    }

    pub fn rf_path(&self) -> RfPath {
        self.rf_switch.path
    }

    /// Search step, a fixed fraction of one rotation.
    fn step_size(&self) -> i64 {
        self.stepper.steps_per_rotation / self.search.step_divisor
    }

    /// Routes the filter bank for `frequency`, then programs the synthesizer.
    /// Neither is touched if the frequency can't be synthesized.
    pub fn set_frequency(&mut self, frequency: Hz) -> Result<()> {
        let solution = self.synth.settings().solve(frequency)?;
        self.filters.select(frequency)?;
        self.synth.program(frequency, solution)
    }

    /// [`Tuner::set_frequency`] followed by the analog settle time. Every read
    /// that follows a frequency change goes through here first.
    pub fn tune_to(&mut self, frequency: Hz) -> Result<()> {
        self.set_frequency(frequency)?;
        self.delay.delay_us(self.search.sample_settle_us);
        Ok(())
    }

    /// Sets the probe, waits for the detector to settle, then samples.
    fn reflection_at(&mut self, frequency: Hz, averages: u32, settle_ms: u32) -> Result<i32> {
        self.tune_to(frequency)?;
        self.delay.delay_ms(settle_ms);
        self.sampler.reflection(averages)
    }

    pub fn measure(&mut self, frequency: Hz) -> Result<ReflectionSample> {
        self.tune_to(frequency)?;
        self.sampler.sample(frequency, self.search.measure_averages)
    }

    pub fn set_voltages(&mut self, tuning: f32, matching: f32) -> Result<()> {
        self.dac.write(DacChannel::Tuning, tuning)?;
        self.dac.write(DacChannel::Matching, matching)
    }

    /// Relative move of `steps + backlash`, counted as `steps`.
    pub fn move_stepper(&mut self, id: AxisId, steps: i64, backlash: i64) -> Result<i64> {
        self.stepper_mut(id).move_compensated(steps, backlash)
    }

    /// Homes the tuner then the matcher and parks both at the rest position.
    pub fn home(&mut self) -> Result<()> {
        let homing = self.stepper.homing;
        let rest = self.stepper.rest_position;
        self.tuning.home(&homing)?;
        self.matching.home(&homing)?;
        self.tuning.move_to(rest)?;
        self.matching.move_to(rest)?;
        info!("Homing finished");
        Ok(())
    }

    /// Returns false if `path` was already selected.
    pub fn switch_path(&mut self, path: RfPath) -> Result<bool> {
        self.rf_switch.select(path)
    }

    pub fn session(&self, target: Option<Hz>, resonance: Option<Hz>) -> Session {
        Session {
            target,
            resonance,
            tuning: (&self.tuning).into(),
            matching: (&self.matching).into(),
            voltages: None,
        }
    }

    /// Automatic tune and match: find the resonance over the configured band,
    /// walk it to `target`, restore the match, then walk it once more.
    pub fn tune_match(&mut self, target: Hz) -> Result<Session> {
        let band = self.limits.auto_sweep;
        let Some(resonance) = self.locate(&band)? else {
            return Ok(self.session(Some(target), None));
        };
        debug!("Resonance before tune and match: {}", resonance);

        let Some(resonance) = self.bruteforce(target, resonance)?.resonance else {
            return Ok(self.session(Some(target), None));
        };
        self.optimize(resonance)?;

        let window = Sweep::around(resonance, self.search.matching_window, band.step / 2);
        let Some(resonance) = self.locate(&window)? else {
            return Ok(self.session(Some(target), None));
        };
        let outcome = self.bruteforce(target, resonance)?;
        Ok(self.session(Some(target), outcome.resonance))
    }
}
