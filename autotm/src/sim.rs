//! Synthetic bench: every collaborator of the [`Tuner`] backed by one shared
//! [`BenchState`]. The register sink decodes the words it is given, so the ADC
//! sees the frequency the synthesizer would really produce.

use std::{cell::RefCell, rc::Rc};

use log::trace;

use crate::{
    config::Config,
    registers::RegisterSet,
    stepper::AxisId,
    tuner::{Hardware, Tuner},
    Adc, AdcChannel, Axis, Dac, DacChannel, Delay, Hz, OutputLines, RegisterSink, Result,
};

/// Where the bench is when the ADC is read.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Probe {
    pub frequency: f64,
    pub tuning: i64,
    pub matching: i64,
    pub tuning_voltage: f32,
    pub matching_voltage: f32,
}

/// Detector output in volts as a function of the bench state.
pub trait Response {
    fn reflection(&self, probe: &Probe) -> f32;
    fn phase(&self, _probe: &Probe) -> f32 {
        0.0
    }
}

impl<F: Fn(&Probe) -> f32> Response for F {
    fn reflection(&self, probe: &Probe) -> f32 {
        self(probe)
    }
}

fn lorentz(offset: f64, width: f64) -> f64 {
    1.0 / (1.0 + (offset / width).powi(2))
}

/// Single resonance whose frequency moves with the tuning axis and tuning
/// voltage. Its height depends on how close the matching axis and matching
/// voltage are to their optimum.
#[derive(Clone, Debug, PartialEq)]
pub struct Surface {
    /// Resonance at tuning position 0 and 0 V.
    pub base: f64,
    pub hz_per_step: f64,
    pub hz_per_volt: f64,
    /// Half width at half maximum, Hz.
    pub bandwidth: f64,
    pub peak: f64,
    pub floor: f64,
    pub best_matching: f64,
    pub matching_width: f64,
    pub best_matching_voltage: f64,
    pub matching_voltage_width: f64,
}

impl Default for Surface {
    fn default() -> Self {
        Self {
            base: 50e6,
            hz_per_step: 5000.0,
            hz_per_volt: 0.0,
            bandwidth: 500e3,
            peak: 1.0,
            floor: 0.05,
            best_matching: 12000.0,
            matching_width: 4000.0,
            best_matching_voltage: 0.0,
            matching_voltage_width: f64::INFINITY,
        }
    }
}

impl Surface {
    pub fn resonance(&self, probe: &Probe) -> f64 {
        self.base
            + probe.tuning as f64 * self.hz_per_step
            + f64::from(probe.tuning_voltage) * self.hz_per_volt
    }

    fn matched(&self, probe: &Probe) -> f64 {
        lorentz(probe.matching as f64 - self.best_matching, self.matching_width)
            * lorentz(
                f64::from(probe.matching_voltage) - self.best_matching_voltage,
                self.matching_voltage_width,
            )
    }
}

impl Response for Surface {
    fn reflection(&self, probe: &Probe) -> f32 {
        let detuned = lorentz(probe.frequency - self.resonance(probe), self.bandwidth);
        (self.floor + (self.peak - self.floor) * detuned * self.matched(probe)) as f32
    }

    fn phase(&self, probe: &Probe) -> f32 {
        let offset = (probe.frequency - self.resonance(probe)) / self.bandwidth;
        (1.0 + 0.5 * offset.atan()) as f32
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisState {
    /// Where the mechanism really is.
    pub physical: i64,
    /// What the driver believes.
    pub counter: i64,
    pub target: i64,
    /// Lower mechanical stop. Steps past it are lost.
    pub limit: Option<i64>,
    pub travel: u64,
    pub max_speed: f32,
    pub acceleration: f32,
    pub stall_value: i8,
}

impl AxisState {
    fn new(position: i64) -> Self {
        Self {
            physical: position,
            counter: position,
            target: position,
            limit: Some(0),
            travel: 0,
            max_speed: 0.0,
            acceleration: 0.0,
            stall_value: 0,
        }
    }

    /// Puts the mechanism at `physical` with the stop at `limit` and the
    /// counter agreeing with the mechanism.
    pub fn place(&mut self, physical: i64, limit: i64) {
        self.physical = physical;
        self.counter = physical;
        self.target = physical;
        self.limit = Some(limit);
    }

    fn step(&mut self) -> bool {
        let delta = self.target - self.counter;
        if delta == 0 {
            return false;
        }
        let dir = delta.signum();
        self.counter += dir;
        self.physical += dir;
        if let Some(limit) = self.limit {
            self.physical = self.physical.max(limit);
        }
        self.travel += 1;
        true
    }

    fn stalled(&self) -> bool {
        self.limit.is_some_and(|limit| self.physical <= limit)
    }
}

pub struct BenchState {
    pub reference: Hz,
    latched: [Option<u32>; 6],
    pub words_written: usize,
    /// Output frequency decoded from the last complete register set.
    pub frequency: Option<u64>,
    pub tuning: AxisState,
    pub matching: AxisState,
    pub voltages: [f32; 2],
    pub dac_writes: Vec<(DacChannel, f32)>,
    pub filter_lines: Vec<bool>,
    pub filter_switches: usize,
    pub rf_switch: Vec<bool>,
    pub adc_reads: usize,
    /// Reads taken with no delay since the output last moved.
    pub unsettled_reads: usize,
    settled: bool,
    pub delayed_us: u64,
    surface: Box<dyn Response>,
}

impl BenchState {
    pub fn probe(&self) -> Probe {
        Probe {
            frequency: self.frequency.unwrap_or(0) as f64,
            tuning: self.tuning.physical,
            matching: self.matching.physical,
            tuning_voltage: self.voltages[0],
            matching_voltage: self.voltages[1],
        }
    }

    pub fn set_surface(&mut self, surface: impl Response + 'static) {
        self.surface = Box::new(surface);
    }

    fn axis(&mut self, id: AxisId) -> &mut AxisState {
        match id {
            AxisId::Tuning => &mut self.tuning,
            AxisId::Matching => &mut self.matching,
        }
    }
}

#[derive(Clone)]
pub struct Bench {
    pub state: Rc<RefCell<BenchState>>,
}

impl Bench {
    /// Tuning axis rests at 10000 steps (100 MHz on the default surface), the
    /// matching axis at 10000, both with their stop at 0.
    pub fn new(surface: impl Response + 'static) -> Self {
        let state = BenchState {
            reference: 250_000_000,
            latched: [None; 6],
            words_written: 0,
            frequency: None,
            tuning: AxisState::new(10000),
            matching: AxisState::new(10000),
            voltages: [0.0; 2],
            dac_writes: Vec::new(),
            filter_lines: Vec::new(),
            filter_switches: 0,
            rf_switch: Vec::new(),
            adc_reads: 0,
            unsettled_reads: 0,
            settled: true,
            delayed_us: 0,
            surface: Box::new(surface),
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn sink(&self) -> SimSink {
        SimSink(self.state.clone())
    }

    pub fn axis(&self, id: AxisId) -> SimAxis {
        SimAxis(self.state.clone(), id)
    }

    pub fn hardware(&self) -> Hardware {
        Hardware {
            sink: Box::new(self.sink()),
            filter_lines: Box::new(SimLines(self.state.clone(), Lines::Filter)),
            rf_switch: Box::new(SimLines(self.state.clone(), Lines::RfSwitch)),
            adc: Box::new(SimAdc(self.state.clone())),
            dac: Box::new(SimDac(self.state.clone())),
            tuning: Box::new(self.axis(AxisId::Tuning)),
            matching: Box::new(self.axis(AxisId::Matching)),
            delay: Box::new(SimDelay(self.state.clone())),
        }
    }

    pub fn tuner(&self, config: &Config) -> Result<Tuner> {
        self.state.borrow_mut().reference = config.synthesizer.reference;
        Tuner::new(config, self.hardware())
    }
}

pub struct SimSink(Rc<RefCell<BenchState>>);

impl RegisterSink for SimSink {
    fn write_word(&mut self, word: u32) -> Result<()> {
        let mut state = self.0.borrow_mut();
        state.words_written += 1;
        let idx = (word & 0x7) as usize;
        if let Some(slot) = state.latched.get_mut(idx) {
            *slot = Some(word);
        }
        // R0 is double buffered, the output moves only when it is written
        if idx == 0 {
            state.settled = false;
            let words: Option<Vec<u32>> = state.latched.iter().copied().collect();
            if let Some(words) = words {
                let reference = state.reference;
                state.frequency = Some(RegisterSet::from_words(&words)?.frequency(reference)?);
                trace!("bench output {:?} Hz", state.frequency);
            }
        }
        Ok(())
    }
}

pub struct SimAxis(Rc<RefCell<BenchState>>, AxisId);

impl Axis for SimAxis {
    fn move_relative(&mut self, steps: i64) {
        let mut state = self.0.borrow_mut();
        let axis = state.axis(self.1);
        axis.target = axis.counter + steps;
    }

    fn move_to(&mut self, position: i64) {
        self.0.borrow_mut().axis(self.1).target = position;
    }

    fn run_to_position(&mut self) -> Result<()> {
        let mut state = self.0.borrow_mut();
        let axis = state.axis(self.1);
        while axis.step() {}
        Ok(())
    }

    fn run(&mut self) -> Result<bool> {
        Ok(self.0.borrow_mut().axis(self.1).step())
    }

    fn stop(&mut self) {
        let mut state = self.0.borrow_mut();
        let axis = state.axis(self.1);
        axis.target = axis.counter;
    }

    fn current_position(&self) -> i64 {
        self.0.borrow_mut().axis(self.1).counter
    }

    fn set_current_position(&mut self, position: i64) {
        let mut state = self.0.borrow_mut();
        let axis = state.axis(self.1);
        axis.counter = position;
        axis.target = position;
    }

    fn stalled(&mut self) -> Result<bool> {
        Ok(self.0.borrow_mut().axis(self.1).stalled())
    }

    fn set_speed_profile(&mut self, max_speed: f32, acceleration: f32) {
        let mut state = self.0.borrow_mut();
        let axis = state.axis(self.1);
        axis.max_speed = max_speed;
        axis.acceleration = acceleration;
    }

    fn set_stall_sensitivity(&mut self, value: i8) -> Result<()> {
        self.0.borrow_mut().axis(self.1).stall_value = value;
        Ok(())
    }
}

pub struct SimAdc(Rc<RefCell<BenchState>>);

impl Adc for SimAdc {
    fn read(&mut self, channel: AdcChannel) -> Result<f32> {
        let mut state = self.0.borrow_mut();
        state.adc_reads += 1;
        if !state.settled {
            state.unsettled_reads += 1;
        }
        let probe = state.probe();
        Ok(match channel {
            AdcChannel::Magnitude => state.surface.reflection(&probe),
            AdcChannel::Phase => state.surface.phase(&probe),
        })
    }
}

pub struct SimDac(Rc<RefCell<BenchState>>);

impl Dac for SimDac {
    fn write(&mut self, channel: DacChannel, volts: f32) -> Result<()> {
        let mut state = self.0.borrow_mut();
        let idx = match channel {
            DacChannel::Tuning => 0,
            DacChannel::Matching => 1,
        };
        state.voltages[idx] = volts;
        state.dac_writes.push((channel, volts));
        Ok(())
    }
}

enum Lines {
    Filter,
    RfSwitch,
}

struct SimLines(Rc<RefCell<BenchState>>, Lines);

impl OutputLines for SimLines {
    fn set_values(&mut self, values: &[bool]) -> Result<()> {
        let mut state = self.0.borrow_mut();
        match self.1 {
            Lines::Filter => {
                state.filter_lines = values.to_vec();
                state.filter_switches += 1;
            }
            Lines::RfSwitch => state.rf_switch = values.to_vec(),
        }
        Ok(())
    }
}

pub struct SimDelay(Rc<RefCell<BenchState>>);

impl Delay for SimDelay {
    fn delay_us(&mut self, us: u32) {
        let mut state = self.0.borrow_mut();
        state.delayed_us += u64::from(us);
        state.settled |= us > 0;
    }
}
