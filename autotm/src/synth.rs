use log::{debug, warn};
use num_integer::Integer;
use serde::{Deserialize, Serialize};

use crate::{registers::*, Error, Hz, RegisterSink, Result};

pub const FREQ_MIN: Hz = 34_385_000;
pub const FREQ_MAX: Hz = 4_294_967_295;
pub const REF_MIN: Hz = 100_000;
pub const REF_MAX: Hz = 250_000_000;
pub const PFD_MIN: u64 = 125_000;
pub const PFD_MAX: u64 = 32_000_000;
pub const MOD_MAX: u32 = 4095;
pub const INT_MAX: u32 = 65535;

/// Fundamental VCO range starts here, the output divider keeps the VCO above it.
const VCO_MIN: u64 = 2_200_000_000;
/// Above this VCO/divider ratio the 4/5 prescaler can't keep up.
const PRESCALER_P45_MAX: u64 = 3_600_000_000;

/// The divider settings for one output frequency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FractionalN {
    pub int: u32,
    pub frac: u32,
    pub modulus: u32,
    pub divider: RfDivider,
    pub prescaler: Prescaler,
    /// Frequency the settings actually produce, rounded to the nearest Hz.
    pub achieved: u64,
}

impl FractionalN {
    pub fn validate(&self) -> Result<()> {
        if !(2..=MOD_MAX).contains(&self.modulus) {
            return Err(Error::DividerOverflow {
                field: "MOD",
                value: self.modulus.into(),
            });
        }
        if self.frac > self.modulus - 1 {
            return Err(Error::DividerOverflow {
                field: "FRAC",
                value: self.frac.into(),
            });
        }
        if !(self.prescaler.min_int()..=INT_MAX).contains(&self.int) {
            return Err(Error::DividerOverflow {
                field: "INT",
                value: self.int.into(),
            });
        }
        Ok(())
    }
}

/// Reduces FRAC/MOD to lowest terms. A zero FRAC is left alone, MOD doesn't
/// matter in integer-N mode.
#[must_use]
pub fn reduce(frac: u32, modulus: u32) -> (u32, u32) {
    if frac == 0 {
        return (frac, modulus);
    }
    let gcd = frac.gcd(&modulus);
    (frac / gcd, modulus / gcd)
}

/// Reference path and static settings of the ADF4351. Frequencies are solved
/// against these, so changing any of them invalidates previously packed words.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Synthesizer {
    pub reference: Hz,
    pub channel_step: Hz,
    pub r_counter: u16,
    pub ref_doubler: bool,
    pub ref_div2: bool,
    pub power: OutputPower,
    pub band_select_clock: u8,
    pub clock_divider: u16,
}

impl Default for Synthesizer {
    fn default() -> Self {
        crate::config::synth::REF_250MHZ
    }
}

impl Synthesizer {
    fn pfd_ratio(&self, reference: Hz) -> (u128, u128) {
        let d = u128::from(self.ref_doubler);
        let t = u128::from(self.ref_div2);
        (u128::from(reference) * (1 + d), u128::from(self.r_counter) * (1 + t))
    }

    fn check_pfd(&self, reference: Hz) -> Result<(u128, u128)> {
        let (num, den) = self.pfd_ratio(reference);
        if den == 0 {
            return Err(Error::DividerOverflow {
                field: "R",
                value: 0,
            });
        }
        if num < u128::from(PFD_MIN) * den || num > u128::from(PFD_MAX) * den {
            return Err(Error::PhaseDetectorOutOfRange((num / den) as u64));
        }
        Ok((num, den))
    }

    fn modulus(&self, num: u128, den: u128, step: Hz) -> u128 {
        let step_den = den * u128::from(step);
        if step_den == 0 {
            return 0;
        }
        (num + step_den / 2) / step_den
    }

    /// Phase detector frequency in Hz, rounded.
    #[must_use]
    pub fn pfd(&self) -> u64 {
        let (num, den) = self.pfd_ratio(self.reference);
        if den == 0 {
            return 0;
        }
        ((num + den / 2) / den) as u64
    }

    /// Accepts a new reference only if it and the resulting PFD are in range.
    pub fn set_reference_frequency(&mut self, reference: Hz) -> Result<()> {
        if !(REF_MIN..=REF_MAX).contains(&reference) {
            return Err(Error::ReferenceInvalid(reference.into()));
        }
        self.check_pfd(reference)?;
        self.reference = reference;
        Ok(())
    }

    /// Accepts a new channel step only if it yields a programmable modulus.
    pub fn set_channel_step(&mut self, step: Hz) -> Result<()> {
        let (num, den) = self.check_pfd(self.reference)?;
        let modulus = self.modulus(num, den, step);
        if !(2..=u128::from(MOD_MAX)).contains(&modulus) {
            return Err(Error::DividerOverflow {
                field: "MOD",
                value: modulus as u64,
            });
        }
        self.channel_step = step;
        Ok(())
    }

    /// Checks a deserialized configuration the same way the setters would.
    pub fn validate(&self) -> Result<()> {
        let mut probe = self.clone();
        probe.set_reference_frequency(self.reference)?;
        probe.set_channel_step(self.channel_step)
    }

    /// Computes INT/FRAC/MOD and the output divider for `target`.
    ///
    /// All intermediate ratios are kept as exact integer fractions, f32 or f64
    /// can't hold a multi GHz VCO frequency to the Hz.
    pub fn solve(&self, target: Hz) -> Result<FractionalN> {
        if !(FREQ_MIN..=FREQ_MAX).contains(&target) {
            return Err(Error::FrequencyOutOfRange(target.into()));
        }
        let (num, den) = self.check_pfd(self.reference)?;

        // smallest divider that lifts the VCO above its minimum
        let code = (0..=6_u8)
            .find(|&c| u64::from(target) << c > VCO_MIN)
            .unwrap_or(6);
        let divider = RfDivider::try_from(code).or(Err(Error::FrequencyOutOfRange(target.into())))?;
        let ratio = divider.ratio();

        let prescaler = if u64::from(target) > PRESCALER_P45_MAX / u64::from(ratio) {
            Prescaler::P8_9
        } else {
            Prescaler::P4_5
        };

        // N = target * divider / PFD
        let vco = u128::from(target) * u128::from(ratio) * den;
        let mut int = vco / num;
        let remainder = vco % num;

        let modulus = self.modulus(num, den, self.channel_step);
        let mut frac = (2 * remainder * modulus + num) / (2 * num);
        if modulus > 0 && frac == modulus {
            int += 1;
            frac = 0;
        }

        let overflow = |field, value: u128| Error::DividerOverflow {
            field,
            value: value as u64,
        };
        let int = u32::try_from(int).or(Err(overflow("INT", int)))?;
        let modulus = u32::try_from(modulus).or(Err(overflow("MOD", modulus)))?;
        let frac = u32::try_from(frac).or(Err(overflow("FRAC", frac)))?;
        let (frac, modulus) = reduce(frac, modulus);

        let mut solution = FractionalN {
            int,
            frac,
            modulus,
            divider,
            prescaler,
            achieved: 0,
        };
        solution.validate()?;

        let n = u128::from(int) * u128::from(modulus) + u128::from(frac);
        let out_den = den * u128::from(modulus) * u128::from(ratio);
        solution.achieved = ((num * n + out_den / 2) / out_den) as u64;
        if solution.achieved != u64::from(target) {
            warn!(
                "output frequency {} Hz differs from requested {} Hz",
                solution.achieved, target
            );
        }
        debug!("{} Hz -> {:?}", target, solution);
        Ok(solution)
    }

    #[must_use]
    pub fn registers(&self, solution: &FractionalN) -> RegisterSet {
        let integer_n = solution.frac == 0;

        let mut r2 = R2Flags::PD_POLARITY;
        let mut r3 = R3Flags::BAND_SELECT_HIGH;
        if integer_n {
            r2 |= R2Flags::LDP | R2Flags::LDF;
            r3 |= R3Flags::CHARGE_CANCEL | R3Flags::ABP_3NS;
        }
        if self.ref_div2 {
            r2 |= R2Flags::RDIV2;
        }
        if self.ref_doubler {
            r2 |= R2Flags::REF_DOUBLER;
        }

        RegisterSet {
            r0: Reg0 {
                int: solution.int as u16,
                frac: solution.frac as u16,
            },
            r1: Reg1 {
                phase_adjust: false,
                prescaler: solution.prescaler,
                phase: 1,
                modulus: solution.modulus as u16,
            },
            r2: Reg2 {
                noise: NoiseMode::LowNoise,
                muxout: Muxout::ThreeState,
                r_counter: self.r_counter,
                charge_pump: 0b0111, // 2.50 mA
                flags: r2,
            },
            r3: Reg3 {
                flags: r3,
                clock_div_mode: 0,
                clock_divider: self.clock_divider,
            },
            r4: Reg4 {
                flags: R4Flags::RF_ENABLE | R4Flags::FEEDBACK_FUNDAMENTAL,
                divider: solution.divider,
                band_select_clock: self.band_select_clock,
                aux_power: OutputPower::Minus4dBm,
                power: self.power,
            },
            r5: Reg5 {
                ld_pin: LockDetectPin::DigitalLockDetect,
            },
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Programmed {
    frequency: Hz,
    solution: FractionalN,
    registers: RegisterSet,
}

/// The synthesizer as the rest of the tuner sees it: settings, the last packed
/// register set, and the sink the words go out on.
pub struct Adf4351<S> {
    settings: Synthesizer,
    programmed: Option<Programmed>,
    sink: S,
}

impl<S: RegisterSink> Adf4351<S> {
    pub fn new(settings: Synthesizer, sink: S) -> Self {
        Self {
            settings,
            programmed: None,
            sink,
        }
    }

    pub fn settings(&self) -> &Synthesizer {
        &self.settings
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn frequency(&self) -> Option<Hz> {
        self.programmed.map(|p| p.frequency)
    }

    pub fn solution(&self) -> Option<&FractionalN> {
        self.programmed.as_ref().map(|p| &p.solution)
    }

    pub fn registers(&self) -> Option<&RegisterSet> {
        self.programmed.as_ref().map(|p| &p.registers)
    }

    /// Solves, packs and writes all six registers. Nothing is written if the
    /// frequency can't be reached, and the previous settings stay in effect.
    pub fn set_frequency(&mut self, target: Hz) -> Result<FractionalN> {
        let solution = self.settings.solve(target)?;
        self.program(target, solution)?;
        Ok(solution)
    }

    /// Packs and writes a solution computed earlier, e.g. by [`Synthesizer::solve`].
    pub fn program(&mut self, target: Hz, solution: FractionalN) -> Result<()> {
        solution.validate()?;
        let registers = self.settings.registers(&solution);
        write(&mut self.sink, &registers)?;
        self.programmed = Some(Programmed {
            frequency: target,
            solution,
            registers,
        });
        Ok(())
    }

    /// Cached words no longer match a new reference, so they are dropped.
    pub fn set_reference_frequency(&mut self, reference: Hz) -> Result<()> {
        self.settings.set_reference_frequency(reference)?;
        self.programmed = None;
        Ok(())
    }

    pub fn set_channel_step(&mut self, step: Hz) -> Result<()> {
        self.settings.set_channel_step(step)?;
        self.programmed = None;
        Ok(())
    }

    /// Writes the cached set again, e.g. after the chip lost power.
    pub fn rewrite(&mut self) -> Result<()> {
        let registers = self.programmed.ok_or(Error::NotProgrammed)?.registers;
        write(&mut self.sink, &registers)
    }
}

fn write<S: RegisterSink>(sink: &mut S, registers: &RegisterSet) -> Result<()> {
    for word in registers.words() {
        sink.write_word(word)?;
    }
    Ok(())
}

impl RegisterSink for Box<dyn RegisterSink> {
    fn write_word(&mut self, word: u32) -> Result<()> {
        (**self).write_word(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    impl RegisterSink for Vec<u32> {
        fn write_word(&mut self, word: u32) -> Result<()> {
            self.push(word);
            Ok(())
        }
    }

    #[test]
    fn integer_n_100mhz() {
        let synth = Synthesizer::default();
        let n = synth.solve(100_000_000).unwrap();
        assert_eq!(n.divider, RfDivider::Div32);
        assert_eq!(n.prescaler, Prescaler::P4_5);
        assert_eq!((n.int, n.frac, n.modulus), (320, 0, 100));
        assert_eq!(n.achieved, 100_000_000);

        let words = synth.registers(&n).words();
        let set = RegisterSet::from_words(&words).unwrap();
        assert_eq!(set.frequency(synth.reference).unwrap(), 100_000_000);
        assert!(set.r2.flags.contains(R2Flags::LDF | R2Flags::LDP));
        assert_eq!(words[5], 320 << 15);
    }

    #[test]
    fn fractional_reduced() {
        let n = Synthesizer::default().solve(100_050_000).unwrap();
        // 3201.6 MHz VCO / 10 MHz PFD = 320 + 16/100
        assert_eq!((n.int, n.frac, n.modulus), (320, 4, 25));
        assert_eq!(n.achieved, 100_050_000);
    }

    #[test]
    fn prescaler_follows_divider() {
        let synth = Synthesizer::default();
        assert_eq!(synth.solve(3_700_000_000).unwrap().prescaler, Prescaler::P8_9);
        assert_eq!(synth.solve(3_500_000_000).unwrap().prescaler, Prescaler::P4_5);
        assert_eq!(synth.solve(2_200_000_001).unwrap().divider, RfDivider::Div1);
        assert_eq!(synth.solve(2_200_000_000).unwrap().divider, RfDivider::Div2);
    }

    #[test]
    fn out_of_range_target() {
        let synth = Synthesizer::default();
        assert!(matches!(
            synth.solve(FREQ_MIN - 1),
            Err(Error::FrequencyOutOfRange(_))
        ));
    }

    #[test]
    fn modulus_too_wide() {
        let synth = Synthesizer {
            channel_step: 1_000,
            ..Synthesizer::default()
        };
        assert!(matches!(
            synth.solve(100_000_000),
            Err(Error::DividerOverflow { field: "MOD", .. })
        ));
    }

    #[test]
    fn reference_rejected_without_mutation() {
        let mut synth = Synthesizer::default();
        assert!(matches!(
            synth.set_reference_frequency(REF_MAX + 1),
            Err(Error::ReferenceInvalid(_))
        ));
        assert!(matches!(
            synth.set_reference_frequency(99_999),
            Err(Error::ReferenceInvalid(_))
        ));
        // 1 MHz / 25 = 40 kHz PFD
        assert!(matches!(
            synth.set_reference_frequency(1_000_000),
            Err(Error::PhaseDetectorOutOfRange(40_000))
        ));
        assert_eq!(synth.reference, 250_000_000);
        synth.set_reference_frequency(100_000_000).unwrap();
        assert_eq!(synth.pfd(), 4_000_000);
    }

    #[test]
    fn channel_step_validated() {
        let mut synth = Synthesizer::default();
        assert!(synth.set_channel_step(1_000).is_err());
        assert!(synth.set_channel_step(0).is_err());
        synth.set_channel_step(10_000).unwrap();
        assert_eq!(synth.channel_step, 10_000);
    }

    #[test]
    fn validate_detects_bad_limits() {
        let n = FractionalN {
            int: 74,
            frac: 0,
            modulus: 100,
            divider: RfDivider::Div1,
            prescaler: Prescaler::P8_9,
            achieved: 0,
        };
        assert!(matches!(n.validate(), Err(Error::DividerOverflow { field: "INT", .. })));
        let n = FractionalN { frac: 100, int: 100, ..n };
        assert!(matches!(n.validate(), Err(Error::DividerOverflow { field: "FRAC", .. })));
        let n = FractionalN { frac: 0, modulus: 1, ..n };
        assert!(matches!(n.validate(), Err(Error::DividerOverflow { field: "MOD", .. })));
    }

    #[test]
    fn words_go_out_r5_first() {
        let mut adf = Adf4351::new(Synthesizer::default(), Vec::new());
        adf.set_frequency(144_000_000).unwrap();
        let control: Vec<u32> = adf.sink().iter().map(|w| w & 0x7).collect();
        assert_eq!(control, [5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn failed_set_keeps_previous() {
        let mut adf = Adf4351::new(Synthesizer::default(), Vec::new());
        adf.set_frequency(100_000_000).unwrap();
        let before = *adf.registers().unwrap();
        assert!(adf.set_frequency(1_000).is_err());
        assert_eq!(adf.sink().len(), 6);
        assert_eq!(adf.frequency(), Some(100_000_000));
        assert_eq!(*adf.registers().unwrap(), before);
    }

    #[test]
    fn external_solution_validated() {
        let mut adf = Adf4351::new(Synthesizer::default(), Vec::new());
        let mut n = adf.settings().solve(100_000_000).unwrap();
        n.frac = n.modulus;
        assert!(adf.program(100_000_000, n).is_err());
        assert!(adf.sink().is_empty());
        assert!(adf.frequency().is_none());
    }

    #[test]
    fn doubled_reference_preset() {
        let synth = crate::config::synth::REF_25MHZ_DOUBLED;
        assert_eq!(synth.pfd(), 10_000_000);
        let n = synth.solve(100_000_000).unwrap();
        assert_eq!((n.int, n.frac), (320, 0));
        let set = RegisterSet::from_words(&synth.registers(&n).words()).unwrap();
        assert!(set.r2.flags.contains(R2Flags::REF_DOUBLER));
        assert_eq!(set.frequency(synth.reference).unwrap(), 100_000_000);
    }

    #[test]
    fn reference_change_invalidates_cache() {
        let mut adf = Adf4351::new(Synthesizer::default(), Vec::new());
        adf.set_frequency(100_000_000).unwrap();
        adf.set_reference_frequency(100_000_000).unwrap();
        assert!(adf.registers().is_none());
        assert!(matches!(adf.rewrite(), Err(Error::NotProgrammed)));
    }

    proptest! {
        #[test]
        fn reconstructs_within_one_step(target in FREQ_MIN..=FREQ_MAX) {
            let synth = Synthesizer::default();
            let n = synth.solve(target).unwrap();
            prop_assert!(n.frac < n.modulus);
            prop_assert!((2..=MOD_MAX).contains(&n.modulus));
            prop_assert!(n.achieved.abs_diff(u64::from(target)) <= u64::from(synth.channel_step));

            let set = RegisterSet::from_words(&synth.registers(&n).words()).unwrap();
            prop_assert_eq!(set.frequency(synth.reference).unwrap(), n.achieved);
        }

        #[test]
        fn reduce_idempotent(modulus in 2..=MOD_MAX, frac in 0..MOD_MAX) {
            let frac = frac % modulus;
            let once = reduce(frac, modulus);
            prop_assert_eq!(once, reduce(once.0, once.1));
        }

        #[test]
        fn channel_grid_exact(channel in 0..1000_u32) {
            // every 100 kHz channel above 50 MHz is reachable exactly
            let target = 50_000_000 + channel * 100_000;
            prop_assert_eq!(Synthesizer::default().solve(target).unwrap().achieved, u64::from(target));
        }
    }
}
