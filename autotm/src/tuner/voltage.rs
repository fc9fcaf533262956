use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use super::Tuner;
use crate::{DacChannel, Hz, Result};

/// Number of points `lo, lo + step, ..` up to `hi`. A point landing within a
/// thousandth of a step past `hi` still counts.
pub fn grid_len(lo: f32, hi: f32, step: f32) -> usize {
    if hi < lo {
        return 0;
    }
    if step <= 0.0 {
        return 1;
    }
    let span = f64::from(hi - lo) / f64::from(step);
    (span + 1e-3).floor() as usize + 1
}

/// Voltage grid computed by index, so rounding does not build up along it.
pub fn grid(lo: f32, hi: f32, step: f32) -> impl Iterator<Item = f32> + Clone {
    (0..grid_len(lo, hi, step)).map(move |i| lo + i as f32 * step)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VoltageOptimum {
    pub tuning: f32,
    pub matching: f32,
    pub reflection: i32,
}

impl Tuner {
    fn clamp_window(&self, (lo, hi): (f32, f32)) -> (f32, f32) {
        let (min, max) = (self.voltage.min, self.voltage.max);
        (lo.clamp(min, max), hi.clamp(min, max))
    }

    /// Exhaustive search over both varactor voltages at the current
    /// frequency, matching in the inner loop. None when nothing reflected.
    pub fn sweep_voltages(
        &mut self,
        step: f32,
        tuning: (f32, f32),
        matching: (f32, f32),
    ) -> Result<Option<VoltageOptimum>> {
        let (t_lo, t_hi) = self.clamp_window(tuning);
        let (m_lo, m_hi) = self.clamp_window(matching);
        let averages = self.voltage.averages;
        debug!(
            "Voltage sweep step {}: tuning {}..{}, matching {}..{}",
            step, t_lo, t_hi, m_lo, m_hi
        );

        let mut best: Option<VoltageOptimum> = None;
        for vt in grid(t_lo, t_hi, step) {
            self.dac.write(DacChannel::Tuning, vt)?;
            for vm in grid(m_lo, m_hi, step) {
                self.dac.write(DacChannel::Matching, vm)?;
                let reflection = self.sampler.reflection(averages)?;
                if reflection > best.map_or(0, |b| b.reflection) {
                    best = Some(VoltageOptimum {
                        tuning: vt,
                        matching: vm,
                        reflection,
                    });
                }
            }
        }
        Ok(best)
    }

    fn apply_voltages(&mut self, optimum: Option<VoltageOptimum>) -> Result<Option<(f32, f32)>> {
        let (tuning, matching) = match optimum {
            Some(o) => (o.tuning, o.matching),
            None => {
                error!("No valid voltages found");
                (0.0, 0.0)
            }
        };
        self.dac.write(DacChannel::Matching, matching)?;
        self.dac.write(DacChannel::Tuning, tuning)?;
        Ok(optimum.map(|o| (o.tuning, o.matching)))
    }

    /// Coarse pass below the target over the full range, then two passes at
    /// the target narrowing around the previous optimum. The result is left
    /// on the DAC, 0 V on both channels if nothing was found.
    pub fn automatic_voltage_sweep(&mut self, frequency: Hz) -> Result<Option<(f32, f32)>> {
        let v = self.voltage.clone();
        let full = (v.min, v.max);
        info!("Automatic voltage sweep at {} Hz", frequency);

        self.tune_to(frequency.saturating_sub(v.coarse_offset))?;
        let Some(coarse) = self.sweep_voltages(v.coarse_step, full, full)? else {
            return self.apply_voltages(None);
        };

        self.tune_to(frequency)?;
        let around = |center: f32, width: f32| (center - width, center + width);
        let medium = self
            .sweep_voltages(
                v.medium_step,
                around(coarse.tuning, v.medium_tuning_window),
                full,
            )?
            .unwrap_or(coarse);
        let fine = self
            .sweep_voltages(
                v.fine_step,
                around(medium.tuning, v.fine_tuning_window),
                around(medium.matching, v.fine_matching_window),
            )?
            .unwrap_or(medium);

        self.apply_voltages(Some(fine))
    }

    /// Fine search around voltages found earlier.
    pub fn preset_voltage_sweep(
        &mut self,
        frequency: Hz,
        tuning: f32,
        matching: f32,
    ) -> Result<Option<(f32, f32)>> {
        let (step, width) = (self.voltage.preset_step, self.voltage.preset_window);
        info!(
            "Preset voltage sweep at {} Hz from {} V / {} V",
            frequency, tuning, matching
        );
        self.tune_to(frequency)?;
        let best = self.sweep_voltages(
            step,
            (tuning - width, tuning + width),
            (matching - width, matching + width),
        )?;
        self.apply_voltages(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sim::{Bench, Probe};
    use itertools::iproduct;

    #[test]
    fn grid_counts() {
        assert_eq!(grid_len(0.0, 5.0, 1.0), 6);
        assert_eq!(grid_len(0.0, 1.0, 0.05), 21);
        assert_eq!(grid_len(0.0, 1.0, 0.1), 11);
        assert_eq!(grid_len(1.8, 2.2, 0.01), 41);
        assert_eq!(grid_len(1.0, 0.5, 0.1), 0);
        assert_eq!(grid_len(1.0, 1.0, 0.1), 1);
        assert_eq!(grid_len(0.0, 1.0, 0.0), 1);
        let last = grid(0.0, 1.0, 0.05).last().unwrap();
        assert!((last - 1.0).abs() < 1e-6);

        let points = grid(1.8, 2.2, 0.1);
        assert_eq!(iproduct!(points.clone(), points).count(), 25);
    }

    fn peak(vt: f32, vm: f32) -> impl Fn(&Probe) -> f32 {
        move |p: &Probe| {
            let x = (p.tuning_voltage - vt) / 0.3;
            let y = (p.matching_voltage - vm) / 0.3;
            0.02 + 0.9 / ((1.0 + x * x) * (1.0 + y * y))
        }
    }

    #[test]
    fn automatic_finds_peak() {
        let bench = Bench::new(peak(2.3, 1.7));
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        let (vt, vm) = tuner.automatic_voltage_sweep(100_000_000).unwrap().unwrap();
        assert!((vt - 2.3).abs() < 0.011, "{vt}");
        assert!((vm - 1.7).abs() < 0.011, "{vm}");

        let state = bench.state.borrow();
        assert_eq!(state.voltages, [vt, vm]);
        let tail = &state.dac_writes[state.dac_writes.len() - 2..];
        assert_eq!(tail, [(DacChannel::Matching, vm), (DacChannel::Tuning, vt)]);
        assert_eq!(state.frequency, Some(100_000_000));
    }

    #[test]
    fn preset_scans_window() {
        let bench = Bench::new(peak(2.05, 1.93));
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        let reads = bench.state.borrow().adc_reads;
        let (vt, vm) = tuner
            .preset_voltage_sweep(100_000_000, 2.0, 2.0)
            .unwrap()
            .unwrap();
        assert_eq!(bench.state.borrow().adc_reads - reads, 41 * 41 * 4);

        let on_grid = iproduct!(grid(1.8, 2.2, 0.01), grid(1.8, 2.2, 0.01))
            .any(|(t, m)| (t - vt).abs() < 1e-4 && (m - vm).abs() < 1e-4);
        assert!(on_grid);
        assert!((vt - 2.05).abs() < 0.011);
        assert!((vm - 1.93).abs() < 0.011);
    }

    #[test]
    fn preset_clamps_to_range() {
        let bench = Bench::new(peak(0.0, 2.0));
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        let reads = bench.state.borrow().adc_reads;
        let (vt, _) = tuner
            .preset_voltage_sweep(100_000_000, 0.1, 2.0)
            .unwrap()
            .unwrap();
        assert_eq!(vt, 0.0);
        assert_eq!(bench.state.borrow().adc_reads - reads, 31 * 41 * 4);
        let state = bench.state.borrow();
        assert!(state.dac_writes.iter().all(|&(_, v)| v >= 0.0));
    }

    #[test]
    fn nothing_found_zeroes_outputs() {
        let bench = Bench::new(|_: &Probe| 0.0_f32);
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        assert_eq!(tuner.automatic_voltage_sweep(100_000_000).unwrap(), None);
        let state = bench.state.borrow();
        assert_eq!(state.voltages, [0.0, 0.0]);
        // coarse pass only: 6 x 6 points
        assert_eq!(state.adc_reads, 36 * 4);
        assert_eq!(state.frequency, Some(98_000_000));
    }
}
