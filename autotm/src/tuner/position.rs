use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::Tuner;
use crate::{Error, Result};

/// Grid for one axis, `range` steps either side of where it stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionWindow {
    pub range: i64,
    pub step: i64,
    pub backlash: i64,
    /// Replaces the remembered direction before the sweep.
    pub last_direction: Option<i8>,
}

impl PositionWindow {
    fn positions(&self, center: i64) -> Result<impl Iterator<Item = i64> + Clone> {
        let overflow = || Error::PositionOverflow(center, self.range);
        let lo = center.checked_sub(self.range).ok_or_else(overflow)?;
        let hi = center.checked_add(self.range).ok_or_else(overflow)?;
        let step = usize::try_from(self.step.max(1)).map_err(|_| overflow())?;
        Ok((lo..=hi).step_by(step))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionOptimum {
    pub tuning: i64,
    pub matching: i64,
    pub reflection: i32,
}

impl Tuner {
    /// Exhaustive search over both axes at the current frequency, matching in
    /// the inner loop. Every move is backlash corrected. Both axes end at the
    /// best grid point, or where they started when nothing reflected.
    pub fn sweep_positions(
        &mut self,
        tuning: &PositionWindow,
        matching: &PositionWindow,
    ) -> Result<PositionOptimum> {
        if let Some(dir) = tuning.last_direction {
            self.tuning.set_last_direction(dir);
        }
        if let Some(dir) = matching.last_direction {
            self.matching.set_last_direction(dir);
        }

        let averages = self.search.position_averages;
        let mut best = PositionOptimum {
            tuning: self.tuning.position(),
            matching: self.matching.position(),
            reflection: 0,
        };
        // nothing moves if either grid is out of range
        let tuning_grid = tuning.positions(best.tuning)?;
        let matching_grid = matching.positions(best.matching)?;

        for t in tuning_grid {
            self.tuning.move_to_corrected(t, tuning.backlash)?;
            for m in matching_grid.clone() {
                self.matching.move_to_corrected(m, matching.backlash)?;
                let reflection = self.sampler.reflection(averages)?;
                if reflection > best.reflection {
                    best = PositionOptimum {
                        tuning: t,
                        matching: m,
                        reflection,
                    };
                    debug!("New maximum {} mV at {}/{}", reflection, t, m);
                }
            }
        }

        self.tuning.move_to_corrected(best.tuning, tuning.backlash)?;
        self.matching.move_to_corrected(best.matching, matching.backlash)?;
        info!(
            "Position sweep done: tuning {}, matching {}, {} mV",
            best.tuning, best.matching, best.reflection
        );
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sim::{Bench, Probe, Surface};
    use crate::stepper::AxisId;
    use itertools::iproduct;

    const TUNING: PositionWindow = PositionWindow {
        range: 200,
        step: 40,
        backlash: 5,
        last_direction: None,
    };
    const MATCHING: PositionWindow = PositionWindow {
        range: 2000,
        step: 500,
        backlash: 10,
        last_direction: None,
    };

    #[test]
    fn finds_grid_optimum() {
        let bench = Bench::new(Surface::default());
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        tuner.set_frequency(100_400_000).unwrap();
        let reads = bench.state.borrow().adc_reads;

        let best = tuner.sweep_positions(&TUNING, &MATCHING).unwrap();
        assert_eq!((best.tuning, best.matching), (10080, 12000));
        assert!(best.reflection >= 999);
        assert_eq!(bench.state.borrow().adc_reads - reads, 11 * 9 * 4);

        let grid: Vec<_> = iproduct!(
            (9800..=10200).step_by(40),
            (8000..=12000).step_by(500)
        )
        .collect();
        assert!(grid.contains(&(best.tuning, best.matching)));
        assert_eq!(tuner.stepper(AxisId::Tuning).position(), 10080);
        assert_eq!(tuner.stepper(AxisId::Matching).position(), 12000);
    }

    #[test]
    fn direction_override_applies() {
        let bench = Bench::new(|_: &Probe| 0.0_f32);
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        // 9960 and 10040, then back to the start
        let tuning = PositionWindow {
            range: 40,
            step: 80,
            last_direction: Some(-1),
            ..TUNING
        };
        let matching = PositionWindow {
            range: 0,
            last_direction: Some(1),
            ..MATCHING
        };
        tuner.sweep_positions(&tuning, &matching).unwrap();
        // first move already preloaded downward, both reversals add 5
        assert_eq!(bench.state.borrow().tuning.travel, 40 + 85 + 45);
        assert_eq!(tuner.stepper(AxisId::Tuning).last_direction(), -1);
        // matching never moved, so its last move had no direction
        assert_eq!(tuner.stepper(AxisId::Matching).last_direction(), 0);
        assert_eq!(bench.state.borrow().matching.travel, 0);
    }

    #[test]
    fn out_of_range_grid_fails_unmoved() {
        let bench = Bench::new(Surface::default());
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        let tuning = PositionWindow {
            range: i64::MAX,
            ..TUNING
        };
        assert!(matches!(
            tuner.sweep_positions(&tuning, &MATCHING),
            Err(Error::PositionOverflow(..))
        ));
        let matching = PositionWindow {
            range: i64::MAX,
            ..MATCHING
        };
        assert!(tuner.sweep_positions(&TUNING, &matching).is_err());
        let state = bench.state.borrow();
        assert_eq!((state.tuning.travel, state.matching.travel), (0, 0));
    }

    #[test]
    fn nothing_reflects_returns_to_start() {
        let bench = Bench::new(|_: &Probe| 0.0_f32);
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        let best = tuner.sweep_positions(&TUNING, &MATCHING).unwrap();
        assert_eq!(
            best,
            PositionOptimum {
                tuning: 10000,
                matching: 10000,
                reflection: 0
            }
        );
        assert_eq!(tuner.stepper(AxisId::Tuning).position(), 10000);
    }
}
