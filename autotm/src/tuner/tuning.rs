use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{Sweep, Tuner};
use crate::{Hz, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningOutcome {
    /// Where the resonance ended up, None if it was lost on the way.
    pub resonance: Option<Hz>,
    /// Signed tuning step of every iteration that ran.
    pub steps: Vec<i64>,
}

impl Tuner {
    /// Walks the resonance toward `target` with the tuning axis. Clockwise
    /// raises the frequency. Every overshoot flips the direction and halves
    /// the step.
    pub fn bruteforce(&mut self, target: Hz, resonance: Hz) -> Result<TuningOutcome> {
        let search = self.search.clone();
        let probe_step = self.limits.auto_sweep.step / 2;

        let mut rotation: i64 = if target < resonance { -1 } else { 1 };
        let mut step = rotation * self.step_size();
        let mut current = resonance;
        let mut steps = Vec::new();
        debug!("Tuning from {} Hz to {} Hz, step {}", resonance, target, step);

        for i in 0..search.tuning_iterations {
            steps.push(step);
            self.tuning.move_by(step)?;
            // the matching element detunes along with a large tuning move
            if i == 0 {
                self.matching.move_by(-3 * step)?;
            }

            let window = Sweep::around(current, search.tuning_window, probe_step);
            let Some(found) = self.locate(&window)? else {
                warn!("Resonance lost while tuning, last seen at {} Hz", current);
                return Ok(TuningOutcome {
                    resonance: None,
                    steps,
                });
            };
            current = found;
            debug!("Iteration {}: step {}, resonance {} Hz", i, step, current);

            if current == target {
                break;
            }

            let reflection = self.reflection_at(
                current,
                search.resonance_averages,
                search.resonance_settle_ms,
            )?;
            if reflection < search.matching_threshold {
                info!("Rematching at {} Hz ({} mV)", current, reflection);
                self.optimize(current)?;
            }

            if (current > target && rotation == 1) || (current < target && rotation == -1) {
                rotation = -rotation;
                step = -(step / 2);
            }
        }

        Ok(TuningOutcome {
            resonance: Some(current),
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::sim::{Bench, Probe, Surface};
    use crate::stepper::AxisId;

    #[test]
    fn overshoot_halves_and_flips() {
        let bench = Bench::new(Surface::default());
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        let outcome = tuner.bruteforce(104_100_000, 100_000_000).unwrap();

        assert_eq!(outcome.resonance, Some(104_100_000));
        assert_eq!(outcome.steps, [160, 160, 160, 160, 160, 160, -80, -80, 40, -20]);
        for (prev, next) in outcome.steps.iter().zip(&outcome.steps[1..]) {
            if prev.signum() != next.signum() {
                assert_eq!(*next, -prev / 2);
            }
        }
        assert_eq!(tuner.stepper(AxisId::Tuning).position(), 10820);
        // counter-move on the first iteration only
        assert_eq!(tuner.stepper(AxisId::Matching).position(), 10000 - 480);
    }

    #[test]
    fn downward_target() {
        let bench = Bench::new(Surface::default());
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        let outcome = tuner.bruteforce(96_000_000, 100_000_000).unwrap();
        assert_eq!(outcome.steps[0], -160);
        assert_eq!(outcome.resonance, Some(96_000_000));
        assert_eq!(tuner.stepper(AxisId::Matching).position(), 10000 + 480);
    }

    #[test]
    fn lost_resonance_short_circuits() {
        let bench = Bench::new(|_: &Probe| 0.0_f32);
        let mut tuner = bench.tuner(&Config::default()).unwrap();
        let outcome = tuner.bruteforce(104_000_000, 100_000_000).unwrap();
        assert_eq!(outcome.resonance, None);
        assert_eq!(outcome.steps, [160]);
    }

    #[test]
    fn budget_exhausted_returns_last() {
        // resonance pinned at 100 MHz whatever the tuner does
        let bench = Bench::new(|p: &Probe| {
            let x = (p.frequency - 100e6) / 500e3;
            (1.0 / (1.0 + x * x)) as f32
        });
        let config = Config::default();
        let mut tuner = bench.tuner(&config).unwrap();
        let outcome = tuner.bruteforce(104_000_000, 100_000_000).unwrap();
        assert_eq!(outcome.resonance, Some(100_000_000));
        assert_eq!(outcome.steps.len(), config.search.tuning_iterations as usize);
        assert!(outcome.steps.iter().all(|&s| s == 160));
    }
}
