use log::{debug, warn};

use super::{Sweep, Tuner};
use crate::{Hz, Result};

impl Tuner {
    /// Resonance near `around` and the reflection on it, 0 when it is lost.
    fn probe_match(&mut self, around: Hz) -> Result<(Option<Hz>, i32)> {
        let window = Sweep::around(
            around,
            self.search.matching_window,
            self.limits.auto_sweep.step / 10,
        );
        let Some(found) = self.locate(&window)? else {
            return Ok((None, 0));
        };
        let reflection = self.reflection_at(
            found,
            self.search.rotation_averages,
            self.search.resonance_settle_ms,
        )?;
        Ok((Some(found), reflection))
    }

    /// Direction of the matching axis that raises the reflection at
    /// `resonance`: 1 for clockwise, -1 otherwise. The axis is left where it
    /// started.
    pub fn get_match_rotation(&mut self, resonance: Hz) -> Result<i64> {
        let half = self.stepper.steps_per_rotation / 2;

        self.matching.move_by(half)?;
        let (found, clockwise) = self.probe_match(resonance)?;

        self.matching.move_by(-2 * half)?;
        let (_, anticlockwise) = self.probe_match(found.unwrap_or(resonance))?;

        self.matching.move_by(half)?;
        debug!("Match rotation: cw {} mV, ccw {} mV", clockwise, anticlockwise);
        Ok(if clockwise > anticlockwise { 1 } else { -1 })
    }

    /// Steps the matching axis in the improving direction, following the
    /// resonance as it drifts, and parks it where the reflection peaked.
    /// Returns that peak reflection.
    pub fn optimize(&mut self, resonance: Hz) -> Result<i32> {
        let search = self.search.clone();
        let rotation = self.get_match_rotation(resonance)?;
        let step = rotation * self.step_size();
        let probe_step = self.limits.auto_sweep.step / 2;

        self.tune_to(resonance)?;
        let mut best_position = self.matching.position();
        let mut best = 0;
        let mut current = resonance;

        for i in 0..search.matching_iterations {
            self.matching.move_by(step)?;
            self.delay.delay_ms(search.matching_settle_ms);

            let window = Sweep::around(current, search.matching_window, probe_step);
            let Some(found) = self.locate(&window)? else {
                warn!("Resonance lost at matching position {}", self.matching.position());
                self.delay.delay_ms(search.lost_penalty_ms);
                continue;
            };
            current = found;

            let reflection = self.reflection_at(
                current,
                search.resonance_averages,
                search.resonance_settle_ms,
            )?;
            if reflection > best {
                best = reflection;
                best_position = self.matching.position();
                debug!("Iteration {}: new maximum {} mV at {}", i, best, best_position);
            }

            if step == 0 {
                break;
            }
        }

        self.matching.move_to(best_position)?;
        debug!("Matching parked at {} ({} mV)", best_position, best);
        Ok(best)
    }
}
