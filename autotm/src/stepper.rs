use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{Axis, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisId {
    Tuning,
    Matching,
}

/// Normal speed, acceleration and stall threshold of an axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionProfile {
    pub max_speed: f32,
    pub acceleration: f32,
    /// StallGuard threshold, -64..63. Lower is more sensitive.
    pub stall_value: i8,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            max_speed: 12000.0,
            acceleration: 12000.0,
            stall_value: 16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomingSettings {
    /// Far negative target, the limit is expected long before it.
    pub seek_target: i64,
    pub slow_speed: f32,
    pub slow_stall_value: i8,
    /// Distance to back off the limit after each pass.
    pub nudge: i64,
}

impl Default for HomingSettings {
    fn default() -> Self {
        Self {
            seek_target: -9_999_999,
            slow_speed: 3000.0,
            slow_stall_value: -64,
            nudge: 1000,
        }
    }
}

/// One motor axis plus the direction of its last move. The direction memory
/// lives as long as the axis does, across commands.
pub struct Stepper {
    name: &'static str,
    axis: Box<dyn Axis>,
    profile: MotionProfile,
    last_direction: i8,
}

fn direction(delta: i64) -> i8 {
    delta.signum() as i8
}

fn offset(position: i64, steps: i64) -> Result<i64> {
    position
        .checked_add(steps)
        .ok_or(Error::PositionOverflow(position, steps))
}

fn distance(from: i64, to: i64) -> Result<i64> {
    to.checked_sub(from)
        .ok_or(Error::PositionOverflow(from, to))
}

impl Stepper {
    pub fn new(name: &'static str, mut axis: Box<dyn Axis>, profile: MotionProfile) -> Result<Self> {
        axis.set_speed_profile(profile.max_speed, profile.acceleration);
        axis.set_stall_sensitivity(profile.stall_value)?;
        Ok(Self {
            name,
            axis,
            profile,
            last_direction: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn position(&self) -> i64 {
        self.axis.current_position()
    }

    pub fn last_direction(&self) -> i8 {
        self.last_direction
    }

    /// Overrides the remembered direction, e.g. with state a host tracked
    /// across a restart.
    pub fn set_last_direction(&mut self, dir: i8) {
        self.last_direction = dir.signum();
    }

    fn remember(&mut self, delta: i64) {
        if delta != 0 {
            self.last_direction = direction(delta);
        }
    }

    /// Plain relative move, no backlash handling.
    pub fn move_by(&mut self, steps: i64) -> Result<()> {
        self.remember(steps);
        self.axis.move_relative(steps);
        self.axis.run_to_position()
    }

    /// Plain absolute move, no backlash handling.
    pub fn move_to(&mut self, target: i64) -> Result<()> {
        let delta = distance(self.position(), target)?;
        self.remember(delta);
        self.axis.move_to(target);
        self.axis.run_to_position()
    }

    /// Moves to `target`, overshooting by `backlash` in the direction of travel
    /// whenever that direction differs from the previous move. The position
    /// counter reads `target` afterward and the remembered direction is the
    /// one of this move, 0 when it had no length. Returns the compensation
    /// applied.
    pub fn move_to_corrected(&mut self, target: i64, backlash: i64) -> Result<i64> {
        let dir = direction(distance(self.position(), target)?);
        let compensation = if dir == self.last_direction {
            0
        } else {
            backlash * i64::from(dir)
        };
        let overshoot = offset(target, compensation)?;
        debug!(
            "{}: {} -> {} (compensation {})",
            self.name,
            self.position(),
            target,
            compensation
        );
        self.last_direction = dir;
        self.axis.move_to(overshoot);
        self.axis.run_to_position()?;
        self.axis.set_current_position(target);
        Ok(compensation)
    }

    /// Relative move that always adds `backlash` extra steps but only counts
    /// `steps` of them. Returns the new position.
    pub fn move_compensated(&mut self, steps: i64, backlash: i64) -> Result<i64> {
        let start = self.position();
        let end = offset(start, steps)?;
        let travel = steps
            .checked_add(backlash)
            .ok_or(Error::PositionOverflow(steps, backlash))?;
        offset(start, travel)?;
        self.remember(travel);
        self.axis.move_relative(travel);
        self.axis.run_to_position()?;
        self.axis.set_current_position(end);
        Ok(self.position())
    }

    fn seek_stall(&mut self, target: i64) -> Result<i64> {
        self.axis.move_to(target);
        while !self.axis.stalled()? {
            if !self.axis.run()? {
                return Err(Error::HomingFailed(target));
            }
        }
        self.axis.stop();
        debug!("{}: stalled at {}", self.name, self.position());
        Ok(self.position())
    }

    /// Runs into the mechanical limit twice, fast then slow and sensitive, and
    /// zeroes the counter there. The axis is left `nudge` steps off the limit
    /// with the normal profile restored. Returns the zero reference.
    pub fn home(&mut self, homing: &HomingSettings) -> Result<i64> {
        info!("Homing {}", self.name);
        self.seek_stall(homing.seek_target)?;
        self.axis.set_current_position(0);
        self.move_to(homing.nudge)?;

        self.axis.set_speed_profile(homing.slow_speed, homing.slow_speed);
        self.axis.set_stall_sensitivity(homing.slow_stall_value)?;
        let slow = self.seek_stall(homing.seek_target);
        self.axis.set_stall_sensitivity(self.profile.stall_value)?;
        self.axis
            .set_speed_profile(self.profile.max_speed, self.profile.acceleration);
        slow?;

        self.axis.set_current_position(0);
        self.move_to(homing.nudge)?;
        self.last_direction = 1;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Bench, Surface};

    fn stepper(bench: &Bench, id: AxisId) -> Stepper {
        Stepper::new("tuner", Box::new(bench.axis(id)), MotionProfile::default()).unwrap()
    }

    #[test]
    fn same_direction_no_compensation() {
        let bench = Bench::new(Surface::default());
        let mut s = stepper(&bench, AxisId::Tuning);
        s.move_by(100).unwrap();
        assert_eq!(s.last_direction(), 1);
        assert_eq!(s.move_to_corrected(s.position() + 50, 7).unwrap(), 0);
        assert_eq!(s.last_direction(), 1);
    }

    #[test]
    fn reversal_applies_backlash() {
        let bench = Bench::new(Surface::default());
        let mut s = stepper(&bench, AxisId::Tuning);
        let start = s.position();
        s.move_by(100).unwrap();
        let travel = bench.state.borrow().tuning.travel;

        assert_eq!(s.move_to_corrected(start, 7).unwrap(), -7);
        assert_eq!(s.last_direction(), -1);
        assert_eq!(s.position(), start);
        // 100 back plus 7 of overshoot
        assert_eq!(bench.state.borrow().tuning.travel - travel, 107);
    }

    #[test]
    fn first_move_compensates() {
        let bench = Bench::new(Surface::default());
        let mut s = stepper(&bench, AxisId::Matching);
        assert_eq!(s.last_direction(), 0);
        let target = s.position() - 20;
        assert_eq!(s.move_to_corrected(target, 5).unwrap(), -5);
        assert_eq!(s.position(), target);
    }

    #[test]
    fn zero_move_direction() {
        let bench = Bench::new(Surface::default());
        let mut s = stepper(&bench, AxisId::Tuning);
        s.move_by(-10).unwrap();
        s.move_by(0).unwrap();
        assert_eq!(s.last_direction(), -1);
        // no direction, so it differs from -1 but compensation is still 0
        assert_eq!(s.move_to_corrected(s.position(), 9).unwrap(), 0);
        assert_eq!(s.last_direction(), 0);
        // the next move in either direction is compensated
        assert_eq!(s.move_to_corrected(s.position() - 10, 9).unwrap(), -9);
    }

    #[test]
    fn overflowing_moves_fail() {
        let bench = Bench::new(Surface::default());
        let mut s = stepper(&bench, AxisId::Tuning);
        let start = s.position();
        assert!(matches!(
            s.move_compensated(i64::MAX, 1),
            Err(Error::PositionOverflow(..))
        ));
        assert!(matches!(
            s.move_compensated(i64::MAX - 1, 0),
            Err(Error::PositionOverflow(..))
        ));
        assert!(matches!(
            s.move_to_corrected(i64::MIN, 0),
            Err(Error::PositionOverflow(..))
        ));
        assert!(matches!(s.move_to(i64::MIN), Err(Error::PositionOverflow(..))));
        assert_eq!(s.position(), start);
        assert_eq!(bench.state.borrow().tuning.travel, 0);
    }

    #[test]
    fn override_direction() {
        let bench = Bench::new(Surface::default());
        let mut s = stepper(&bench, AxisId::Tuning);
        s.set_last_direction(5);
        assert_eq!(s.last_direction(), 1);
        assert_eq!(s.move_to_corrected(s.position() + 10, 3).unwrap(), 0);
    }

    #[test]
    fn compensated_relative_move() {
        let bench = Bench::new(Surface::default());
        let mut s = stepper(&bench, AxisId::Tuning);
        let start = s.position();
        assert_eq!(s.move_compensated(200, 15).unwrap(), start + 200);
        let state = bench.state.borrow();
        assert_eq!(state.tuning.travel, 215);
    }

    #[test]
    fn homing_after_500_steps() {
        let bench = Bench::new(Surface::default());
        bench.state.borrow_mut().tuning.place(500, 0);
        let mut s = stepper(&bench, AxisId::Tuning);
        let homing = HomingSettings::default();

        assert_eq!(s.home(&homing).unwrap(), 0);
        assert_eq!(s.position(), homing.nudge);
        assert_eq!(s.last_direction(), 1);

        let state = bench.state.borrow();
        // seek 500, nudge, seek back, nudge
        assert_eq!(state.tuning.travel, 500 + 3 * 1000);
        assert_eq!(state.tuning.physical, 1000);
        assert_eq!(state.tuning.stall_value, 16);
        assert_eq!(state.tuning.max_speed, 12000.0);
    }

    #[test]
    fn homing_without_limit_fails() {
        let bench = Bench::new(Surface::default());
        bench.state.borrow_mut().tuning.limit = None;
        let mut s = stepper(&bench, AxisId::Tuning);
        let homing = HomingSettings {
            seek_target: -2000,
            ..HomingSettings::default()
        };
        assert!(matches!(s.home(&homing), Err(Error::HomingFailed(-2000))));
    }
}
