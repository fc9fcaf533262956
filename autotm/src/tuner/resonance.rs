use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::iter::successors;

use super::Tuner;
use crate::{sampler::ReflectionSample, synth::FREQ_MIN, Hz, Result};

/// Inclusive frequency scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sweep {
    pub start: Hz,
    pub stop: Hz,
    pub step: Hz,
}

impl Sweep {
    /// `center ± half_width`, kept inside the synthesizer range.
    #[must_use]
    pub fn around(center: Hz, half_width: Hz, step: Hz) -> Self {
        Self {
            start: center.saturating_sub(half_width).max(FREQ_MIN),
            stop: center.saturating_add(half_width),
            step,
        }
    }

    /// Ascending points from `start` up to and including `stop`. A zero step
    /// yields `start` alone.
    pub fn points(&self) -> impl Iterator<Item = Hz> {
        let Self { start, stop, step } = *self;
        successors(Some(start).filter(|&f| f <= stop), move |&f| {
            if step == 0 {
                None
            } else {
                f.checked_add(step).filter(|&next| next <= stop)
            }
        })
    }
}

impl Tuner {
    /// Frequency of maximum reflection within `sweep`, or None when the
    /// confirmed peak stays below the detection threshold.
    pub fn locate(&mut self, sweep: &Sweep) -> Result<Option<Hz>> {
        self.locate_with(sweep, |_| {})
    }

    /// Same as [`Tuner::locate`], handing every coarse point to `on_point`.
    pub fn locate_with<F>(&mut self, sweep: &Sweep, mut on_point: F) -> Result<Option<Hz>>
    where
        F: FnMut(&ReflectionSample),
    {
        let search = self.search.clone();

        // the first write after an idle synthesizer is not reliable
        self.tune_to(sweep.start)?;
        self.delay.delay_ms(search.confirm_settle_ms);

        let mut best: Option<ReflectionSample> = None;
        for frequency in sweep.points() {
            self.tune_to(frequency)?;
            let sample = self.sampler.sample(frequency, search.coarse_averages)?;
            on_point(&sample);
            if best.map_or(true, |b| sample.reflection > b.reflection) {
                best = Some(sample);
            }
        }
        let Some(candidate) = best else {
            return Ok(None);
        };

        let confirmed = self.reflection_at(
            candidate.frequency,
            search.confirm_averages,
            search.confirm_settle_ms,
        )?;
        if confirmed < search.found_threshold {
            warn!(
                "Resonance could not be found, {} mV at {} Hz",
                confirmed, candidate.frequency
            );
            return Ok(None);
        }

        // The detector needs time to charge, rescan the peak with heavier averaging
        let window = Sweep::around(candidate.frequency, search.refine_window, sweep.step);
        let mut refined: Option<(Hz, i32)> = None;
        for frequency in window.points() {
            self.tune_to(frequency)?;
            let reflection = self.sampler.reflection(search.refine_averages)?;
            if refined.map_or(true, |(_, best)| reflection > best) {
                refined = Some((frequency, reflection));
            }
        }
        let resonance = refined.map_or(candidate.frequency, |(f, _)| f);
        debug!("Resonance at {} Hz", resonance);
        Ok(Some(resonance))
    }
}
