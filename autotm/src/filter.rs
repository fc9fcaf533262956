use log::info;
use serde::{Deserialize, Serialize};

use crate::{Hz, OutputLines, Result};

/// One low-pass section of the filter bank. `a`/`b` are the levels of the two
/// switch control lines that route the signal through it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterBand {
    pub cutoff: Hz,
    pub a: bool,
    pub b: bool,
}

impl FilterBand {
    pub const fn new(cutoff: Hz, a: bool, b: bool) -> Self {
        Self { cutoff, a, b }
    }
}

/// Picks the band passing `frequency`: the first one whose cutoff lies above
/// it, or the last band for anything beyond the top cutoff.
#[must_use]
pub fn select(bands: &[FilterBand], frequency: Hz) -> Option<usize> {
    if bands.is_empty() {
        return None;
    }
    let idx = bands
        .iter()
        .position(|band| frequency < band.cutoff)
        .unwrap_or(bands.len() - 1);
    Some(idx)
}

pub struct FilterBank {
    bands: Vec<FilterBand>,
    lines: Box<dyn OutputLines>,
    active: Option<usize>,
}

impl FilterBank {
    /// `bands` must be sorted by ascending cutoff.
    pub fn new(bands: Vec<FilterBand>, lines: Box<dyn OutputLines>) -> Self {
        Self {
            bands,
            lines,
            active: None,
        }
    }

    pub fn bands(&self) -> &[FilterBand] {
        &self.bands
    }

    pub fn active(&self) -> Option<&FilterBand> {
        self.active.and_then(|idx| self.bands.get(idx))
    }

    /// Routes through the band for `frequency`. The switch lines are only
    /// touched when the band actually changes.
    pub fn select(&mut self, frequency: Hz) -> Result<()> {
        let Some(idx) = select(&self.bands, frequency) else {
            return Ok(());
        };
        if self.active == Some(idx) {
            return Ok(());
        }
        let band = self.bands[idx];
        info!("Switching filter to: {}Hz", band.cutoff);
        self.lines.set_values(&[band.a, band.b])?;
        self.active = Some(idx);
        Ok(())
    }
}
