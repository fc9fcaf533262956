use crate::filter::FilterBand;

/// Low-pass bank on the second board revision, ascending cutoff.
#[rustfmt::skip]
pub const ATM_V2: [FilterBand; 4] = [
    FilterBand::new(71_000_000,  true,  true),
    FilterBand::new(120_000_000, false, true),
    FilterBand::new(180_000_000, false, false),
    FilterBand::new(260_000_000, true,  false),
];
