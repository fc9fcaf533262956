use crate::config::*;

/// Line offsets of the second board revision, all on one gpiochip.
#[rustfmt::skip]
pub const ATM_V2: Lines = Lines {
    le:        27,
    filter_a:  23,
    filter_b:  22,
    rf_switch: 34,
};
