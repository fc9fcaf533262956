use crate::registers::OutputPower;
use crate::synth::Synthesizer;

/// 250 MHz TCXO, 10 MHz PFD, 100 kHz channels.
#[rustfmt::skip]
pub const REF_250MHZ: Synthesizer = Synthesizer {
    reference:         250_000_000,
    channel_step:      100_000,
    r_counter:         25,
    ref_doubler:       false,
    ref_div2:          false,
    power:             OutputPower::Minus4dBm,
    band_select_clock: 80,
    clock_divider:     150,
};

/// 25 MHz crystal doubled, same 10 MHz PFD and 100 kHz channels.
#[rustfmt::skip]
pub const REF_25MHZ_DOUBLED: Synthesizer = Synthesizer {
    reference:         25_000_000,
    channel_step:      100_000,
    r_counter:         5,
    ref_doubler:       true,
    ref_div2:          false,
    power:             OutputPower::Minus4dBm,
    band_select_clock: 80,
    clock_divider:     150,
};
