/* ADF4351 register words
 *
 * Every word carries its own address in the low three control bits, all other
 * fields are packed at fixed offsets. Layout from the ADF4351 datasheet,
 * Figures 24 to 29.
 * */
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
#[cfg(test)] use proptest::prelude::*;
#[cfg(test)] use proptest_derive::Arbitrary;

use crate::{Error, Hz, Result};

fn field(word: u32, start: u8, len: u8) -> u32 {
    (word >> start) & ((1 << len) - 1)
}

fn put(value: u32, start: u8, len: u8) -> u32 {
    (value & ((1 << len) - 1)) << start
}

fn control(word: u32, expected: u32) -> Result<()> {
    if field(word, 0, 3) == expected {
        Ok(())
    } else {
        Err(Error::Decode(word))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reg0 {
    pub int: u16,  // DB30:DB15
    pub frac: u16, // DB14:DB3, 12 bits
}

impl From<Reg0> for u32 {
    fn from(item: Reg0) -> Self {
        put(item.int.into(), 15, 16) | put(item.frac.into(), 3, 12)
    }
}

impl TryFrom<u32> for Reg0 {
    type Error = Error;
    fn try_from(word: u32) -> Result<Self> {
        control(word, 0)?;
        Ok(Self {
            int: field(word, 15, 16) as u16,
            frac: field(word, 3, 12) as u16,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[cfg_attr(test, derive(Arbitrary))]
#[repr(u8)]
pub enum Prescaler {
    P4_5 = 0,
    P8_9 = 1,
}

impl Prescaler {
    /// Smallest integer divider the dual modulus prescaler can produce.
    #[must_use]
    pub fn min_int(self) -> u32 {
        match self {
            Prescaler::P4_5 => 23,
            Prescaler::P8_9 => 75,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reg1 {
    pub phase_adjust: bool,
    pub prescaler: Prescaler,
    pub phase: u16,   // DB26:DB15, 12 bits
    pub modulus: u16, // DB14:DB3, 12 bits
}

impl From<Reg1> for u32 {
    fn from(item: Reg1) -> Self {
        put(item.phase_adjust.into(), 28, 1)
            | put(u8::from(item.prescaler).into(), 27, 1)
            | put(item.phase.into(), 15, 12)
            | put(item.modulus.into(), 3, 12)
            | 1
    }
}

impl TryFrom<u32> for Reg1 {
    type Error = Error;
    fn try_from(word: u32) -> Result<Self> {
        control(word, 1)?;
        Ok(Self {
            phase_adjust: field(word, 28, 1) == 1,
            prescaler: Prescaler::try_from(field(word, 27, 1) as u8).or(Err(Error::Decode(word)))?,
            phase: field(word, 15, 12) as u16,
            modulus: field(word, 3, 12) as u16,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[repr(u8)]
#[rustfmt::skip]
pub enum Muxout {
    ThreeState  = 0b000,
    DVdd        = 0b001,
    DGnd        = 0b010,
    RCounter    = 0b011,
    NDivider    = 0b100,
    AnalogLock  = 0b101,
    DigitalLock = 0b110,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum NoiseMode {
    LowNoise = 0b00,
    LowSpur = 0b11,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct R2Flags: u32 {
        const COUNTER_RESET  = 1 << 3;
        const CP_THREE_STATE = 1 << 4;
        const POWER_DOWN     = 1 << 5;
        const PD_POLARITY    = 1 << 6; // positive
        const LDP            = 1 << 7; // 6ns, integer-N
        const LDF            = 1 << 8; // 40 PFD cycles, integer-N
        const DOUBLE_BUFFER  = 1 << 13;
        const RDIV2          = 1 << 24;
        const REF_DOUBLER    = 1 << 25;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reg2 {
    pub noise: NoiseMode,
    pub muxout: Muxout,
    pub r_counter: u16, // 10 bits
    pub charge_pump: u8, // 4 bits
    pub flags: R2Flags,
}

impl From<Reg2> for u32 {
    fn from(item: Reg2) -> Self {
        put(u8::from(item.noise).into(), 29, 2)
            | put(u8::from(item.muxout).into(), 26, 3)
            | put(item.r_counter.into(), 14, 10)
            | put(item.charge_pump.into(), 9, 4)
            | item.flags.bits()
            | 2
    }
}

impl TryFrom<u32> for Reg2 {
    type Error = Error;
    fn try_from(word: u32) -> Result<Self> {
        control(word, 2)?;
        Ok(Self {
            noise: NoiseMode::try_from(field(word, 29, 2) as u8).or(Err(Error::Decode(word)))?,
            muxout: Muxout::try_from(field(word, 26, 3) as u8).or(Err(Error::Decode(word)))?,
            r_counter: field(word, 14, 10) as u16,
            charge_pump: field(word, 9, 4) as u8,
            flags: R2Flags::from_bits_truncate(word),
        })
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct R3Flags: u32 {
        const CSR              = 1 << 18;
        const CHARGE_CANCEL    = 1 << 21;
        const ABP_3NS          = 1 << 22; // integer-N
        const BAND_SELECT_HIGH = 1 << 23;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reg3 {
    pub flags: R3Flags,
    pub clock_div_mode: u8,  // 2 bits
    pub clock_divider: u16, // 12 bits
}

impl From<Reg3> for u32 {
    fn from(item: Reg3) -> Self {
        item.flags.bits()
            | put(item.clock_div_mode.into(), 15, 2)
            | put(item.clock_divider.into(), 3, 12)
            | 3
    }
}

impl TryFrom<u32> for Reg3 {
    type Error = Error;
    fn try_from(word: u32) -> Result<Self> {
        control(word, 3)?;
        Ok(Self {
            flags: R3Flags::from_bits_truncate(word),
            clock_div_mode: field(word, 15, 2) as u8,
            clock_divider: field(word, 3, 12) as u16,
        })
    }
}

/// RF output divider, the discriminant is the divider select code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[cfg_attr(test, derive(Arbitrary))]
#[repr(u8)]
pub enum RfDivider {
    Div1 = 0,
    Div2 = 1,
    Div4 = 2,
    Div8 = 3,
    Div16 = 4,
    Div32 = 5,
    Div64 = 6,
}

impl RfDivider {
    #[must_use]
    pub fn ratio(self) -> u32 {
        1 << u8::from(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[cfg_attr(test, derive(Arbitrary))]
#[repr(u8)]
#[rustfmt::skip]
pub enum OutputPower {
    Minus4dBm = 0,
    Minus1dBm = 1,
    Plus2dBm  = 2,
    Plus5dBm  = 3,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct R4Flags: u32 {
        const RF_ENABLE       = 1 << 5;
        const AUX_ENABLE      = 1 << 8;
        const AUX_FUNDAMENTAL = 1 << 9;
        const MTLD            = 1 << 10;
        const VCO_POWER_DOWN  = 1 << 11;
        const FEEDBACK_FUNDAMENTAL = 1 << 23;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reg4 {
    pub flags: R4Flags,
    pub divider: RfDivider,
    pub band_select_clock: u8,
    pub aux_power: OutputPower,
    pub power: OutputPower,
}

impl From<Reg4> for u32 {
    fn from(item: Reg4) -> Self {
        item.flags.bits()
            | put(u8::from(item.divider).into(), 20, 3)
            | put(item.band_select_clock.into(), 12, 8)
            | put(u8::from(item.aux_power).into(), 6, 2)
            | put(u8::from(item.power).into(), 3, 2)
            | 4
    }
}

impl TryFrom<u32> for Reg4 {
    type Error = Error;
    fn try_from(word: u32) -> Result<Self> {
        control(word, 4)?;
        Ok(Self {
            flags: R4Flags::from_bits_truncate(word),
            divider: RfDivider::try_from(field(word, 20, 3) as u8).or(Err(Error::Decode(word)))?,
            band_select_clock: field(word, 12, 8) as u8,
            aux_power: OutputPower::try_from(field(word, 6, 2) as u8).or(Err(Error::Decode(word)))?,
            power: OutputPower::try_from(field(word, 3, 2) as u8).or(Err(Error::Decode(word)))?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockDetectPin {
    Low = 0b00,
    DigitalLockDetect = 0b01,
    LowAlt = 0b10,
    High = 0b11,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reg5 {
    pub ld_pin: LockDetectPin,
}

impl From<Reg5> for u32 {
    fn from(item: Reg5) -> Self {
        // DB20:DB19 are reserved and must be 11
        put(u8::from(item.ld_pin).into(), 22, 2) | put(0b11, 19, 2) | 5
    }
}

impl TryFrom<u32> for Reg5 {
    type Error = Error;
    fn try_from(word: u32) -> Result<Self> {
        control(word, 5)?;
        Ok(Self {
            ld_pin: LockDetectPin::try_from(field(word, 22, 2) as u8).or(Err(Error::Decode(word)))?,
        })
    }
}

/// After power up the part needs all six words, R5 first and R0 last. Writing
/// R0 double-buffers the divider settings, so the order is fixed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterSet {
    pub r0: Reg0,
    pub r1: Reg1,
    pub r2: Reg2,
    pub r3: Reg3,
    pub r4: Reg4,
    pub r5: Reg5,
}

impl RegisterSet {
    /// Words in transmit order, R5 down to R0.
    #[must_use]
    pub fn words(&self) -> [u32; 6] {
        [
            self.r5.into(),
            self.r4.into(),
            self.r3.into(),
            self.r2.into(),
            self.r1.into(),
            self.r0.into(),
        ]
    }

    /// Rebuilds a set from six words in any order, addressed by their control bits.
    pub fn from_words(words: &[u32]) -> Result<Self> {
        let mut slots: [Option<u32>; 6] = [None; 6];
        for &word in words {
            let idx = field(word, 0, 3) as usize;
            match slots.get_mut(idx) {
                Some(slot) if slot.is_none() => *slot = Some(word),
                _ => return Err(Error::Decode(word)),
            }
        }
        let get = |i: usize| slots[i].ok_or(Error::Decode(i as u32));
        Ok(Self {
            r0: get(0)?.try_into()?,
            r1: get(1)?.try_into()?,
            r2: get(2)?.try_into()?,
            r3: get(3)?.try_into()?,
            r4: get(4)?.try_into()?,
            r5: get(5)?.try_into()?,
        })
    }

    /// Phase detector frequency as an exact (numerator, denominator) pair.
    /// f PFD = REF IN × [(1 + D)/(R × (1 + T))]
    #[must_use]
    pub fn pfd(&self, reference: Hz) -> (u128, u128) {
        let d = u128::from(self.r2.flags.contains(R2Flags::REF_DOUBLER));
        let t = u128::from(self.r2.flags.contains(R2Flags::RDIV2));
        (u128::from(reference) * (1 + d), u128::from(self.r2.r_counter) * (1 + t))
    }

    /// RF OUT = [INT + (FRAC/MOD)] × (f PFD / RF Divider), rounded to the nearest Hz.
    pub fn frequency(&self, reference: Hz) -> Result<u64> {
        let (num, den) = self.pfd(reference);
        let modulus = u128::from(self.r1.modulus);
        if den == 0 || modulus == 0 {
            return Err(Error::Decode(self.r2.into()));
        }
        let n = u128::from(self.r0.int) * modulus + u128::from(self.r0.frac);
        let den = den * modulus * u128::from(self.r4.divider.ratio());
        u64::try_from((num * n + den / 2) / den).or(Err(Error::Decode(self.r0.into())))
    }
}

#[cfg(test)]
proptest! {
    #[test]
    fn reg0_inverse(int in any::<u16>(), frac in 0..4096_u16) {
        let r = Reg0 { int, frac };
        assert_eq!(r, Reg0::try_from(u32::from(r)).unwrap());
    }

    #[test]
    fn reg1_inverse(prescaler in any::<Prescaler>(), phase in 0..4096_u16, modulus in 2..4096_u16) {
        let r = Reg1 { phase_adjust: false, prescaler, phase, modulus };
        assert_eq!(r, Reg1::try_from(u32::from(r)).unwrap());
    }

    #[test]
    fn reg4_inverse(divider: RfDivider, power: OutputPower, band_select_clock: u8) {
        let r = Reg4 {
            flags: R4Flags::RF_ENABLE | R4Flags::FEEDBACK_FUNDAMENTAL,
            divider,
            band_select_clock,
            aux_power: OutputPower::Minus4dBm,
            power,
        };
        assert_eq!(r, Reg4::try_from(u32::from(r)).unwrap());
    }

    #[test]
    fn fields_stay_in_their_lane(frac in 0..4096_u16) {
        // FRAC must never bleed into the control bits or INT
        let word = u32::from(Reg0 { int: 0, frac });
        assert_eq!(word & 0x7, 0);
        assert_eq!(word >> 15, 0);
    }
}

#[test]
fn wrong_control_bits_rejected() {
    let word = u32::from(Reg1 {
        phase_adjust: false,
        prescaler: Prescaler::P4_5,
        phase: 1,
        modulus: 100,
    });
    assert!(matches!(Reg0::try_from(word), Err(Error::Decode(_))));
}

#[test]
fn reg5_reserved_bits() {
    let word = u32::from(Reg5 {
        ld_pin: LockDetectPin::DigitalLockDetect,
    });
    assert_eq!(word, 0x0058_0005);
}

#[test]
fn from_words_rejects_duplicates() {
    assert!(RegisterSet::from_words(&[0, 0, 1, 2, 3, 4]).is_err());
}
