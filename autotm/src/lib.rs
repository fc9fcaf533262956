use spidev::{SpiModeFlags, Spidev, SpidevOptions};
use std::path::Path;
use thiserror::Error;

pub mod command;
pub mod config;
pub mod filter;
pub mod linux;
pub mod registers;
pub mod sampler;
pub mod sim;
pub mod stepper;
pub mod synth;
pub mod telemetry;
pub mod tuner;

pub type Hz = u32;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SPI communication failed")]
    Io(#[from] std::io::Error),
    #[error("GPIO request failed")]
    Gpio(#[from] gpiocdev::Error),
    #[error("Frequency out of range: {0} Hz")]
    FrequencyOutOfRange(u64),
    #[error("Phase detector frequency out of range: {0} Hz")]
    PhaseDetectorOutOfRange(u64),
    #[error("{field} out of range: {value}")]
    DividerOverflow { field: &'static str, value: u64 },
    #[error("Invalid reference frequency: {0} Hz")]
    ReferenceInvalid(u64),
    #[error("No register set computed yet")]
    NotProgrammed,
    #[error("Limit not found before reaching {0}")]
    HomingFailed(i64),
    #[error("Position out of range: {0} {1:+}")]
    PositionOverflow(i64, i64),
    #[error("Invalid register word 0x{0:08x}")]
    Decode(u32),
    #[error("{0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("Telemetry encoding failed")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Destination for ADF4351 register words. One call per 32 bit word, in the
/// order the caller hands them over.
pub trait RegisterSink {
    fn write_word(&mut self, word: u32) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdcChannel {
    Magnitude,
    Phase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DacChannel {
    Tuning,
    Matching,
}

/// Raw converter access, values in volts.
pub trait Adc {
    fn read(&mut self, channel: AdcChannel) -> Result<f32>;
}

pub trait Dac {
    fn write(&mut self, channel: DacChannel, volts: f32) -> Result<()>;
}

/// One stepper and its driver. Targets are latched by `move_relative`/`move_to`
/// and only executed by `run`/`run_to_position`.
pub trait Axis {
    fn move_relative(&mut self, steps: i64);
    fn move_to(&mut self, position: i64);
    /// Blocks until the latched target is reached.
    fn run_to_position(&mut self) -> Result<()>;
    /// Takes at most one step toward the target. Returns false once there.
    fn run(&mut self) -> Result<bool>;
    fn stop(&mut self);
    fn current_position(&self) -> i64;
    fn set_current_position(&mut self, position: i64);
    fn stalled(&mut self) -> Result<bool>;
    fn set_speed_profile(&mut self, max_speed: f32, acceleration: f32);
    fn set_stall_sensitivity(&mut self, value: i8) -> Result<()>;
}

/// A group of binary control lines (filter bank select, RF path switch).
pub trait OutputLines {
    fn set_values(&mut self, values: &[bool]) -> Result<()>;
}

pub trait Delay {
    fn delay_us(&mut self, us: u32);
    fn delay_ms(&mut self, ms: u32) {
        self.delay_us(ms.saturating_mul(1000));
    }
}

pub struct StdDelay;

impl Delay for StdDelay {
    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(std::time::Duration::from_micros(us.into()));
    }
}

/// Opens the synthesizer bus. The ADF4351 latches on the rising clock edge, MSB first.
pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Spidev> {
    let mut spi = Spidev::open(path)?;
    let options = SpidevOptions::new()
        .bits_per_word(8)
        .max_speed_hz(1_000_000)
        .mode(SpiModeFlags::SPI_MODE_0)
        .build();
    spi.configure(&options)?;
    Ok(spi)
}
