//! spidev and gpiocdev backends for the synthesizer bus and the control lines.

use gpiocdev::{line::Value, Request};
use log::trace;
use spidev::Spidev;
use std::{io::Write, path::Path};

use crate::{config::Board, Delay, OutputLines, RegisterSink, Result, StdDelay};

fn level(active: bool) -> Value {
    if active {
        Value::Active
    } else {
        Value::Inactive
    }
}

/// Output lines on one gpiochip, driven in the order given.
pub struct GpioLines {
    request: Request,
    offsets: Vec<u32>,
}

impl GpioLines {
    pub fn new<P: AsRef<Path>>(chip: P, offsets: &[u32]) -> Result<Self> {
        let request = Request::builder()
            .on_chip(chip.as_ref())
            .with_lines(offsets)
            .as_output(Value::Inactive)
            .request()?;
        Ok(Self {
            request,
            offsets: offsets.to_vec(),
        })
    }

    /// Filter select A and B.
    pub fn filter_bank(board: &Board) -> Result<Self> {
        Self::new(&board.chip, &[board.lines.filter_a, board.lines.filter_b])
    }

    pub fn rf_switch(board: &Board) -> Result<Self> {
        Self::new(&board.chip, &[board.lines.rf_switch])
    }
}

impl OutputLines for GpioLines {
    fn set_values(&mut self, values: &[bool]) -> Result<()> {
        for (&offset, &value) in self.offsets.iter().zip(values) {
            self.request.set_value(offset, level(value))?;
        }
        Ok(())
    }
}

/// ADF4351 bus: each word goes out MSB first and is latched by a pulse on LE.
pub struct SpiSink {
    spi: Spidev,
    le: Request,
    le_offset: u32,
    delay: StdDelay,
}

impl SpiSink {
    pub fn new(spi: Spidev, board: &Board) -> Result<Self> {
        let le_offset = board.lines.le;
        let le = Request::builder()
            .on_chip(&board.chip)
            .with_line(le_offset)
            .as_output(Value::Inactive)
            .request()?;
        Ok(Self {
            spi,
            le,
            le_offset,
            delay: StdDelay,
        })
    }

    pub fn open(board: &Board) -> Result<Self> {
        Self::new(crate::open(&board.spi)?, board)
    }
}

impl RegisterSink for SpiSink {
    fn write_word(&mut self, word: u32) -> Result<()> {
        trace!("ADF4351 <- 0x{:08X}", word);
        self.le.set_value(self.le_offset, Value::Inactive)?;
        self.spi.write_all(&word.to_be_bytes())?;
        self.le.set_value(self.le_offset, Value::Active)?;
        self.delay.delay_us(5);
        self.le.set_value(self.le_offset, Value::Inactive)?;
        Ok(())
    }
}
