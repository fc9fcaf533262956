// Programs the ADF4351 on the tuner board to one frequency and routes the
// filter bank for it.
use anyhow::{ensure, Context, Result};
use autotm::{
    config::Config,
    filter::FilterBank,
    linux::{GpioLines, SpiSink},
    registers::OutputPower,
    synth::Adf4351,
    Hz,
};
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Set the tuner synthesizer output frequency")]
struct Args {
    /// Output frequency in Hz
    #[arg(short, long)]
    frequency: Hz,
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    spi: Option<String>,
    #[arg(long)]
    chip: Option<String>,
    /// Load enable line offset
    #[arg(long)]
    le: Option<u32>,
    /// Reference oscillator in Hz
    #[arg(short, long)]
    reference: Option<Hz>,
    /// Channel step in Hz
    #[arg(long)]
    step: Option<Hz>,
    /// Output power, 0 (-4 dBm) to 3 (+5 dBm)
    #[arg(short, long)]
    power: Option<u8>,
    /// Print the register words without touching the hardware
    #[arg(short, long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Loading config")?,
        None => Config::default(),
    };
    if let Some(spi) = args.spi {
        config.board.spi = spi;
    }
    if let Some(chip) = args.chip {
        config.board.chip = chip;
    }
    if let Some(le) = args.le {
        config.board.lines.le = le;
    }

    let mut settings = config.synthesizer.clone();
    if let Some(reference) = args.reference {
        settings.set_reference_frequency(reference)?;
    }
    if let Some(step) = args.step {
        settings.set_channel_step(step)?;
    }
    if let Some(power) = args.power {
        ensure!(power <= 3, "Output power {} out of range 0..3", power);
        settings.power = OutputPower::try_from(power).context("Output power")?;
    }

    let solution = settings
        .solve(args.frequency)
        .with_context(|| format!("Can't synthesize {} Hz", args.frequency))?;
    println!(
        "INT {} FRAC {} MOD {} RF divider {} -> {} Hz",
        solution.int,
        solution.frac,
        solution.modulus,
        solution.divider.ratio(),
        solution.achieved
    );
    for (n, word) in settings.registers(&solution).words().iter().enumerate() {
        println!("R{}: 0x{:08X}", 5 - n, word);
    }
    if args.dry_run {
        return Ok(());
    }

    let board = &config.board;
    let lines = GpioLines::filter_bank(board).context("Requesting filter lines")?;
    let mut filters = FilterBank::new(config.filters.clone(), Box::new(lines));
    filters.select(args.frequency)?;

    let sink = SpiSink::open(board).context("Opening synthesizer bus")?;
    let mut adf = Adf4351::new(settings, sink);
    adf.program(args.frequency, solution)?;
    info!("Programmed {} Hz", args.frequency);
    Ok(())
}
