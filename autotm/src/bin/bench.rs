// Serves the tuner line protocol on a UDP port, driving the simulated bench.
// One command per line, every reply line goes back to the sender.
use anyhow::{Context, Result};
use autotm::{
    command::{self, Reply},
    config::Config,
    sim,
    telemetry::Report,
};
use clap::Parser;
use log::{info, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use mio_signals::{Signal, Signals};
use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

/// Sends every reply as its own line. A failed send is logged and skipped,
/// returns how many went out.
fn send_replies(socket: &UdpSocket, replies: &[Reply], dest: SocketAddr) -> usize {
    let mut sent = 0;
    for reply in replies {
        match socket.send_to(format!("{reply}\n").as_bytes(), dest) {
            Ok(_) => sent += 1,
            Err(e) => warn!("Reply to {} failed: {}", dest, e),
        }
    }
    sent
}

#[derive(Parser, Debug)]
#[command(about = "Tune and match command server on a simulated bench")]
struct Args {
    #[arg(short, long, default_value = "10020")]
    port: u16,
    /// Where to send a CBOR report of every command
    #[arg(short, long)]
    telemetry: Option<SocketAddr>,
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path).context("Loading config")?,
        None => Config::default(),
    };
    let bench = sim::Bench::new(sim::Surface::default());
    let mut tuner = bench.tuner(&config)?;

    let telemetry = match args.telemetry {
        Some(dest) => {
            let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            socket.connect(dest)?;
            Some(socket)
        }
        None => None,
    };

    let mut poll = Poll::new()?;
    let registry = poll.registry();
    let mut events = Events::with_capacity(128);

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), args.port);
    let mut commands = UdpSocket::bind(addr)?;
    const COMMANDS: Token = Token(0);
    registry.register(&mut commands, COMMANDS, Interest::READABLE)?;

    const SIGINT: Token = Token(1);
    let mut signals = Signals::new(Signal::Interrupt.into())?;
    registry.register(&mut signals, SIGINT, Interest::READABLE)?;

    info!("Listening on {}", addr);
    let mut buf = [0; 2048];
    'outer: loop {
        poll.poll(&mut events, None)?;
        for event in events.iter() {
            match event.token() {
                COMMANDS => loop {
                    let (amt, src) = match commands.recv_from(&mut buf) {
                        Ok(v) => v,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e).context("Command socket read failed"),
                    };
                    let text = String::from_utf8_lossy(&buf[..amt]).into_owned();
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        let execution = command::handle_line(&mut tuner, line);
                        send_replies(&commands, &execution.replies, src);
                        if let Some(socket) = &telemetry {
                            if let Err(e) = Report::new(line, &execution).send(socket) {
                                warn!("Telemetry failed: {}", e);
                            }
                        }
                    }
                },
                SIGINT => break 'outer,
                _ => unreachable!(),
            }
        }
    }

    info!("Shutting down");
    Ok(())
}
