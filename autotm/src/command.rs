//! Line protocol. One character selects the command, the rest are packed
//! fields split by fixed marker characters:
//!
//! ```text
//! f<start>f<stop>f<step>         frequency sweep, Hz
//! d<MHz>                         automatic tune and match
//! m<t|m><steps>[,<backlash>]     relative stepper move
//! h                              home both axes
//! r<MHz>                         measure reflection
//! v<VT>v<VM>                     set varactor voltages
//! s<MHz>[o<VT>o<VM>]             voltage sweep, automatic or around a preset
//! p<MHz>t<r>,<s>,<b>[,<d>]m<r>,<s>,<b>[,<d>]   position sweep
//! w<p|a>                         RF path switch
//! ?[<id>]                        help
//! ```
//!
//! Every recognised command is acknowledged with `c` before it runs. Failures
//! are reported as `e` lines and never end the session.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::{
    config::Limits,
    sampler::ReflectionSample,
    stepper::AxisId,
    tuner::{AxisReport, PositionWindow, RfPath, Session, Sweep, Tuner},
    Error, Hz, Result,
};

const IDENTIFIERS: &str = "fdmhrvspw?";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    FrequencySweep(Sweep),
    TuneMatch(Hz),
    MoveStepper {
        axis: AxisId,
        steps: i64,
        backlash: i64,
    },
    Home,
    Measure(Hz),
    SetVoltages {
        tuning: f32,
        matching: f32,
    },
    VoltageSweep {
        frequency: Hz,
        preset: Option<(f32, f32)>,
    },
    PositionSweep {
        frequency: Hz,
        tuning: PositionWindow,
        matching: PositionWindow,
    },
    Switch(RfPath),
    Help(Option<char>),
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Parse(msg.into())
}

fn field<T: FromStr>(text: &str, what: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| invalid(format!("Invalid {what}: {text:?}")))
}

/// MHz argument to Hz, checked against the accepted command range.
fn frequency(text: &str, limits: &Limits) -> Result<Hz> {
    let hz = field::<f64>(text, "frequency")? * 1e6;
    if !(hz >= f64::from(limits.min_frequency)) {
        return Err(invalid("Invalid input: frequency too low"));
    }
    if hz > f64::from(limits.max_frequency) {
        return Err(invalid("Invalid input: frequency too high"));
    }
    Ok(hz.round() as Hz)
}

fn window(text: &str) -> Result<PositionWindow> {
    let fields: Vec<&str> = text.split(',').collect();
    let (range, step, backlash, dir) = match fields[..] {
        [r, s, b] => (r, s, b, None),
        [r, s, b, d] => (r, s, b, Some(d)),
        _ => return Err(invalid(format!("Invalid position window: {text:?}"))),
    };
    Ok(PositionWindow {
        range: field(range, "range")?,
        step: field(step, "step size")?,
        backlash: field(backlash, "backlash")?,
        last_direction: dir.map(|d| field(d, "direction")).transpose()?,
    })
}

impl Command {
    pub fn parse(line: &str, limits: &Limits) -> Result<Self> {
        let line = line.trim();
        let mut chars = line.chars();
        let id = chars
            .next()
            .ok_or_else(|| invalid("Empty command"))?;
        let args = chars.as_str();

        Ok(match id {
            'f' => {
                let parts: Vec<&str> = args.split('f').collect();
                let [start, stop, step] = parts[..] else {
                    return Err(invalid("Invalid input for frequency sweep"));
                };
                Self::FrequencySweep(Sweep {
                    start: field(start, "start frequency")?,
                    stop: field(stop, "stop frequency")?,
                    step: field(step, "frequency step")?,
                })
            }
            'd' => Self::TuneMatch(frequency(args, limits)?),
            'm' => {
                let mut rest = args.chars();
                let axis = match rest.next() {
                    Some('t') => AxisId::Tuning,
                    Some('m') => AxisId::Matching,
                    _ => return Err(invalid("Invalid stepper motor")),
                };
                let rest = rest.as_str();
                let (steps, backlash) = rest.split_once(',').unwrap_or((rest, "0"));
                Self::MoveStepper {
                    axis,
                    steps: field(steps, "steps")?,
                    backlash: field(backlash, "backlash")?,
                }
            }
            'h' => Self::Home,
            'r' => Self::Measure(frequency(args, limits)?),
            'v' => {
                let (tuning, matching) = args
                    .split_once('v')
                    .ok_or_else(|| invalid("Invalid input for set voltages command."))?;
                Self::SetVoltages {
                    tuning: field(tuning, "tuning voltage")?,
                    matching: field(matching, "matching voltage")?,
                }
            }
            's' => match args.split_once('o') {
                None => Self::VoltageSweep {
                    frequency: frequency(args, limits)?,
                    preset: None,
                },
                Some((f, voltages)) => {
                    let (vt, vm) = voltages
                        .split_once('o')
                        .ok_or_else(|| invalid("Invalid input for voltage sweep"))?;
                    Self::VoltageSweep {
                        frequency: frequency(f, limits)?,
                        preset: Some((field(vt, "tuning voltage")?, field(vm, "matching voltage")?)),
                    }
                }
            },
            'p' => {
                let (f, rest) = args
                    .split_once('t')
                    .ok_or_else(|| invalid("Invalid input for position sweep"))?;
                let (tuning, matching) = rest
                    .split_once('m')
                    .ok_or_else(|| invalid("Invalid input for position sweep"))?;
                Self::PositionSweep {
                    frequency: frequency(f, limits)?,
                    tuning: window(tuning)?,
                    matching: window(matching)?,
                }
            }
            'w' => match args.trim() {
                "p" => Self::Switch(RfPath::Preamp),
                "a" => Self::Switch(RfPath::Atm),
                _ => return Err(invalid("Invalid switch state")),
            },
            '?' => Self::Help(args.trim().chars().next()),
            _ => return Err(invalid("Unknown command.")),
        })
    }
}

/// One output line.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Confirm,
    Info(String),
    Error(String),
    Point(ReflectionSample),
    /// 0 on the wire when no resonance was found.
    Resonance(Option<Hz>),
    Reflection { reflection: i32, phase: i32 },
    Positions { tuning: i64, matching: i64 },
    Voltages { tuning: f32, matching: f32 },
    PositionOptimum { tuning: AxisReport, matching: AxisReport },
    Text(&'static str),
    Unknown,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirm => write!(f, "c"),
            Self::Info(text) => write!(f, "i{text}"),
            Self::Error(text) => write!(f, "e{text}"),
            Self::Point(s) => write!(f, "f{}r{}p{}", s.frequency, s.reflection, s.phase),
            Self::Resonance(r) => write!(f, "ri{}", r.unwrap_or(0)),
            Self::Reflection { reflection, phase } => write!(f, "r{reflection}p{phase}"),
            Self::Positions { tuning, matching } => write!(f, "p{tuning}m{matching}"),
            Self::Voltages { tuning, matching } => write!(f, "v{tuning:.2}t{matching:.2}"),
            Self::PositionOptimum { tuning, matching } => write!(
                f,
                "z{},{}m{},{}",
                tuning.position, tuning.last_direction, matching.position, matching.last_direction
            ),
            Self::Text(text) => write!(f, "{text}"),
            Self::Unknown => write!(f, "Unknown command."),
        }
    }
}

const HELP: &[(char, &[&str])] = &[
    ('f', &[
        "Frequency sweep command",
        "Syntax: f<start frequency>f<stop frequency>f<frequency step>",
        "Example: f100000000f200000000f50000",
        "This will sweep the frequency from 100 MHz to 200 MHz with a step of 50 kHz",
    ]),
    ('d', &[
        "Tune and Match command",
        "Syntax: d<target frequency in MHz>",
        "Example: d100",
        "This will tune and match to 100 MHz",
    ]),
    ('m', &[
        "Move stepper command",
        "Syntax: m<stepper motor><steps>,<backlash>",
        "Example: mt100,0",
        "This will move the tuning stepper motor 100 steps",
    ]),
    ('h', &[
        "Homing command",
        "Syntax: h",
        "This will home the tuner and matcher",
    ]),
    ('r', &[
        "Measure reflection command",
        "Syntax: r<frequency in MHz>",
        "Example: r100",
        "This will measure the reflection at 100 MHz",
    ]),
    ('v', &[
        "Set voltages command",
        "Syntax: v<VT voltage>v<VM voltage>",
        "Example: v0.5v0.5",
        "This will set the VT and VM voltages to 0.5 V",
    ]),
    ('s', &[
        "Voltage sweep command",
        "Syntax: s<frequency in MHz>[o<VT voltage>o<VM voltage>]",
        "Example: s100",
        "This will return the optimum tuning and matching voltages at 100 MHz",
    ]),
    ('p', &[
        "Position sweep command",
        "Syntax: p<frequency in MHz>t<range>,<step>,<backlash>[,<last direction>]m<range>,<step>,<backlash>[,<last direction>]",
        "Example: p100t200,40,5m2000,500,10",
        "This will search the positions around the current ones at 100 MHz",
    ]),
    ('w', &[
        "Control switch command",
        "Syntax: w<switch state>",
        "Example: wa",
        "Possible switch states:",
        "p: preamp",
        "a: atm system",
    ]),
];

fn help(id: Option<char>, out: &mut Vec<Reply>) {
    match id {
        Some(id) => match HELP.iter().find(|(c, _)| *c == id) {
            Some((_, lines)) => out.extend(lines.iter().copied().map(Reply::Text)),
            None => out.push(Reply::Unknown),
        },
        None => {
            for (_, lines) in HELP {
                out.push(Reply::Text(lines[0]));
            }
        }
    }
}

fn positions(tuner: &Tuner) -> Reply {
    Reply::Positions {
        tuning: tuner.stepper(AxisId::Tuning).position(),
        matching: tuner.stepper(AxisId::Matching).position(),
    }
}

/// Runs `command`, appending its reply lines. Returns the session outcome for
/// commands that move the network.
pub fn execute(tuner: &mut Tuner, command: &Command, out: &mut Vec<Reply>) -> Result<Option<Session>> {
    debug!("Executing {:?}", command);
    let session = match *command {
        Command::FrequencySweep(sweep) => {
            out.push(Reply::Info("Started frequency sweep".into()));
            let found = tuner.locate_with(&sweep, |sample| out.push(Reply::Point(*sample)))?;
            out.push(Reply::Resonance(found));
            Some(tuner.session(None, found))
        }
        Command::TuneMatch(target) => {
            out.push(Reply::Info(format!(
                "Tuning and matching to {} Hz (automatic mode)",
                target
            )));
            let session = tuner.tune_match(target)?;
            out.push(Reply::Resonance(session.resonance));
            Some(session)
        }
        Command::MoveStepper {
            axis,
            steps,
            backlash,
        } => {
            tuner.move_stepper(axis, steps, backlash)?;
            out.push(Reply::Info("Finished moving stepper".into()));
            out.push(positions(tuner));
            Some(tuner.session(None, None))
        }
        Command::Home => {
            out.push(Reply::Info("Homing...".into()));
            tuner.home()?;
            out.push(Reply::Info("Homing finished".into()));
            out.push(positions(tuner));
            Some(tuner.session(None, None))
        }
        Command::Measure(frequency) => {
            out.push(Reply::Info("Measure Reflection".into()));
            let sample = tuner.measure(frequency)?;
            out.push(Reply::Reflection {
                reflection: sample.reflection,
                phase: sample.phase,
            });
            None
        }
        Command::SetVoltages { tuning, matching } => {
            tuner.set_voltages(tuning, matching)?;
            out.push(Reply::Voltages { tuning, matching });
            Some(Session {
                voltages: Some([tuning, matching]),
                ..tuner.session(None, None)
            })
        }
        Command::VoltageSweep { frequency, preset } => {
            let found = match preset {
                None => {
                    out.push(Reply::Info(format!(
                        "Starting automatic voltage sweep at {} Hz",
                        frequency
                    )));
                    tuner.automatic_voltage_sweep(frequency)?
                }
                Some((vt, vm)) => {
                    out.push(Reply::Info(format!(
                        "Starting preset voltage sweep at {} Hz with tuning voltage {:.2} V and matching voltage {:.2} V",
                        frequency, vt, vm
                    )));
                    tuner.preset_voltage_sweep(frequency, vt, vm)?
                }
            };
            if found.is_none() {
                out.push(Reply::Error("No valid voltages found for voltage sweep.".into()));
            }
            let (tuning, matching) = found.unwrap_or((0.0, 0.0));
            out.push(Reply::Voltages { tuning, matching });
            Some(Session {
                target: Some(frequency),
                voltages: Some([tuning, matching]),
                ..tuner.session(None, None)
            })
        }
        Command::PositionSweep {
            frequency,
            tuning,
            matching,
        } => {
            tuner.tune_to(frequency)?;
            out.push(Reply::Info(format!("Position sweep at {} Hz", frequency)));
            tuner.sweep_positions(&tuning, &matching)?;
            let session = tuner.session(Some(frequency), None);
            out.push(Reply::PositionOptimum {
                tuning: session.tuning,
                matching: session.matching,
            });
            Some(session)
        }
        Command::Switch(path) => {
            let text = if tuner.switch_path(path)? {
                format!("Switched to {}", path.name())
            } else {
                format!("Already switched to {}", path.name())
            };
            out.push(Reply::Info(text));
            None
        }
        Command::Help(id) => {
            help(id, out);
            None
        }
    };
    Ok(session)
}

/// Everything one input line produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Execution {
    pub command: Option<Command>,
    pub replies: Vec<Reply>,
    pub session: Option<Session>,
}

/// Parses and runs one line. Never fails: errors end up as reply lines.
pub fn handle_line(tuner: &mut Tuner, line: &str) -> Execution {
    let line = line.trim();
    let mut execution = Execution::default();
    match line.chars().next() {
        Some(id) if IDENTIFIERS.contains(id) => {}
        _ => {
            execution.replies.push(Reply::Unknown);
            return execution;
        }
    }

    execution.replies.push(Reply::Confirm);
    let command = match Command::parse(line, tuner.limits()) {
        Ok(command) => command,
        Err(e) => {
            execution.replies.push(Reply::Error(e.to_string()));
            return execution;
        }
    };
    info!("Command {:?}", command);
    execution.command = Some(command);
    match execute(tuner, &command, &mut execution.replies) {
        Ok(session) => execution.session = session,
        Err(e) => execution.replies.push(Reply::Error(e.to_string())),
    }
    execution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sim::{Bench, Surface};

    fn run(tuner: &mut Tuner, line: &str) -> Vec<String> {
        handle_line(tuner, line)
            .replies
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    fn tuner() -> (Bench, Tuner) {
        let bench = Bench::new(Surface::default());
        let tuner = bench.tuner(&Config::default()).unwrap();
        (bench, tuner)
    }

    #[test]
    fn parse_forms() {
        let limits = Limits::default();
        assert_eq!(
            Command::parse("f100000000f200000000f50000", &limits).unwrap(),
            Command::FrequencySweep(Sweep {
                start: 100_000_000,
                stop: 200_000_000,
                step: 50_000
            })
        );
        assert_eq!(
            Command::parse("d104.1", &limits).unwrap(),
            Command::TuneMatch(104_100_000)
        );
        assert_eq!(
            Command::parse("mt-100,5", &limits).unwrap(),
            Command::MoveStepper {
                axis: AxisId::Tuning,
                steps: -100,
                backlash: 5
            }
        );
        assert_eq!(
            Command::parse("mm250", &limits).unwrap(),
            Command::MoveStepper {
                axis: AxisId::Matching,
                steps: 250,
                backlash: 0
            }
        );
        assert_eq!(
            Command::parse("s100o1.5o2.5", &limits).unwrap(),
            Command::VoltageSweep {
                frequency: 100_000_000,
                preset: Some((1.5, 2.5))
            }
        );
        assert_eq!(
            Command::parse("s120", &limits).unwrap(),
            Command::VoltageSweep {
                frequency: 120_000_000,
                preset: None
            }
        );
        let Command::PositionSweep {
            frequency,
            tuning,
            matching,
        } = Command::parse("p100t200,40,5,-1m2000,500,10", &limits).unwrap()
        else {
            panic!("not a position sweep");
        };
        assert_eq!(frequency, 100_000_000);
        assert_eq!(tuning.last_direction, Some(-1));
        assert_eq!(matching.last_direction, None);
        assert_eq!(matching.step, 500);
        assert_eq!(Command::parse("wa", &limits).unwrap(), Command::Switch(RfPath::Atm));
        assert_eq!(Command::parse("?d", &limits).unwrap(), Command::Help(Some('d')));
    }

    #[test]
    fn frequency_limits() {
        let (_, mut tuner) = tuner();
        assert_eq!(run(&mut tuner, "r10"), ["c", "eInvalid input: frequency too low"]);
        assert_eq!(run(&mut tuner, "d301"), ["c", "eInvalid input: frequency too high"]);
        assert_eq!(run(&mut tuner, "dnan"), ["c", "eInvalid input: frequency too low"]);
    }

    #[test]
    fn unknown_and_malformed() {
        let (_, mut tuner) = tuner();
        assert_eq!(run(&mut tuner, "x12"), ["Unknown command."]);
        assert_eq!(run(&mut tuner, ""), ["Unknown command."]);
        assert_eq!(run(&mut tuner, "mx10"), ["c", "eInvalid stepper motor"]);
        assert_eq!(run(&mut tuner, "v1.5"), ["c", "eInvalid input for set voltages command."]);
        assert_eq!(run(&mut tuner, "wz"), ["c", "eInvalid switch state"]);
    }

    #[test]
    fn synthesizer_error_becomes_reply() {
        let (_, mut tuner) = tuner();
        let replies = run(&mut tuner, "f1000f2000f100");
        assert_eq!(replies[..2], ["c", "iStarted frequency sweep"]);
        assert!(replies[2].starts_with("eFrequency out of range"));
    }

    #[test]
    fn home_and_move() {
        let (_, mut tuner) = tuner();
        assert_eq!(
            run(&mut tuner, "h"),
            ["c", "iHoming...", "iHoming finished", "p10000m10000"]
        );
        assert_eq!(
            run(&mut tuner, "mt100,10"),
            ["c", "iFinished moving stepper", "p10100m10000"]
        );
    }

    #[test]
    fn measure_reply() {
        let (_, mut tuner) = tuner();
        assert_eq!(
            run(&mut tuner, "r100"),
            ["c", "iMeasure Reflection", "r810p1000"]
        );
    }

    #[test]
    fn voltages_reply() {
        let (bench, mut tuner) = tuner();
        let execution = handle_line(&mut tuner, "v1.5v2.25");
        assert_eq!(execution.replies.last().unwrap().to_string(), "v1.50t2.25");
        assert_eq!(execution.session.unwrap().voltages, Some([1.5, 2.25]));
        assert_eq!(bench.state.borrow().voltages, [1.5, 2.25]);
    }

    #[test]
    fn switch_replies() {
        let (_, mut tuner) = tuner();
        assert_eq!(run(&mut tuner, "wa"), ["c", "iAlready switched to atm system"]);
        assert_eq!(run(&mut tuner, "wp"), ["c", "iSwitched to preamp"]);
        assert_eq!(run(&mut tuner, "wp"), ["c", "iAlready switched to preamp"]);
    }

    #[test]
    fn sweep_prints_points() {
        let (_, mut tuner) = tuner();
        let replies = run(&mut tuner, "f99000000f101000000f100000");
        let points = replies.iter().filter(|r| r.starts_with('f')).count();
        assert_eq!(points, 21);
        assert!(replies.contains(&"f100000000r810p1000".to_string()));
        assert_eq!(replies.last().unwrap(), "ri100000000");
    }

    #[test]
    fn tune_match_reply() {
        let (_, mut tuner) = tuner();
        let execution = handle_line(&mut tuner, "d104.1");
        assert_eq!(execution.replies.last().unwrap().to_string(), "ri104100000");
        assert_eq!(execution.session.unwrap().resonance, Some(104_100_000));
        assert_eq!(execution.command, Some(Command::TuneMatch(104_100_000)));
    }

    #[test]
    fn position_sweep_reply() {
        let (_, mut tuner) = tuner();
        let replies = run(&mut tuner, "p100.4t200,40,5m2000,500,10");
        // the matcher already stands at 12000 for the final move
        assert_eq!(replies.last().unwrap(), "z10080,-1m12000,0");
    }

    #[test]
    fn single_point_sweep_clears_direction() {
        let (_, mut tuner) = tuner();
        run(&mut tuner, "mt100,0");
        let replies = run(&mut tuner, "p100t0,1,0m0,1,0");
        assert_eq!(replies.last().unwrap(), "z10100,0m10000,0");
    }

    #[test]
    fn huge_moves_reply_error() {
        let (bench, mut tuner) = tuner();
        for line in [
            "mt9223372036854775807,1",
            "mm-9223372036854775807,-10",
            "p100t9223372036854775807,1,0m0,1,0",
        ] {
            let replies = run(&mut tuner, line);
            assert_eq!(replies[0], "c");
            let last = replies.last().unwrap();
            assert!(last.starts_with("ePosition out of range"), "{line}: {last}");
        }
        let state = bench.state.borrow();
        assert_eq!((state.tuning.travel, state.matching.travel), (0, 0));
    }

    #[test]
    fn resonance_not_found_is_zero() {
        assert_eq!(Reply::Resonance(None).to_string(), "ri0");
    }

    #[test]
    fn help_lines() {
        let (_, mut tuner) = tuner();
        let replies = run(&mut tuner, "?h");
        assert_eq!(replies[..3], ["c", "Homing command", "Syntax: h"]);
        assert_eq!(run(&mut tuner, "?").len(), 1 + HELP.len());
        assert_eq!(run(&mut tuner, "?x"), ["c", "Unknown command."]);
    }
}
