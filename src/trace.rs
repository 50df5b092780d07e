//! Recorded trap traces.
//!
//! A trace is a text file with one event per line, replayed against a
//! [`Platform`] in order. Numbers are decimal or `0x` hex. Anything after `#`
//! is a comment.
//!
//! ```text
//! in     <port> <width> [vcpu]
//! out    <port> <width> <value> [vcpu]
//! rd     <addr> <width> [vcpu]
//! wr     <addr> <width> <value> [vcpu]
//! tick   <pit-clocks>
//! second [count]
//! ack    [vcpu]
//! exc    <vector> [error-code] [vcpu] [rip] [cr3]
//! ```
//!
//! Widths are 1, 2 or 4 bytes.

use std::fmt;

use thiserror::Error;

use crate::devices::{AccessWidth, IoRequest, MmioRequest};
use crate::platform::Platform;
use crate::recovery::{ErrorContext, ExceptionInfo};

/// A malformed trace line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("trace line {line}: {reason}")]
pub struct TraceError {
    pub line: usize,
    pub reason: String,
}

/// One replayable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    In {
        port: u16,
        width: AccessWidth,
        vcpu: usize,
    },
    Out {
        port: u16,
        width: AccessWidth,
        value: u32,
        vcpu: usize,
    },
    Read {
        addr: u64,
        width: AccessWidth,
        vcpu: usize,
    },
    Write {
        addr: u64,
        width: AccessWidth,
        value: u32,
        vcpu: usize,
    },
    Tick(u64),
    Second(u32),
    Ack {
        vcpu: usize,
    },
    Exception(ExceptionInfo),
}

/// What replaying an event produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Nothing,
    Value(u32),
    /// PIT channel 0 interrupts during a tick.
    Fired(u32),
    Vector(Option<u8>),
    Exception(ErrorContext),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Nothing => Ok(()),
            Outcome::Value(v) => write!(f, "{:#x}", v),
            Outcome::Fired(n) => write!(f, "{} timer interrupt(s)", n),
            Outcome::Vector(Some(v)) => write!(f, "vector {:#04x}", v),
            Outcome::Vector(None) => f.write_str("no interrupt"),
            Outcome::Exception(ctx) => write!(f, "{}", ctx),
        }
    }
}

impl TraceEvent {
    /// Run the event against `platform`.
    pub fn apply(&self, platform: &mut Platform) -> Outcome {
        match *self {
            TraceEvent::In { port, width, vcpu } => platform
                .handle_io(vcpu, &IoRequest::read(port, width))
                .map_or(Outcome::Nothing, Outcome::Value),
            TraceEvent::Out {
                port,
                width,
                value,
                vcpu,
            } => {
                platform.handle_io(vcpu, &IoRequest::write(port, width, value));
                Outcome::Nothing
            }
            TraceEvent::Read { addr, width, vcpu } => platform
                .handle_mmio(vcpu, &MmioRequest::read(addr, width))
                .map_or(Outcome::Nothing, Outcome::Value),
            TraceEvent::Write {
                addr,
                width,
                value,
                vcpu,
            } => {
                platform.handle_mmio(vcpu, &MmioRequest::write(addr, width, value));
                Outcome::Nothing
            }
            TraceEvent::Tick(clocks) => Outcome::Fired(platform.tick(clocks)),
            TraceEvent::Second(count) => {
                for _ in 0..count {
                    platform.tick_second();
                }
                Outcome::Nothing
            }
            TraceEvent::Ack { vcpu } => Outcome::Vector(platform.acknowledge_interrupt(vcpu)),
            TraceEvent::Exception(info) => Outcome::Exception(platform.handle_exception(info)),
        }
    }
}

/// Parse a whole trace.
pub fn parse(input: &str) -> Result<Vec<TraceEvent>, TraceError> {
    let mut events = Vec::new();
    for (index, line) in input.lines().enumerate() {
        let event = parse_line(line).map_err(|reason| TraceError {
            line: index + 1,
            reason,
        })?;
        events.extend(event);
    }
    Ok(events)
}

/// Parse one line; blank and comment-only lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<TraceEvent>, String> {
    let line = line.split('#').next().unwrap_or("");
    let mut fields = line.split_whitespace();
    let Some(op) = fields.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = fields.collect();

    let event = match op {
        "in" => {
            arity(op, &args, 2, 3)?;
            TraceEvent::In {
                port: port(args[0])?,
                width: width(args[1])?,
                vcpu: optional(&args, 2)?.unwrap_or(0) as usize,
            }
        }
        "out" => {
            arity(op, &args, 3, 4)?;
            TraceEvent::Out {
                port: port(args[0])?,
                width: width(args[1])?,
                value: value32(args[2])?,
                vcpu: optional(&args, 3)?.unwrap_or(0) as usize,
            }
        }
        "rd" => {
            arity(op, &args, 2, 3)?;
            TraceEvent::Read {
                addr: number(args[0])?,
                width: width(args[1])?,
                vcpu: optional(&args, 2)?.unwrap_or(0) as usize,
            }
        }
        "wr" => {
            arity(op, &args, 3, 4)?;
            TraceEvent::Write {
                addr: number(args[0])?,
                width: width(args[1])?,
                value: value32(args[2])?,
                vcpu: optional(&args, 3)?.unwrap_or(0) as usize,
            }
        }
        "tick" => {
            arity(op, &args, 1, 1)?;
            TraceEvent::Tick(number(args[0])?)
        }
        "second" => {
            arity(op, &args, 0, 1)?;
            let count = optional(&args, 0)?.unwrap_or(1);
            TraceEvent::Second(u32::try_from(count).map_err(|_| format!("count {} too large", count))?)
        }
        "ack" => {
            arity(op, &args, 0, 1)?;
            TraceEvent::Ack {
                vcpu: optional(&args, 0)?.unwrap_or(0) as usize,
            }
        }
        "exc" => {
            arity(op, &args, 1, 5)?;
            let vector = number(args[0])?;
            if vector > 31 {
                return Err(format!("exception vector {} out of range", vector));
            }
            TraceEvent::Exception(ExceptionInfo {
                vector: vector as u8,
                error_code: args.get(1).map(|s| value32(s)).transpose()?.unwrap_or(0),
                vcpu: optional(&args, 2)?.unwrap_or(0) as u32,
                rip: optional(&args, 3)?.unwrap_or(0),
                cr3: optional(&args, 4)?.unwrap_or(0),
            })
        }
        other => return Err(format!("unknown event {:?}", other)),
    };
    Ok(Some(event))
}

fn arity(op: &str, args: &[&str], min: usize, max: usize) -> Result<(), String> {
    if args.len() < min || args.len() > max {
        return Err(if min == max {
            format!("{} takes {} argument(s), got {}", op, min, args.len())
        } else {
            format!("{} takes {}-{} arguments, got {}", op, min, max, args.len())
        });
    }
    Ok(())
}

fn number(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid number {:?}", s))
}

fn optional(args: &[&str], index: usize) -> Result<Option<u64>, String> {
    args.get(index).map(|s| number(s)).transpose()
}

fn port(s: &str) -> Result<u16, String> {
    let n = number(s)?;
    u16::try_from(n).map_err(|_| format!("port {:#x} out of range", n))
}

fn value32(s: &str) -> Result<u32, String> {
    let n = number(s)?;
    u32::try_from(n).map_err(|_| format!("value {:#x} wider than 32 bits", n))
}

fn width(s: &str) -> Result<AccessWidth, String> {
    let n = number(s)?;
    usize::try_from(n)
        .ok()
        .and_then(AccessWidth::from_len)
        .ok_or_else(|| format!("invalid access width {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformConfig;
    use crate::recovery::{RecoveryAction, VmState};

    #[test]
    fn test_parse_every_event() {
        let trace = "\
# boot probe
in 0x64 1
out 0x70 1 0x0a      # RTC status A
rd 0xfee00020 4 1
wr 0xfec00000 4 0x10
tick 1000
second
second 5
ack
exc 14 0x2 0 0x7c00 0x1000
";
        let events = parse(trace).expect("valid trace");
        assert_eq!(
            events,
            vec![
                TraceEvent::In {
                    port: 0x64,
                    width: AccessWidth::Byte,
                    vcpu: 0
                },
                TraceEvent::Out {
                    port: 0x70,
                    width: AccessWidth::Byte,
                    value: 0x0A,
                    vcpu: 0
                },
                TraceEvent::Read {
                    addr: 0xFEE0_0020,
                    width: AccessWidth::Dword,
                    vcpu: 1
                },
                TraceEvent::Write {
                    addr: 0xFEC0_0000,
                    width: AccessWidth::Dword,
                    value: 0x10,
                    vcpu: 0
                },
                TraceEvent::Tick(1000),
                TraceEvent::Second(1),
                TraceEvent::Second(5),
                TraceEvent::Ack { vcpu: 0 },
                TraceEvent::Exception(ExceptionInfo {
                    vector: 14,
                    error_code: 2,
                    vcpu: 0,
                    rip: 0x7C00,
                    cr3: 0x1000,
                }),
            ]
        );
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse("in 0x60 1\n\nout 0x60 3 0\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.reason.contains("width"), "{}", err.reason);

        let err = parse("jump 0x7c00").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.reason.contains("unknown event"));
    }

    #[test]
    fn test_rejects_bad_arguments() {
        for line in [
            "in 0x10000 1",
            "in 0x60",
            "out 0x60 1",
            "out 0x60 1 0x100000000",
            "tick",
            "tick zz",
            "exc 32",
            "exc",
            "ack 0 1",
        ] {
            assert!(parse_line(line).is_err(), "{:?} should be rejected", line);
        }
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert_eq!(parse_line(""), Ok(None));
        assert_eq!(parse_line("   # nothing here"), Ok(None));
        assert_eq!(parse("\n# a\n\n").expect("empty trace"), vec![]);
    }

    #[test]
    fn test_replay_against_platform() {
        let config = PlatformConfig {
            memory_mb: 2,
            vram_mb: 1,
            rtc_epoch: Some(0),
            ..PlatformConfig::default()
        };
        let mut platform = Platform::new(config).expect("platform builds");
        platform.start();

        let events = parse(
            "out 0x81 1 0x42\n\
             in 0x81 1\n\
             rd 0xfee00030 4\n\
             ack\n\
             exc 13\n",
        )
        .expect("valid trace");
        let outcomes: Vec<Outcome> = events.iter().map(|e| e.apply(&mut platform)).collect();

        assert_eq!(outcomes[0], Outcome::Nothing);
        assert_eq!(outcomes[1], Outcome::Value(0x42));
        assert_eq!(outcomes[2], Outcome::Value(0x0005_0014), "LAPIC version");
        assert_eq!(outcomes[3], Outcome::Vector(None));
        match &outcomes[4] {
            Outcome::Exception(ctx) => assert_eq!(ctx.action, RecoveryAction::PauseVm),
            other => panic!("expected exception outcome, got {:?}", other),
        }
        assert_eq!(platform.state(), VmState::Paused);
        assert_eq!(outcomes[1].to_string(), "0x42");
    }
}
