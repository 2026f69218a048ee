//! Text command interface.
//!
//! Token-based line protocol over the debug UART. Every line is
//! answered with `OK\r\n` or `ERR <msg>\r\n`; queries print their
//! payload lines first.

use core::fmt::Write as _;

use heapless::String;

use crate::control::{CommandData, Mode};
use crate::registers::{self, read_register, write_register, RegisterAccess, WriteEffect};

pub const MAX_LINE: usize = 128;
pub const MAX_RESPONSE: usize = 1024;

/// What the transport/ISR glue must do after a successful command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CliAction {
    None,
    /// The command mailbox content changed; republish it.
    CommandUpdate,
    /// Mode switch requested (includes `d stop`).
    ModeRequest(Mode),
    /// `d rezero [pos]`.
    SetOutputPosition(f32),
    /// `d index`.
    RequireReindex,
    /// `conf write` / `conf load`.
    ConfigWrite,
    ConfigLoad,
}

pub struct CliOutput {
    /// Payload lines, each already `\r\n`-terminated; the transport
    /// appends `OK\r\n`.
    pub response: String<MAX_RESPONSE>,
    pub action: CliAction,
}

pub type CliError = String<64>;

fn err(message: &str) -> CliError {
    let mut out = String::new();
    let _ = out.push_str(message);
    out
}

fn parse_f32(token: &str) -> Result<f32, CliError> {
    if token == "nan" {
        return Ok(f32::NAN);
    }
    token.parse::<f32>().map_err(|_| err("invalid number"))
}

/// Optional positional argument: missing tokens become NaN (mode
/// defaults apply downstream).
fn opt_f32(tokens: &[&str], index: usize) -> Result<f32, CliError> {
    match tokens.get(index) {
        Some(token) => parse_f32(token),
        None => Ok(f32::NAN),
    }
}

/// Execute one line against the register file.
pub fn execute(line: &str, access: &mut RegisterAccess) -> Result<CliOutput, CliError> {
    let mut tokens: heapless::Vec<&str, 12> = heapless::Vec::new();
    for token in line.split_whitespace() {
        tokens.push(token).map_err(|_| err("too many tokens"))?;
    }

    let mut output = CliOutput {
        response: String::new(),
        action: CliAction::None,
    };

    match tokens.first() {
        None => Ok(output), // empty line: bare OK
        Some(&"d") => {
            execute_d(&tokens[1..], access, &mut output)?;
            Ok(output)
        }
        Some(&"tel") => {
            execute_tel(&tokens[1..], access, &mut output)?;
            Ok(output)
        }
        Some(&"conf") => {
            execute_conf(&tokens[1..], access, &mut output)?;
            Ok(output)
        }
        Some(_) => Err(err("unknown command")),
    }
}

fn execute_d(
    tokens: &[&str],
    access: &mut RegisterAccess,
    output: &mut CliOutput,
) -> Result<(), CliError> {
    match tokens.first() {
        Some(&"stop") => {
            *access.command = CommandData::default();
            access.command.mode = Mode::Stopped;
            output.action = CliAction::ModeRequest(Mode::Stopped);
            Ok(())
        }
        Some(&"brake") => {
            access.command.mode = Mode::Brake;
            output.action = CliAction::ModeRequest(Mode::Brake);
            Ok(())
        }
        Some(&"pos") => {
            if tokens.len() < 4 {
                return Err(err("usage: d pos <pos> <vel> <max_t> ..."));
            }
            let command = &mut *access.command;
            command.position = parse_f32(tokens[1])?;
            command.velocity = parse_f32(tokens[2])?;
            command.max_torque = parse_f32(tokens[3])?;
            command.kp_scale = opt_f32(tokens, 4)?;
            command.kd_scale = opt_f32(tokens, 5)?;
            command.feedforward_torque = opt_f32(tokens, 6)?;
            command.watchdog_timeout = opt_f32(tokens, 7)?;
            if command.kp_scale.is_nan() {
                command.kp_scale = 1.0;
            }
            if command.kd_scale.is_nan() {
                command.kd_scale = 1.0;
            }
            if command.feedforward_torque.is_nan() {
                command.feedforward_torque = 0.0;
            }
            command.mode = Mode::Position;
            output.action = CliAction::ModeRequest(Mode::Position);
            Ok(())
        }
        Some(&"vel") => {
            if tokens.len() < 3 {
                return Err(err("usage: d vel <vel> <max_t> ..."));
            }
            let command = &mut *access.command;
            command.position = f32::NAN;
            command.velocity = parse_f32(tokens[1])?;
            command.max_torque = parse_f32(tokens[2])?;
            command.feedforward_torque = opt_f32(tokens, 3)?;
            command.watchdog_timeout = opt_f32(tokens, 4)?;
            if command.feedforward_torque.is_nan() {
                command.feedforward_torque = 0.0;
            }
            command.mode = Mode::Velocity;
            output.action = CliAction::ModeRequest(Mode::Velocity);
            Ok(())
        }
        Some(&"tq") => {
            if tokens.len() < 2 {
                return Err(err("usage: d tq <torque> [max_t]"));
            }
            let command = &mut *access.command;
            command.feedforward_torque = parse_f32(tokens[1])?;
            command.max_torque = opt_f32(tokens, 2)?;
            command.mode = Mode::Torque;
            output.action = CliAction::ModeRequest(Mode::Torque);
            Ok(())
        }
        Some(&"rezero") => {
            let position = opt_f32(tokens, 1)?;
            let position = if position.is_nan() { 0.0 } else { position };
            output.action = CliAction::SetOutputPosition(position);
            Ok(())
        }
        Some(&"index") => {
            output.action = CliAction::RequireReindex;
            Ok(())
        }
        Some(&"cal") => {
            access.command.mode = Mode::CalibratingEncoder;
            output.action = CliAction::ModeRequest(Mode::CalibratingEncoder);
            Ok(())
        }
        _ => Err(err("unknown d subcommand")),
    }
}

fn execute_tel(
    tokens: &[&str],
    access: &mut RegisterAccess,
    output: &mut CliOutput,
) -> Result<(), CliError> {
    match tokens.first() {
        Some(&"get") => {
            let name = tokens.get(1).ok_or_else(|| err("usage: tel get <name>"))?;
            if *name == "firmware" {
                let fw = access.firmware;
                let _ = writeln!(
                    output.response,
                    "version {:#06x} family {} rev {} uuid {:08x}{:08x}{:08x}\r",
                    fw.abi_version,
                    fw.hardware_family,
                    fw.hardware_rev,
                    fw.unique_id[0],
                    fw.unique_id[1],
                    fw.unique_id[2],
                );
                return Ok(());
            }
            let addr = registers::lookup_name(name).ok_or_else(|| err("unknown name"))?;
            let (value, _) = read_register(access, addr).map_err(|_| err("read failed"))?;
            if addr == registers::regs::FAULT {
                let code = crate::errors::FaultCode::from_u8(value as u8)
                    .unwrap_or(crate::errors::FaultCode::Success);
                let _ = writeln!(output.response, "{} {} ({})\r", name, value, code.as_str());
            } else {
                let _ = writeln!(output.response, "{} {}\r", name, value);
            }
            Ok(())
        }
        Some(&"list") => {
            for (name, _) in registers::NAME_TABLE.iter() {
                let _ = writeln!(output.response, "{}\r", name);
            }
            Ok(())
        }
        _ => Err(err("unknown tel subcommand")),
    }
}

fn execute_conf(
    tokens: &[&str],
    access: &mut RegisterAccess,
    output: &mut CliOutput,
) -> Result<(), CliError> {
    match tokens.first() {
        Some(&"get") => {
            let name = tokens.get(1).ok_or_else(|| err("usage: conf get <name>"))?;
            let addr = registers::lookup_name(name).ok_or_else(|| err("unknown name"))?;
            let (value, _) = read_register(access, addr).map_err(|_| err("read failed"))?;
            let _ = writeln!(output.response, "{} {}\r", name, value);
            Ok(())
        }
        Some(&"set") => {
            let name = tokens.get(1).ok_or_else(|| err("usage: conf set <name> <value>"))?;
            let value = parse_f32(tokens.get(2).ok_or_else(|| err("missing value"))?)?;
            let addr = registers::lookup_name(name).ok_or_else(|| err("unknown name"))?;
            match write_register(access, addr, value) {
                Ok(WriteEffect::None) => Ok(()),
                Ok(WriteEffect::CommandTouched) | Ok(WriteEffect::ModeRequested(_)) => {
                    output.action = CliAction::CommandUpdate;
                    Ok(())
                }
                Ok(WriteEffect::OutputPositionSet(position)) => {
                    output.action = CliAction::SetOutputPosition(position);
                    Ok(())
                }
                Err(_) => Err(err("read only")),
            }
        }
        Some(&"write") => {
            output.action = CliAction::ConfigWrite;
            Ok(())
        }
        Some(&"load") => {
            output.action = CliAction::ConfigLoad;
            Ok(())
        }
        _ => Err(err("unknown conf subcommand")),
    }
}
