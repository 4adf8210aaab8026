//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Command-line argument handling.
//!

use crate::dome::RainAction;

mod cmdline {
    /// Enables logging to a file.
    pub const LOG: &str = "log";
    /// Serial device of the controller; overrides the configuration file.
    pub const DEVICE: &str = "device";
    /// Connects to a simulated controller instead of real hardware.
    pub const SIMULATOR: &str = "simulator";
    /// Reaction to rain in `watch` mode; overrides the configuration file.
    pub const RAIN_ACTION: &str = "rain-action";
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    Status,
    Goto(f64),
    Sync(f64),
    Home,
    Park,
    Unpark,
    OpenShutter,
    CloseShutter,
    CalibrateRotation,
    CalibrateShutter,
    Abort,
    Watch
}

pub struct Args {
    pub logging: bool,
    pub device: Option<String>,
    pub simulator: bool,
    pub rain_action: Option<RainAction>,
    pub command: Option<Command>
}

pub fn print_usage() {
    println!(
        r#"Usage: beaverctl [options] <command>

Commands:
  status                  show the dome and shutter state
  goto <azimuth>          rotate the dome to the given azimuth (degrees)
  sync <azimuth>          re-label the current position as the given azimuth
  home                    find the home position
  park | unpark           park or unpark the dome
  open | close            open or close the shutter
  calibrate rotation      run the rotation autocalibration
  calibrate shutter       run the shutter autocalibration
  abort                   stop all motion
  watch                   poll the status and react to rain

Options:
  --{}                   log to a file in the user data directory
  --{} <path>         serial device, e.g. /dev/ttyUSB0
  --{}             use a simulated dome controller
  --{} <action>  one of: donothing, home, park"#,
        cmdline::LOG, cmdline::DEVICE, cmdline::SIMULATOR, cmdline::RAIN_ACTION
    );
}

pub fn parse_command_line<I: Iterator<Item = String>>(mut args: I) -> Result<Args, String> {
    let mut parsed = Args{
        logging: false,
        device: None,
        simulator: false,
        rain_action: None,
        command: None
    };

    let _executable = args.next();
    let mut positional: Vec<String> = vec![];

    while let Some(arg) = args.next() {
        if arg.starts_with("--") {
            let option = &arg[2..];
            match option {
                cmdline::LOG => parsed.logging = true,

                cmdline::SIMULATOR => parsed.simulator = true,

                cmdline::DEVICE => {
                    parsed.device = Some(args.next().ok_or(
                        format!("missing value of option --{}", cmdline::DEVICE)
                    )?);
                },

                cmdline::RAIN_ACTION => {
                    let value = args.next().ok_or(
                        format!("missing value of option --{}", cmdline::RAIN_ACTION)
                    )?;
                    parsed.rain_action = Some(value.parse::<RainAction>().map_err(
                        |_| format!("invalid rain action: {}", value)
                    )?);
                },

                _ => return Err(format!("unknown option: {}", arg))
            }
        } else {
            positional.push(arg);
        }
    }

    parsed.command = parse_command(&positional)?;

    Ok(parsed)
}

fn parse_command(words: &[String]) -> Result<Option<Command>, String> {
    let name = match words.get(0) {
        None => return Ok(None),
        Some(name) => name.as_str()
    };

    let command = match name {
        "status" => Command::Status,
        "goto" => Command::Goto(azimuth_argument(name, words)?),
        "sync" => Command::Sync(azimuth_argument(name, words)?),
        "home" => Command::Home,
        "park" => Command::Park,
        "unpark" => Command::Unpark,
        "open" => Command::OpenShutter,
        "close" => Command::CloseShutter,
        "calibrate" => match words.get(1).map(|w| w.as_str()) {
            Some("rotation") => Command::CalibrateRotation,
            Some("shutter") => Command::CalibrateShutter,
            _ => return Err("expected \"rotation\" or \"shutter\" after \"calibrate\"".to_string())
        },
        "abort" => Command::Abort,
        "watch" => Command::Watch,
        _ => return Err(format!("unknown command: {}", name))
    };

    Ok(Some(command))
}

fn azimuth_argument(command: &str, words: &[String]) -> Result<f64, String> {
    let value = words.get(1).ok_or(format!("missing azimuth after \"{}\"", command))?;
    let azimuth: f64 = value.parse().map_err(|_| format!("invalid azimuth: {}", value))?;
    if !azimuth.is_finite() || azimuth < 0.0 || azimuth >= 360.0 {
        return Err(format!("azimuth out of range [0, 360): {}", value));
    }
    Ok(azimuth)
}
