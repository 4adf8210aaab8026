//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Entry point.
//!

use beaverctl::args::{self, Command};
use beaverctl::config::Configuration;
use beaverctl::dome::beaver::Beaver;
use beaverctl::dome::rain::{NullRainSink, RainStatusFile, RainStatusSink};
use beaverctl::dome::{connect_to_dome, DomeConnection, DomeError, RainAction};
use std::time::Duration;

const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

/// Pause between completion polls of a long-running operation.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn main() {
    let parsed = match args::parse_command_line(std::env::args()) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{}", message);
            args::print_usage();
            std::process::exit(1);
        }
    };

    match set_up_logging(parsed.logging) {
        Ok(Some(log_path)) => println!("Logging to: {}", log_path.to_string_lossy()),
        Ok(None) => (),
        Err(e) => eprintln!("Error initializing logging: {}.", e)
    }

    log::info!(
        "beaverctl v{} on {}, {}",
        VERSION_STRING,
        os_info::get(),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );

    let configuration = Configuration::load();

    let connection = if parsed.simulator {
        DomeConnection::Simulator
    } else {
        match parsed.device.clone().or_else(|| configuration.device()) {
            Some(device) => DomeConnection::Serial{ device },
            None => {
                eprintln!("No serial device given; use --device or the configuration file.");
                std::process::exit(1);
            }
        }
    };

    let rain_sink: Box<dyn RainStatusSink> = match configuration.rain_status_file() {
        Some(path) => Box::new(RainStatusFile::new(path)),
        None => Box::new(NullRainSink)
    };

    let mut dome = match connect_to_dome(connection, rain_sink) {
        Ok(dome) => dome,
        Err(e) => {
            eprintln!("Failed to connect to the dome controller: {}.", e);
            std::process::exit(1);
        }
    };
    dome.set_home_on_park(configuration.home_on_park());
    dome.set_home_on_unpark(configuration.home_on_unpark());
    dome.set_rain_action(parsed.rain_action.unwrap_or_else(|| configuration.rain_action()));

    let result = run_command(&mut dome, parsed.command.unwrap_or(Command::Status));
    dome.disconnect();

    if let Err(e) = result {
        eprintln!("Error: {}.", e);
        std::process::exit(1);
    }
}

fn set_up_logging(enabled: bool) -> Result<Option<std::path::PathBuf>, Box<dyn std::error::Error>> {
    if !enabled { return Ok(None); }

    let mut log_path = match dirs::data_dir() {
        Some(dir) => dir,
        None => std::env::temp_dir()
    };
    log_path.push(format!(
        "beaverctl_{}.log",
        chrono::Local::now().format("%Y-%m-%d_%H%M%S")
    ));

    let tz_offset = chrono::Local::now().offset().clone();
    simplelog::WriteLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::ConfigBuilder::new()
            .set_target_level(simplelog::LevelFilter::Error)
            .set_time_offset(time::UtcOffset::from_whole_seconds(tz_offset.local_minus_utc())?)
            .set_time_format_custom(simplelog::format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
            ))
            .build(),
        std::fs::File::create(&log_path)?
    )?;

    Ok(Some(log_path))
}

fn run_command(dome: &mut Beaver, command: Command) -> Result<(), DomeError> {
    match command {
        Command::Status => print_status(dome),

        Command::Goto(azimuth) => {
            dome.goto_azimuth(azimuth)?;
            wait_until(dome, "slew", Beaver::is_goto_complete)?;
            println!("Dome at {:.2}°.", dome.azimuth()?);
            Ok(())
        },

        Command::Sync(azimuth) => {
            dome.sync_azimuth(azimuth)?;
            println!("Position synced to {:.2}°.", azimuth);
            Ok(())
        },

        Command::Home => {
            dome.go_home()?;
            wait_until(dome, "home search", Beaver::is_find_home_complete)?;
            println!("Dome homed.");
            Ok(())
        },

        Command::Park => {
            dome.park()?;
            wait_until(dome, "park", Beaver::is_park_complete)?;
            println!("Dome parked.");
            Ok(())
        },

        Command::Unpark => {
            dome.unpark()?;
            wait_until(dome, "unpark", Beaver::is_unpark_complete)?;
            println!("Dome unparked.");
            Ok(())
        },

        Command::OpenShutter => {
            dome.open_shutter()?;
            wait_until(dome, "shutter opening", Beaver::is_open_complete)?;
            println!("Shutter open.");
            Ok(())
        },

        Command::CloseShutter => {
            dome.close_shutter()?;
            wait_until(dome, "shutter closing", Beaver::is_close_complete)?;
            println!("Shutter closed.");
            Ok(())
        },

        Command::CalibrateRotation => {
            dome.calibrate_rotation()?;
            wait_until(dome, "rotation calibration", Beaver::is_rotation_calibration_complete)?;
            println!("Rotation calibrated; {:.0} steps per revolution.", dome.steps_per_revolution()?);
            Ok(())
        },

        Command::CalibrateShutter => {
            dome.calibrate_shutter()?;
            wait_until(dome, "shutter calibration", Beaver::is_shutter_calibration_complete)?;
            println!("Shutter calibrated.");
            Ok(())
        },

        Command::Abort => {
            dome.abort()?;
            println!("All motion stopped.");
            Ok(())
        },

        Command::Watch => watch(dome)
    }
}

/// Polls `is_complete` until the operation finishes or fails.
fn wait_until(
    dome: &mut Beaver,
    operation: &str,
    is_complete: fn(&mut Beaver) -> Result<bool, DomeError>
) -> Result<(), DomeError> {
    loop {
        if is_complete(dome)? { return Ok(()); }
        log::info!("{} in progress, azimuth {:.2}°", operation, dome.azimuth()?);
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn print_status(dome: &mut Beaver) -> Result<(), DomeError> {
    let status = dome.status()?;
    let azimuth = dome.azimuth()?;

    println!("Firmware:      {}", dome.firmware_version());
    println!("Azimuth:       {:.2}°", azimuth);
    println!("Dome moving:   {}", if status.dome_moving { "yes" } else { "no" });
    println!("At home:       {}", if status.at_home { "yes" } else { "no" });
    println!("At park:       {}", if status.at_park { "yes" } else { "no" });
    println!("Raining:       {}", if status.raining { "YES" } else { "no" });
    if dome.shutter_present() {
        println!("Shutter:       {}", status.shutter_state);
        if let Ok(voltage) = dome.battery_voltage() {
            println!("Battery:       {:.2} V", voltage);
        }
    } else {
        println!("Shutter:       not present");
    }
    if status.dome_mech_error || status.shutter_mech_error {
        println!("MECHANICAL ERROR reported by the controller");
    }
    if status.shutter_comm_error {
        println!("Shutter communication error reported by the controller");
    }

    Ok(())
}

/// Periodically refreshes the status and reacts to rain according to the
/// configured policy. Runs until interrupted.
fn watch(dome: &mut Beaver) -> Result<(), DomeError> {
    let mut rain_handled = false;

    loop {
        let status = dome.status()?;
        let _ = dome.azimuth()?; // drives the periodic rain status persistence

        if status.raining && !rain_handled {
            log::warn!("rain detected");
            match dome.rain_action() {
                RainAction::DoNothing => (),

                RainAction::Home => {
                    dome.go_home()?;
                    wait_until(dome, "home search", Beaver::is_find_home_complete)?;
                },

                RainAction::Park => {
                    dome.close_shutter()?;
                    wait_until(dome, "shutter closing", Beaver::is_close_complete)?;
                    dome.park()?;
                    wait_until(dome, "park", Beaver::is_park_complete)?;
                }
            }
            rain_handled = true;
        } else if !status.raining {
            rain_handled = false;
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}
