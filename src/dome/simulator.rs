//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Simulated dome controller.
//!

use crate::dome::transport::{Transport, RESPONSE_END_CHAR};
use crate::dome::DomeError;

/// Status polls it takes a simulated move to finish.
const MOVE_POLLS: u32 = 3;

#[derive(Copy, Clone, PartialEq)]
enum SimShutter {
    Open,
    Closed,
    Opening,
    Closing
}

impl SimShutter {
    fn code(self) -> u32 {
        match self {
            SimShutter::Open => 0,
            SimShutter::Closed => 1,
            SimShutter::Opening => 2,
            SimShutter::Closing => 3
        }
    }
}

/// In-memory stand-in for the controller; answers the same command set over
/// the [`Transport`] interface and models motion as a fixed number of status
/// polls.
pub struct SimulatedBeaver {
    command: Vec<u8>,
    response: Vec<u8>,
    az: f64,
    target_az: f64,
    home_az: f64,
    park_az: f64,
    move_polls_left: u32,
    shutter: SimShutter,
    shutter_polls_left: u32,
    cal_polls_left: u32,
    raining: bool,
    shutter_enabled: bool,
    steps_per_degree: f64,
    min_speed: u32,
    max_speed: u32,
    acceleration: u32,
    safe_voltage: f64
}

impl SimulatedBeaver {
    pub fn new() -> SimulatedBeaver {
        SimulatedBeaver{
            command: vec![],
            response: vec![],
            az: 90.0,
            target_az: 90.0,
            home_az: 0.0,
            park_az: 90.0,
            move_polls_left: 0,
            shutter: SimShutter::Closed,
            shutter_polls_left: 0,
            cal_polls_left: 0,
            raining: false,
            shutter_enabled: true,
            steps_per_degree: 10.0,
            min_speed: 100,
            max_speed: 800,
            acceleration: 400,
            safe_voltage: 11.0
        }
    }

    pub fn set_raining(&mut self, raining: bool) {
        self.raining = raining;
    }

    fn start_move(&mut self, target: f64) {
        self.target_az = target;
        self.move_polls_left = MOVE_POLLS;
    }

    fn step_motion(&mut self) {
        if self.move_polls_left > 0 {
            self.move_polls_left -= 1;
            if self.move_polls_left == 0 {
                self.az = self.target_az;
            }
        }
    }

    fn status_word(&self) -> u32 {
        let mut word = 0;
        if self.move_polls_left > 0 { word |= 0x0001; }
        if self.shutter_polls_left > 0 { word |= 0x0002; }
        if self.raining { word |= 0x0020; }
        if self.move_polls_left == 0 && (self.az - self.home_az).abs() < 1.0 { word |= 0x0080; }
        if self.move_polls_left == 0 && (self.az - self.park_az).abs() < 1.0 { word |= 0x0100; }
        word |= self.shutter.code() << 9;
        word
    }

    fn reply(&mut self, verb: &str, value: String) {
        self.response = format!("{}:{}", verb, value).into_bytes();
        self.response.push(RESPONSE_END_CHAR);
    }

    fn reply_ok(&mut self, verb: &str) {
        self.reply(verb, "0".to_string());
    }

    fn handle(&mut self, command: &str) {
        let command = command.trim_matches(|c| c == '!' || c == '#').trim();

        // relayed shutter commands arrive quoted
        if let Some(inner) = command.strip_prefix("dome sendtoshutter ") {
            let inner = inner.trim_matches('"').to_string();
            self.handle_shutter_side(&inner);
            return;
        }

        let words: Vec<&str> = command.split_whitespace().collect();
        let arg = |i: usize| words.get(i).and_then(|w| w.parse::<f64>().ok()).unwrap_or(0.0);

        match (words.get(0).copied(), words.get(1).copied()) {
            (Some("seletek"), Some("version")) => self.reply("version", "1221".to_string()),
            (Some("seletek"), Some("savefs")) => self.reply_ok("savefs"),

            (Some("dome"), Some("getaz")) => {
                let az = self.az;
                self.reply("getaz", format!("{:.2}", az));
            },
            (Some("dome"), Some("setaz")) => {
                self.az = arg(2);
                self.reply_ok("setaz");
            },
            (Some("dome"), Some("gotoaz")) => {
                self.start_move(arg(2));
                self.reply_ok("gotoaz");
            },
            (Some("dome"), Some("gohome")) => {
                let home_az = self.home_az;
                self.start_move(home_az);
                self.reply_ok("gohome");
            },
            (Some("dome"), Some("gopark")) => {
                let park_az = self.park_az;
                self.start_move(park_az);
                self.reply_ok("gopark");
            },
            (Some("dome"), Some("status")) => {
                self.step_motion();
                let word = self.status_word();
                self.reply("status", word.to_string());
            },
            (Some("dome"), Some("athome")) => {
                let at_home = self.move_polls_left == 0 && (self.az - self.home_az).abs() < 1.0;
                self.reply("athome", (at_home as u32).to_string());
            },
            (Some("dome"), Some("abort")) => {
                self.move_polls_left = 0;
                self.shutter_polls_left = 0;
                self.cal_polls_left = 0;
                self.reply_ok("abort");
            },
            (Some("dome"), Some("openshutter")) => {
                self.shutter = SimShutter::Opening;
                self.shutter_polls_left = MOVE_POLLS;
                self.reply_ok("openshutter");
            },
            (Some("dome"), Some("closeshutter")) => {
                self.shutter = SimShutter::Closing;
                self.shutter_polls_left = MOVE_POLLS;
                self.reply_ok("closeshutter");
            },
            (Some("dome"), Some("shutterstatus")) => {
                if self.shutter_polls_left > 0 {
                    self.shutter_polls_left -= 1;
                    if self.shutter_polls_left == 0 {
                        self.shutter = match self.shutter {
                            SimShutter::Opening => SimShutter::Open,
                            SimShutter::Closing => SimShutter::Closed,
                            other => other
                        };
                    }
                }
                let code = self.shutter.code();
                self.reply("shutterstatus", code.to_string());
            },
            (Some("dome"), Some("getshutterenable")) => {
                let enabled = self.shutter_enabled as u32;
                self.reply("getshutterenable", enabled.to_string());
            },
            (Some("dome"), Some("setshutterenable")) => {
                self.shutter_enabled = arg(2) != 0.0;
                self.reply_ok("setshutterenable");
            },
            (Some("dome"), Some("autocalshutter")) => {
                self.cal_polls_left = MOVE_POLLS;
                self.reply_ok("autocalshutter");
            },
            (Some("dome"), Some("getshutterminspeed")) => {
                let v = self.min_speed;
                self.reply("getshutterminspeed", v.to_string());
            },
            (Some("dome"), Some("getshuttermaxspeed")) => {
                let v = self.max_speed;
                self.reply("getshuttermaxspeed", v.to_string());
            },
            (Some("dome"), Some("getshutteracceleration")) => {
                let v = self.acceleration;
                self.reply("getshutteracceleration", v.to_string());
            },
            (Some("dome"), Some(verb)) if verb.starts_with("setshutter") => {
                let verb = verb.to_string();
                self.reply_ok(&verb);
            },

            (Some("domerot"), Some("gethome")) => {
                let az = self.home_az;
                self.reply("gethome", format!("{:.2}", az));
            },
            (Some("domerot"), Some("sethome")) => {
                self.home_az = arg(2);
                self.reply_ok("sethome");
            },
            (Some("domerot"), Some("getpark")) => {
                let az = self.park_az;
                self.reply("getpark", format!("{:.2}", az));
            },
            (Some("domerot"), Some("setpark")) => {
                self.park_az = arg(2);
                self.reply_ok("setpark");
            },
            (Some("domerot"), Some("calibrate")) => {
                self.cal_polls_left = MOVE_POLLS;
                self.reply_ok("calibrate");
            },
            (Some("domerot"), Some("getcalibrationstatus")) => {
                if self.cal_polls_left > 0 { self.cal_polls_left -= 1; }
                let in_progress = (self.cal_polls_left > 0) as u32;
                self.reply("getcalibrationstatus", in_progress.to_string());
            },
            (Some("domerot"), Some("getstepsperdegree")) => {
                let v = self.steps_per_degree;
                self.reply("getstepsperdegree", format!("{:.4}", v));
            },
            (Some("domerot"), Some("setstepsperdegree")) => {
                self.steps_per_degree = arg(2);
                self.reply_ok("setstepsperdegree");
            },
            (Some("domerot"), Some("getminspeed")) => {
                let v = self.min_speed;
                self.reply("getminspeed", v.to_string());
            },
            (Some("domerot"), Some("getmaxspeed")) => {
                let v = self.max_speed;
                self.reply("getmaxspeed", v.to_string());
            },
            (Some("domerot"), Some("getacceleration")) => {
                let v = self.acceleration;
                self.reply("getacceleration", v.to_string());
            },
            (Some("domerot"), Some(verb)) if verb.starts_with("set") => {
                let verb = verb.to_string();
                self.reply_ok(&verb);
            },

            _ => self.reply("error", "unknown command".to_string())
        }
    }

    fn handle_shutter_side(&mut self, inner: &str) {
        let words: Vec<&str> = inner.split_whitespace().collect();
        match (words.get(0).copied(), words.get(1).copied()) {
            (Some("seletek"), Some("version")) => self.reply("version", "1110".to_string()),
            (Some("shutter"), Some("getvoltage")) => self.reply("getvoltage", "12.40".to_string()),
            (Some("shutter"), Some("getsafevoltage")) => {
                let v = self.safe_voltage;
                self.reply("getsafevoltage", format!("{:.2}", v));
            },
            (Some("shutter"), Some("setsafevoltage")) => {
                self.safe_voltage = words.get(2)
                    .and_then(|w| w.parse::<f64>().ok())
                    .unwrap_or(self.safe_voltage);
                self.reply_ok("setsafevoltage");
            },
            (Some("shutter"), Some("getcalibrationstatus")) => {
                if self.cal_polls_left > 0 { self.cal_polls_left -= 1; }
                let in_progress = (self.cal_polls_left > 0) as u32;
                self.reply("getcalibrationstatus", in_progress.to_string());
            },
            _ => self.reply("error", "unknown command".to_string())
        }
    }
}

impl Transport for SimulatedBeaver {
    fn purge(&mut self) -> Result<(), DomeError> {
        self.command.clear();
        self.response.clear();
        Ok(())
    }

    fn bytes_waiting(&mut self) -> Result<usize, DomeError> {
        Ok(self.response.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DomeError> {
        let n = buf.len().min(self.response.len());
        buf[..n].copy_from_slice(&self.response[..n]);
        self.response.drain(..n);
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), DomeError> {
        for &byte in data {
            self.command.push(byte);
            if byte == RESPONSE_END_CHAR {
                let command = String::from_utf8_lossy(&self.command).into_owned();
                self.command.clear();
                self.handle(&command);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DomeError> {
        Ok(())
    }
}
