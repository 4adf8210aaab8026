//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Lunatico Beaver dome controller driver.
//!

use crate::dome::position::{normalize_az, within_tolerance, AZ_TOLERANCE_DEG};
use crate::dome::protocol::{
    decode_firmware_version, decode_status, numeric_field, parse_fields, wrap_shutter_command,
    FIELD_SEPARATOR
};
use crate::dome::rain::{RainMonitor, RainState, RainStatusSink};
use crate::dome::transport::{exchange, Sleeper, StdSleeper, Transport, RESPONSE_TIMEOUT};
use crate::dome::{DeviceStatus, DomeError, OperationState, RainAction, ShutterState};

/// Upper bound (in seconds) for one full rotation; passed to homing and
/// calibration commands and programmed into the controller on connect.
const MAX_ROTATION_SECS: u32 = 300;

mod cmd {
    pub const GET_AZ: &str                  = "!dome getaz#";
    pub const STATUS: &str                  = "!dome status#";
    pub const AT_HOME: &str                 = "!dome athome#";
    pub const GO_PARK: &str                 = "!dome gopark#";
    pub const GO_HOME: &str                 = "!dome gohome 300#";
    pub const OPEN_SHUTTER: &str            = "!dome openshutter#";
    pub const CLOSE_SHUTTER: &str           = "!dome closeshutter#";
    pub const SHUTTER_STATUS: &str          = "!dome shutterstatus#";
    pub const ABORT: &str                   = "!dome abort 1 1 1#";
    pub const CALIBRATE_SHUTTER: &str       = "!dome autocalshutter#";
    pub const GET_SHUTTER_ENABLED: &str     = "!dome getshutterenable#";
    pub const GET_SHUTTER_MIN_SPEED: &str   = "!dome getshutterminspeed#";
    pub const GET_SHUTTER_MAX_SPEED: &str   = "!dome getshuttermaxspeed#";
    pub const GET_SHUTTER_ACCEL: &str       = "!dome getshutteracceleration#";
    pub const GET_HOME: &str                = "!domerot gethome#";
    pub const GET_PARK: &str                = "!domerot getpark#";
    pub const CALIBRATE_ROTATION: &str      = "!domerot calibrate 2 300#";
    pub const GET_ROTATION_CAL_STATUS: &str = "!domerot getcalibrationstatus#";
    pub const GET_STEPS_PER_DEGREE: &str    = "!domerot getstepsperdegree#";
    pub const GET_MIN_SPEED: &str           = "!domerot getminspeed#";
    pub const GET_MAX_SPEED: &str           = "!domerot getmaxspeed#";
    pub const GET_ACCEL: &str               = "!domerot getacceleration#";
    pub const VERSION: &str                 = "!seletek version#";
    pub const SAVE_EEPROM: &str             = "!seletek savefs#";

    /// Commands relayed to the shutter over the wireless link.
    pub mod shutter {
        pub const VERSION: &str          = "seletek version";
        pub const GET_VOLTAGE: &str      = "shutter getvoltage";
        pub const GET_SAFE_VOLTAGE: &str = "shutter getsafevoltage";
        pub const GET_CAL_STATUS: &str   = "shutter getcalibrationstatus";
    }
}

pub struct Beaver {
    transport: Option<Box<dyn Transport>>,
    sleeper: Box<dyn Sleeper>,
    firmware_version: String,
    op: OperationState,
    // Retry budgets live outside `op` because home-before-park and
    // home-before-unpark share the homing budget with a standalone find-home.
    goto_retried: bool,
    homing_retried: bool,
    parked: bool,
    homed: bool,
    shutter_opened: bool,
    shutter_enabled: bool,
    shutter_detected: bool,
    home_az: f64,
    park_az: f64,
    current_az: f64,
    current_el: f64,
    target_az: f64,
    home_on_park: bool,
    home_on_unpark: bool,
    rain_action: RainAction,
    rain_state: RainState,
    rain_monitor: RainMonitor
}

impl Beaver {
    pub fn new(rain_sink: Box<dyn RainStatusSink>) -> Beaver {
        Beaver{
            transport: None,
            sleeper: Box::new(StdSleeper),
            firmware_version: String::new(),
            op: OperationState::Idle,
            goto_retried: false,
            homing_retried: false,
            parked: false,
            homed: false,
            shutter_opened: false,
            shutter_enabled: false,
            shutter_detected: false,
            home_az: 0.0,
            park_az: 0.0,
            current_az: 0.0,
            current_el: 0.0,
            target_az: 0.0,
            home_on_park: false,
            home_on_unpark: false,
            rain_action: RainAction::DoNothing,
            rain_state: RainState::Unknown,
            rain_monitor: RainMonitor::new(rain_sink)
        }
    }

    pub fn connect(&mut self, transport: Box<dyn Transport>) -> Result<(), DomeError> {
        self.transport = Some(transport);
        match self.handshake() {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("connection handshake failed: {}", e);
                self.transport = None;
                Err(e)
            }
        }
    }

    fn handshake(&mut self) -> Result<(), DomeError> {
        self.op = OperationState::Idle;
        self.parked = false;
        self.homed = false;

        self.firmware_version =
            self.read_firmware_version().map_err(|_| DomeError::CannotConnect)?;
        log::info!("connected to Beaver controller, firmware {}", self.firmware_version);

        // the dome is assumed to sit at its park position on power-up
        self.park_az = self.query_f64(cmd::GET_PARK)?;
        self.current_az = self.park_az;
        self.home_az = self.query_f64(cmd::GET_HOME)?;

        self.shutter_enabled = self.read_shutter_enabled()?;
        self.shutter_detected = if self.shutter_enabled { self.probe_shutter() } else { false };
        if self.shutter_enabled && !self.shutter_detected {
            log::warn!("shutter is enabled but does not respond");
        }

        self.write_rain_status();
        self.rain_monitor.restart_interval();

        self.set_max_rotation_time(MAX_ROTATION_SECS)?;

        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.transport.is_some() {
            if let Err(e) = self.abort() {
                log::warn!("abort on disconnect failed: {}", e);
            }
            if let Some(transport) = self.transport.as_mut() {
                let _ = transport.purge();
            }
            self.transport = None;
        }
        self.op = OperationState::Idle;
        self.parked = false;
        self.homed = false;
        log::info!("disconnected from the dome controller");
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    pub fn operation_state(&self) -> OperationState {
        self.op
    }

    pub fn is_parked(&self) -> bool { self.parked }

    pub fn is_homed(&self) -> bool { self.homed }

    pub fn rain_state(&self) -> RainState { self.rain_state }

    pub fn rain_action(&self) -> RainAction { self.rain_action }

    pub fn set_rain_action(&mut self, action: RainAction) { self.rain_action = action; }

    pub fn set_home_on_park(&mut self, enabled: bool) { self.home_on_park = enabled; }

    pub fn set_home_on_unpark(&mut self, enabled: bool) { self.home_on_unpark = enabled; }

    pub fn target_azimuth(&self) -> f64 { self.target_az }

    /// Cached elevation; 90° with the shutter open, 0° otherwise.
    pub fn elevation(&self) -> f64 { self.current_el }

    /// Last observed shutter position (updated by the completion polls).
    pub fn shutter_open(&self) -> bool { self.shutter_opened }

    // ---- serial plumbing ----------------------------------------------

    fn command(&mut self, command: &str) -> Result<String, DomeError> {
        let transport = self.transport.as_mut().ok_or(DomeError::NotConnected)?;
        exchange(transport.as_mut(), &*self.sleeper, command, RESPONSE_TIMEOUT)
    }

    fn shutter_command(&mut self, inner: &str) -> Result<String, DomeError> {
        let wrapped = wrap_shutter_command(inner);
        self.command(&wrapped)
    }

    fn query_f64(&mut self, command: &str) -> Result<f64, DomeError> {
        let resp = self.command(command)?;
        let fields = parse_fields(&resp, FIELD_SEPARATOR)?;
        numeric_field::<f64>(&fields, 1)?.ok_or(DomeError::CommandFailed)
    }

    fn query_u32(&mut self, command: &str) -> Result<u32, DomeError> {
        let resp = self.command(command)?;
        let fields = parse_fields(&resp, FIELD_SEPARATOR)?;
        numeric_field::<u32>(&fields, 1)?.ok_or(DomeError::CommandFailed)
    }

    fn shutter_query_f64(&mut self, inner: &str) -> Result<f64, DomeError> {
        let resp = self.shutter_command(inner)?;
        let fields = parse_fields(&resp, FIELD_SEPARATOR)?;
        numeric_field::<f64>(&fields, 1)?.ok_or(DomeError::CommandFailed)
    }

    /// Motion and calibration commands require a live connection and no
    /// calibration in flight.
    fn ensure_can_start(&self) -> Result<(), DomeError> {
        if self.transport.is_none() { return Err(DomeError::NotConnected); }
        if self.calibrating() {
            log::warn!("command refused: calibration in progress");
            return Err(DomeError::CommandFailed);
        }
        Ok(())
    }

    fn calibrating(&self) -> bool {
        matches!(
            self.op,
            OperationState::CalibratingRotation | OperationState::CalibratingShutter
        )
    }

    // ---- status & position --------------------------------------------

    fn read_firmware_version(&mut self) -> Result<String, DomeError> {
        let resp = self.command(cmd::VERSION)?;
        let fields = parse_fields(&resp, FIELD_SEPARATOR)?;
        decode_firmware_version(&fields)
    }

    fn read_status_word(&mut self) -> Result<u32, DomeError> {
        if self.calibrating() { return Ok(0); }
        let word = self.query_u32(cmd::STATUS)?;
        self.rain_state = if decode_status(word).raining {
            RainState::Raining
        } else {
            RainState::NotRaining
        };
        Ok(word)
    }

    /// Reads and decodes the controller's status word. Also refreshes the
    /// cached rain state.
    pub fn status(&mut self) -> Result<DeviceStatus, DomeError> {
        Ok(decode_status(self.read_status_word()?))
    }

    fn dome_moving(&mut self) -> Result<bool, DomeError> {
        Ok(decode_status(self.read_status_word()?).dome_moving)
    }

    fn at_home(&mut self) -> Result<bool, DomeError> {
        let resp = self.command(cmd::AT_HOME)?;
        let fields = parse_fields(&resp, FIELD_SEPARATOR)?;
        Ok(numeric_field::<i32>(&fields, 1)?.unwrap_or(0) == 1)
    }

    /// Reads the current azimuth. Kicks off the periodic rain status
    /// persistence when the check interval has elapsed.
    pub fn azimuth(&mut self) -> Result<f64, DomeError> {
        if self.calibrating() { return Ok(self.current_az); }

        let resp = self.command(cmd::GET_AZ)?;
        let fields = parse_fields(&resp, FIELD_SEPARATOR)?;
        if let Some(az) = numeric_field::<f64>(&fields, 1)? {
            self.current_az = az;
        }

        if self.rain_monitor.check_due() {
            self.write_rain_status();
            self.rain_monitor.restart_interval();
        }

        Ok(self.current_az)
    }

    fn sync_internal(&mut self, az: f64) -> Result<(), DomeError> {
        self.command(&format!("!dome setaz {:.2}#", az))?;
        self.current_az = az;
        Ok(())
    }

    /// Re-labels the current physical position as `az` without moving.
    pub fn sync_azimuth(&mut self, az: f64) -> Result<(), DomeError> {
        self.ensure_can_start()?;
        self.sync_internal(normalize_az(az))
    }

    // ---- goto ---------------------------------------------------------

    pub fn goto_azimuth(&mut self, az: f64) -> Result<(), DomeError> {
        self.ensure_can_start()?;
        let az = normalize_az(az);
        self.command(&format!("!dome gotoaz {:.2}#", az))?;
        self.target_az = az;
        self.goto_retried = false;
        self.op = OperationState::Goto{ target: az };
        Ok(())
    }

    /// Reissues the goto without touching the retry budget.
    fn resend_goto(&mut self, az: f64) -> Result<(), DomeError> {
        self.command(&format!("!dome gotoaz {:.2}#", az)).map(|_| ())
    }

    pub fn is_goto_complete(&mut self) -> Result<bool, DomeError> {
        if self.transport.is_none() { return Err(DomeError::NotConnected); }
        let target = match self.op {
            OperationState::Goto{ target } => target,
            OperationState::Idle => return Ok(true),
            _ => return Ok(false)
        };

        if self.dome_moving()? { return Ok(false); }

        let az = self.azimuth()?;
        if within_tolerance(target, az, AZ_TOLERANCE_DEG) {
            self.goto_retried = false;
            self.op = OperationState::Idle;
            Ok(true)
        } else if !self.goto_retried {
            log::warn!("dome stopped at {:.2}° instead of {:.2}°; retrying goto", az, target);
            self.goto_retried = true;
            self.resend_goto(target)?;
            Ok(false)
        } else {
            self.goto_retried = false;
            self.op = OperationState::Idle;
            Err(DomeError::CommandFailed)
        }
    }

    // ---- find home ----------------------------------------------------

    pub fn go_home(&mut self) -> Result<(), DomeError> {
        self.ensure_can_start()?;
        self.homing_retried = false;
        self.op = OperationState::Homing;
        if self.at_home()? { return Ok(()); }
        self.send_go_home()
    }

    fn send_go_home(&mut self) -> Result<(), DomeError> {
        self.command(cmd::GO_HOME).map(|_| ())
    }

    /// One poll of the home search; shared by find-home, home-before-park
    /// and home-before-unpark.
    fn poll_home_arrival(&mut self) -> Result<bool, DomeError> {
        if self.dome_moving()? { return Ok(false); }

        if self.at_home()? {
            let home_az = self.home_az;
            self.sync_internal(home_az)?;
            self.homed = true;
            self.homing_retried = false;
            Ok(true)
        } else {
            self.parked = false;
            if !self.homing_retried {
                log::warn!("dome stopped without reaching home; retrying home search");
                self.homing_retried = true;
                self.send_go_home()?;
                Ok(false)
            } else {
                self.homing_retried = false;
                Err(DomeError::CommandFailed)
            }
        }
    }

    pub fn is_find_home_complete(&mut self) -> Result<bool, DomeError> {
        if self.transport.is_none() { return Err(DomeError::NotConnected); }
        match self.op {
            OperationState::Homing => (),
            OperationState::Idle => return Ok(true),
            _ => return Ok(false)
        }

        match self.poll_home_arrival() {
            Ok(true) => {
                self.op = OperationState::Idle;
                Ok(true)
            },
            Ok(false) => Ok(false),
            Err(e) => {
                self.op = OperationState::Idle;
                Err(e)
            }
        }
    }

    // ---- park / unpark ------------------------------------------------

    pub fn park(&mut self) -> Result<(), DomeError> {
        self.ensure_can_start()?;
        self.homing_retried = false;
        if self.home_on_park {
            self.op = OperationState::Parking{ via_home: true };
            if !self.at_home()? {
                self.send_go_home()?;
            }
        } else {
            self.op = OperationState::Parking{ via_home: false };
            self.command(cmd::GO_PARK)?;
        }
        Ok(())
    }

    pub fn is_park_complete(&mut self) -> Result<bool, DomeError> {
        if self.transport.is_none() { return Err(DomeError::NotConnected); }
        let via_home = match self.op {
            OperationState::Parking{ via_home } => via_home,
            OperationState::Idle => return Ok(self.parked),
            _ => return Ok(false)
        };

        if self.dome_moving()? {
            let _ = self.azimuth()?;
            return Ok(false);
        }

        if via_home {
            match self.poll_home_arrival() {
                Ok(true) => {
                    // home reached; the actual park move starts now
                    self.op = OperationState::Parking{ via_home: false };
                    self.command(cmd::GO_PARK)?;
                },
                Ok(false) => (),
                Err(e) => {
                    self.op = OperationState::Idle;
                    return Err(e);
                }
            }
            return Ok(false);
        }

        let az = self.azimuth()?;
        if within_tolerance(self.park_az, az, AZ_TOLERANCE_DEG) {
            self.parked = true;
            self.op = OperationState::Idle;
            Ok(true)
        } else {
            self.parked = false;
            self.op = OperationState::Idle;
            Err(DomeError::CommandFailed)
        }
    }

    pub fn unpark(&mut self) -> Result<(), DomeError> {
        self.ensure_can_start()?;
        if self.home_on_unpark {
            self.homing_retried = false;
            self.op = OperationState::Unparking{ via_home: true };
            if !self.at_home()? {
                self.send_go_home()?;
            }
            Ok(())
        } else {
            // no motion involved; the park position is simply re-labeled
            let park_az = self.park_az;
            self.sync_internal(park_az)?;
            self.parked = false;
            self.op = OperationState::Idle;
            Ok(())
        }
    }

    pub fn is_unpark_complete(&mut self) -> Result<bool, DomeError> {
        if self.transport.is_none() { return Err(DomeError::NotConnected); }
        if !self.parked {
            if let OperationState::Unparking{..} = self.op {
                self.op = OperationState::Idle;
            }
            return Ok(true);
        }

        match self.op {
            OperationState::Unparking{ via_home: true } => match self.poll_home_arrival() {
                Ok(complete) => {
                    self.parked = !complete;
                    if complete { self.op = OperationState::Idle; }
                    Ok(complete)
                },
                Err(e) => {
                    self.op = OperationState::Idle;
                    Err(e)
                }
            },
            _ => Ok(false)
        }
    }

    // ---- calibration --------------------------------------------------

    pub fn calibrate_rotation(&mut self) -> Result<(), DomeError> {
        self.ensure_can_start()?;
        self.command(cmd::CALIBRATE_ROTATION)?;
        self.op = OperationState::CalibratingRotation;
        Ok(())
    }

    pub fn is_rotation_calibration_complete(&mut self) -> Result<bool, DomeError> {
        if self.transport.is_none() { return Err(DomeError::NotConnected); }
        match self.op {
            OperationState::CalibratingRotation => (),
            OperationState::Idle => return Ok(true),
            _ => return Ok(false)
        }

        let resp = self.command(cmd::GET_ROTATION_CAL_STATUS)?;
        let fields = parse_fields(&resp, FIELD_SEPARATOR)?;
        match numeric_field::<u32>(&fields, 1)?.unwrap_or(1) {
            0 | 2 => {
                self.op = OperationState::Idle;
                let steps = self.query_f64(cmd::GET_STEPS_PER_DEGREE)?;
                log::info!("rotation calibration finished; {} steps per degree", steps);
                Ok(true)
            },
            1 => Ok(false),
            code => {
                log::error!("unexpected rotation calibration status: {}", code);
                Err(DomeError::CommandFailed)
            }
        }
    }

    pub fn calibrate_shutter(&mut self) -> Result<(), DomeError> {
        self.ensure_can_start()?;
        if !self.shutter_present() { return Ok(()); }
        self.command(cmd::CALIBRATE_SHUTTER)?;
        self.op = OperationState::CalibratingShutter;
        Ok(())
    }

    pub fn is_shutter_calibration_complete(&mut self) -> Result<bool, DomeError> {
        if self.transport.is_none() { return Err(DomeError::NotConnected); }
        match self.op {
            OperationState::CalibratingShutter => (),
            OperationState::Idle => return Ok(true),
            _ => return Ok(false)
        }

        let resp = self.shutter_command(cmd::shutter::GET_CAL_STATUS)?;
        let fields = parse_fields(&resp, FIELD_SEPARATOR)?;
        match numeric_field::<u32>(&fields, 1)?.unwrap_or(1) {
            0 | 2 => {
                self.op = OperationState::Idle;
                Ok(true)
            },
            1 => Ok(false),
            code => {
                log::error!("unexpected shutter calibration status: {}", code);
                Err(DomeError::CommandFailed)
            }
        }
    }

    // ---- abort --------------------------------------------------------

    /// Stops all motion. Local state is reset before talking to the device,
    /// so a failed abort command still leaves the driver idle; retry budgets
    /// are marked spent so no stale operation resumes.
    pub fn abort(&mut self) -> Result<(), DomeError> {
        if self.transport.is_none() { return Err(DomeError::NotConnected); }

        self.parked = false;
        self.op = OperationState::Idle;
        self.goto_retried = true;
        self.homing_retried = true;

        let result = self.command(cmd::ABORT).map(|_| ());

        match self.azimuth() {
            Ok(az) => self.target_az = az,
            Err(e) => log::warn!("failed to re-read azimuth after abort: {}", e)
        }

        result
    }

    // ---- shutter ------------------------------------------------------

    pub fn shutter_present(&self) -> bool {
        self.shutter_enabled && self.shutter_detected
    }

    fn read_shutter_enabled(&mut self) -> Result<bool, DomeError> {
        Ok(self.query_u32(cmd::GET_SHUTTER_ENABLED)? == 1)
    }

    /// Whether the shutter controller answers over the wireless link.
    fn probe_shutter(&mut self) -> bool {
        match self.shutter_command(cmd::shutter::VERSION) {
            Ok(resp) => match parse_fields(&resp, FIELD_SEPARATOR) {
                Ok(fields) => !fields.get(1).map_or(true, |f| f.starts_with("error")),
                Err(_) => false
            },
            Err(e) => {
                log::warn!("shutter version probe failed: {}", e);
                false
            }
        }
    }

    pub fn shutter_enabled(&self) -> bool {
        self.shutter_enabled
    }

    pub fn set_shutter_enabled(&mut self, enabled: bool) -> Result<(), DomeError> {
        self.command(&format!("!dome setshutterenable {}#", enabled as u32))?;
        self.shutter_enabled = enabled;
        self.shutter_detected = if enabled { self.probe_shutter() } else { false };
        Ok(())
    }

    pub fn shutter_state(&mut self) -> Result<ShutterState, DomeError> {
        if !self.shutter_present() { return Ok(ShutterState::Error); }
        let code = self.query_u32(cmd::SHUTTER_STATUS)?;
        Ok(ShutterState::from_code(code))
    }

    pub fn open_shutter(&mut self) -> Result<(), DomeError> {
        self.ensure_can_start()?;
        if !self.shutter_present() { return Ok(()); }
        self.check_battery_before_moving_shutter();
        self.command(cmd::OPEN_SHUTTER).map(|_| ())
    }

    pub fn close_shutter(&mut self) -> Result<(), DomeError> {
        self.ensure_can_start()?;
        if !self.shutter_present() { return Ok(()); }
        self.check_battery_before_moving_shutter();
        self.command(cmd::CLOSE_SHUTTER).map(|_| ())
    }

    /// Advisory only; an unreadable battery voltage does not block the move.
    fn check_battery_before_moving_shutter(&mut self) {
        match self.battery_voltage() {
            Ok(voltage) => log::info!("shutter battery voltage: {:.2} V", voltage),
            Err(e) => log::warn!("could not read shutter battery voltage: {}", e)
        }
    }

    pub fn is_open_complete(&mut self) -> Result<bool, DomeError> {
        if self.transport.is_none() { return Err(DomeError::NotConnected); }
        if !self.shutter_present() { return Ok(true); }

        if self.shutter_state()? == ShutterState::Open {
            self.shutter_opened = true;
            self.current_el = 90.0;
            Ok(true)
        } else {
            self.shutter_opened = false;
            Ok(false)
        }
    }

    pub fn is_close_complete(&mut self) -> Result<bool, DomeError> {
        if self.transport.is_none() { return Err(DomeError::NotConnected); }
        if !self.shutter_present() { return Ok(true); }

        if self.shutter_state()? == ShutterState::Closed {
            self.shutter_opened = false;
            self.current_el = 0.0;
            Ok(true)
        } else {
            self.shutter_opened = true;
            Ok(false)
        }
    }

    pub fn shutter_firmware_version(&mut self) -> Result<String, DomeError> {
        let resp = self.shutter_command(cmd::shutter::VERSION)?;
        let fields = parse_fields(&resp, FIELD_SEPARATOR)?;
        decode_firmware_version(&fields)
    }

    pub fn battery_voltage(&mut self) -> Result<f64, DomeError> {
        self.shutter_query_f64(cmd::shutter::GET_VOLTAGE)
    }

    pub fn safe_voltage(&mut self) -> Result<f64, DomeError> {
        self.shutter_query_f64(cmd::shutter::GET_SAFE_VOLTAGE)
    }

    pub fn set_safe_voltage(&mut self, voltage: f64) -> Result<(), DomeError> {
        let inner = format!("shutter setsafevoltage {:.2}", voltage);
        self.shutter_command(&inner).map(|_| ())
    }

    // ---- rain ---------------------------------------------------------

    /// Samples the rain sensor and persists the state if it changed.
    /// Failures are logged rather than propagated; the next interval will
    /// try again.
    fn write_rain_status(&mut self) {
        match self.read_status_word() {
            Ok(_) => {
                let state = self.rain_state;
                if let Err(e) = self.rain_monitor.persist_if_changed(state) {
                    log::warn!("failed to persist rain state: {}", e);
                }
            },
            Err(e) => log::warn!("failed to read the rain sensor: {}", e)
        }
    }

    // ---- settings -----------------------------------------------------

    pub fn home_azimuth(&mut self) -> Result<f64, DomeError> {
        let az = self.query_f64(cmd::GET_HOME)?;
        self.home_az = az;
        Ok(az)
    }

    pub fn set_home_azimuth(&mut self, az: f64) -> Result<(), DomeError> {
        let az = normalize_az(az);
        self.command(&format!("!domerot sethome {:.2}#", az))?;
        self.home_az = az;
        Ok(())
    }

    pub fn park_azimuth(&mut self) -> Result<f64, DomeError> {
        let az = self.query_f64(cmd::GET_PARK)?;
        self.park_az = az;
        Ok(az)
    }

    pub fn set_park_azimuth(&mut self, az: f64) -> Result<(), DomeError> {
        let az = normalize_az(az);
        self.command(&format!("!domerot setpark {:.2}#", az))?;
        self.park_az = az;
        Ok(())
    }

    pub fn steps_per_revolution(&mut self) -> Result<f64, DomeError> {
        Ok(self.query_f64(cmd::GET_STEPS_PER_DEGREE)? * 360.0)
    }

    pub fn set_steps_per_revolution(&mut self, steps: f64) -> Result<(), DomeError> {
        self.command(&format!("!domerot setstepsperdegree {:.6}#", steps / 360.0)).map(|_| ())
    }

    pub fn rotation_speeds(&mut self) -> Result<(u32, u32, u32), DomeError> {
        Ok((
            self.query_u32(cmd::GET_MIN_SPEED)?,
            self.query_u32(cmd::GET_MAX_SPEED)?,
            self.query_u32(cmd::GET_ACCEL)?
        ))
    }

    pub fn set_rotation_speeds(
        &mut self, min: u32, max: u32, acceleration: u32
    ) -> Result<(), DomeError> {
        self.command(&format!("!domerot setminspeed {}#", min))?;
        self.command(&format!("!domerot setmaxspeed {}#", max))?;
        self.command(&format!("!domerot setacceleration {}#", acceleration))?;
        Ok(())
    }

    pub fn shutter_speeds(&mut self) -> Result<(u32, u32, u32), DomeError> {
        Ok((
            self.query_u32(cmd::GET_SHUTTER_MIN_SPEED)?,
            self.query_u32(cmd::GET_SHUTTER_MAX_SPEED)?,
            self.query_u32(cmd::GET_SHUTTER_ACCEL)?
        ))
    }

    pub fn set_shutter_speeds(
        &mut self, min: u32, max: u32, acceleration: u32
    ) -> Result<(), DomeError> {
        self.command(&format!("!dome setshutterminspeed {}#", min))?;
        self.command(&format!("!dome setshuttermaxspeed {}#", max))?;
        self.command(&format!("!dome setshutteracceleration {}#", acceleration))?;
        Ok(())
    }

    fn set_max_rotation_time(&mut self, seconds: u32) -> Result<(), DomeError> {
        self.command(&format!("!domerot setmaxfullrotsecs {}#", seconds)).map(|_| ())
    }

    /// Persists the controller's settings to its EEPROM.
    pub fn save_settings(&mut self) -> Result<(), DomeError> {
        self.command(cmd::SAVE_EEPROM).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dome::rain::NullRainSink;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Replays canned responses and records every command sent.
    struct ScriptedTransport {
        responses: Rc<RefCell<VecDeque<String>>>,
        sent: Rc<RefCell<Vec<String>>>,
        pending: Vec<u8>
    }

    impl Transport for ScriptedTransport {
        fn purge(&mut self) -> Result<(), DomeError> {
            self.pending.clear();
            Ok(())
        }

        fn bytes_waiting(&mut self) -> Result<usize, DomeError> {
            Ok(self.pending.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, DomeError> {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), DomeError> {
            self.sent.borrow_mut().push(String::from_utf8_lossy(data).into_owned());
            let response = self.responses.borrow_mut().pop_front()
                .unwrap_or_else(|| panic!("no scripted response for {:?}",
                    String::from_utf8_lossy(data)));
            self.pending = response.into_bytes();
            Ok(())
        }

        fn flush(&mut self) -> Result<(), DomeError> { Ok(()) }
    }

    struct Script {
        responses: Rc<RefCell<VecDeque<String>>>,
        sent: Rc<RefCell<Vec<String>>>
    }

    impl Script {
        fn push(&self, response: &str) {
            self.responses.borrow_mut().push_back(response.to_string());
        }

        fn sent(&self) -> Vec<String> {
            self.sent.borrow().clone()
        }

        fn num_sent(&self) -> usize {
            self.sent.borrow().len()
        }
    }

    const HANDSHAKE_WITH_SHUTTER: &[&str] = &[
        "version:1221#",        // firmware
        "getpark:90.00#",
        "gethome:0.00#",
        "getshutterenable:1#",
        "version:1110#",        // shutter probe
        "status:0#",            // rain sample
        "setmaxfullrotsecs:0#"
    ];

    const HANDSHAKE_NO_SHUTTER: &[&str] = &[
        "version:1221#",
        "getpark:90.00#",
        "gethome:0.00#",
        "getshutterenable:0#",
        "status:0#",
        "setmaxfullrotsecs:0#"
    ];

    fn connected(handshake: &[&str], sink: Box<dyn RainStatusSink>) -> (Beaver, Script) {
        let responses = Rc::new(RefCell::new(
            handshake.iter().map(|r| r.to_string()).collect::<VecDeque<String>>()
        ));
        let sent = Rc::new(RefCell::new(vec![]));
        let transport = ScriptedTransport{
            responses: Rc::clone(&responses),
            sent: Rc::clone(&sent),
            pending: vec![]
        };
        let mut beaver = Beaver::new(sink);
        beaver.connect(Box::new(transport)).unwrap();
        (beaver, Script{ responses, sent })
    }

    #[test]
    fn given_successful_handshake_firmware_version_is_decoded() {
        let (beaver, script) = connected(HANDSHAKE_WITH_SHUTTER, Box::new(NullRainSink));
        assert_eq!("2.2.1", beaver.firmware_version());
        assert!(beaver.shutter_present());
        assert_eq!(OperationState::Idle, beaver.operation_state());
        assert_eq!("!seletek version#", script.sent()[0]);
        assert!(script.sent().contains(&"!domerot setmaxfullrotsecs 300#".to_string()));
    }

    #[test]
    fn given_disconnected_driver_operations_fail_with_not_connected() {
        let mut beaver = Beaver::new(Box::new(NullRainSink));
        assert!(matches!(beaver.goto_azimuth(100.0), Err(DomeError::NotConnected)));
        assert!(matches!(beaver.is_goto_complete(), Err(DomeError::NotConnected)));
        assert!(matches!(beaver.abort(), Err(DomeError::NotConnected)));
    }

    #[test]
    fn given_moving_dome_goto_poll_is_incomplete() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        script.push("gotoaz:0#");
        beaver.goto_azimuth(100.0).unwrap();
        script.push("status:1#");
        assert_eq!(false, beaver.is_goto_complete().unwrap());
        assert_eq!(OperationState::Goto{ target: 100.0 }, beaver.operation_state());
    }

    #[test]
    fn given_dome_on_target_goto_poll_completes_and_resets_retry() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        script.push("gotoaz:0#");
        beaver.goto_azimuth(100.0).unwrap();
        assert_eq!("!dome gotoaz 100.00#", script.sent().last().unwrap().as_str());

        script.push("status:0#");
        script.push("getaz:100.00#");
        assert_eq!(true, beaver.is_goto_complete().unwrap());
        assert_eq!(OperationState::Idle, beaver.operation_state());
        assert_eq!(false, beaver.goto_retried);
    }

    #[test]
    fn given_dome_stopped_short_twice_goto_retries_once_then_fails() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        script.push("gotoaz:0#");
        beaver.goto_azimuth(100.0).unwrap();

        // first poll: off target, expect one reissued goto
        script.push("status:0#");
        script.push("getaz:50.00#");
        script.push("gotoaz:0#");
        assert_eq!(false, beaver.is_goto_complete().unwrap());
        let gotos = script.sent().iter().filter(|c| c.starts_with("!dome gotoaz")).count();
        assert_eq!(2, gotos);

        // second poll: still off target, no further retry
        script.push("status:0#");
        script.push("getaz:50.00#");
        assert!(matches!(beaver.is_goto_complete(), Err(DomeError::CommandFailed)));
        assert_eq!(OperationState::Idle, beaver.operation_state());
        let gotos = script.sent().iter().filter(|c| c.starts_with("!dome gotoaz")).count();
        assert_eq!(2, gotos);
    }

    #[test]
    fn given_home_reached_find_home_syncs_to_home_azimuth() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        script.push("athome:0#");
        script.push("gohome:0#");
        beaver.go_home().unwrap();
        assert_eq!(OperationState::Homing, beaver.operation_state());

        script.push("status:0#");
        script.push("athome:1#");
        script.push("setaz:0#");
        assert_eq!(true, beaver.is_find_home_complete().unwrap());
        assert!(beaver.is_homed());
        assert!(script.sent().contains(&"!dome setaz 0.00#".to_string()));
    }

    #[test]
    fn given_home_missed_twice_find_home_retries_once_then_fails() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        script.push("athome:0#");
        script.push("gohome:0#");
        beaver.go_home().unwrap();

        script.push("status:0#");
        script.push("athome:0#");
        script.push("gohome:0#");
        assert_eq!(false, beaver.is_find_home_complete().unwrap());

        script.push("status:0#");
        script.push("athome:0#");
        assert!(matches!(beaver.is_find_home_complete(), Err(DomeError::CommandFailed)));
        assert_eq!(OperationState::Idle, beaver.operation_state());
    }

    #[test]
    fn given_home_on_park_the_park_move_follows_the_home_search() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        beaver.set_home_on_park(true);

        script.push("athome:0#");
        script.push("gohome:0#");
        beaver.park().unwrap();
        assert_eq!(OperationState::Parking{ via_home: true }, beaver.operation_state());

        // still rotating towards home
        script.push("status:1#");
        script.push("getaz:20.00#");
        assert_eq!(false, beaver.is_park_complete().unwrap());

        // home reached; the park command goes out
        script.push("status:0#");
        script.push("status:0#");
        script.push("athome:1#");
        script.push("setaz:0#");
        script.push("gopark:0#");
        assert_eq!(false, beaver.is_park_complete().unwrap());
        assert_eq!(OperationState::Parking{ via_home: false }, beaver.operation_state());
        assert!(script.sent().contains(&"!dome gopark#".to_string()));

        // settled at the park azimuth
        script.push("status:0#");
        script.push("getaz:90.00#");
        assert_eq!(true, beaver.is_park_complete().unwrap());
        assert!(beaver.is_parked());
    }

    #[test]
    fn given_dome_settles_off_park_azimuth_parking_fails_unparked() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        script.push("gopark:0#");
        beaver.park().unwrap();

        script.push("status:0#");
        script.push("getaz:120.00#");
        assert!(matches!(beaver.is_park_complete(), Err(DomeError::CommandFailed)));
        assert_eq!(false, beaver.is_parked());
    }

    #[test]
    fn given_direct_unpark_it_completes_synchronously() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        script.push("gopark:0#");
        beaver.park().unwrap();
        script.push("status:0#");
        script.push("getaz:90.00#");
        assert_eq!(true, beaver.is_park_complete().unwrap());

        script.push("setaz:0#");
        beaver.unpark().unwrap();
        assert_eq!(false, beaver.is_parked());
        assert_eq!(true, beaver.is_unpark_complete().unwrap());
        assert!(script.sent().contains(&"!dome setaz 90.00#".to_string()));
    }

    #[test]
    fn given_home_on_unpark_the_parked_flag_clears_only_at_home() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        beaver.set_home_on_unpark(true);

        script.push("gopark:0#");
        beaver.park().unwrap();
        script.push("status:0#");
        script.push("getaz:90.00#");
        assert_eq!(true, beaver.is_park_complete().unwrap());
        assert!(beaver.is_parked());

        script.push("athome:0#");
        script.push("gohome:0#");
        beaver.unpark().unwrap();
        assert_eq!(OperationState::Unparking{ via_home: true }, beaver.operation_state());

        // still rotating towards home; the dome stays parked
        script.push("status:1#");
        assert_eq!(false, beaver.is_unpark_complete().unwrap());
        assert!(beaver.is_parked());

        // home reached; unparking completes and the parked flag flips
        script.push("status:0#");
        script.push("athome:1#");
        script.push("setaz:0#");
        assert_eq!(true, beaver.is_unpark_complete().unwrap());
        assert_eq!(false, beaver.is_parked());
        assert_eq!(OperationState::Idle, beaver.operation_state());

        // and stays complete on a further poll
        assert_eq!(true, beaver.is_unpark_complete().unwrap());
    }

    #[test]
    fn given_abort_twice_the_operation_state_stays_idle() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        script.push("gotoaz:0#");
        beaver.goto_azimuth(200.0).unwrap();

        script.push("abort:0#");
        script.push("getaz:150.00#");
        beaver.abort().unwrap();
        assert_eq!(OperationState::Idle, beaver.operation_state());
        assert!((beaver.target_azimuth() - 150.0).abs() < 1e-9);

        script.push("abort:0#");
        script.push("getaz:150.00#");
        beaver.abort().unwrap();
        assert_eq!(OperationState::Idle, beaver.operation_state());
    }

    #[test]
    fn given_no_shutter_open_and_close_complete_without_device_traffic() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        let sent_before = script.num_sent();

        beaver.open_shutter().unwrap();
        assert_eq!(true, beaver.is_open_complete().unwrap());
        beaver.close_shutter().unwrap();
        assert_eq!(true, beaver.is_close_complete().unwrap());

        assert_eq!(sent_before, script.num_sent());
    }

    #[test]
    fn given_present_shutter_open_completes_when_state_reports_open() {
        let (mut beaver, script) = connected(HANDSHAKE_WITH_SHUTTER, Box::new(NullRainSink));

        script.push("getvoltage:12.40#");
        script.push("openshutter:0#");
        beaver.open_shutter().unwrap();

        script.push("shutterstatus:2#");
        assert_eq!(false, beaver.is_open_complete().unwrap());

        script.push("shutterstatus:0#");
        assert_eq!(true, beaver.is_open_complete().unwrap());
        assert!((beaver.elevation() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn given_calibration_in_progress_motion_commands_are_refused() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        script.push("calibrate:0#");
        beaver.calibrate_rotation().unwrap();
        assert_eq!(OperationState::CalibratingRotation, beaver.operation_state());

        let sent_before = script.num_sent();
        assert!(matches!(beaver.goto_azimuth(100.0), Err(DomeError::CommandFailed)));
        assert!(matches!(beaver.park(), Err(DomeError::CommandFailed)));
        assert_eq!(sent_before, script.num_sent());

        script.push("getcalibrationstatus:1#");
        assert_eq!(false, beaver.is_rotation_calibration_complete().unwrap());

        script.push("getcalibrationstatus:0#");
        script.push("getstepsperdegree:10.0#");
        assert_eq!(true, beaver.is_rotation_calibration_complete().unwrap());
        assert_eq!(OperationState::Idle, beaver.operation_state());
    }

    #[test]
    fn given_out_of_range_calibration_status_polling_fails() {
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(NullRainSink));
        script.push("calibrate:0#");
        beaver.calibrate_rotation().unwrap();

        script.push("getcalibrationstatus:7#");
        assert!(matches!(
            beaver.is_rotation_calibration_complete(),
            Err(DomeError::CommandFailed)
        ));
    }

    #[test]
    fn given_changing_rain_samples_only_edges_reach_the_sink() {
        struct CountingSink {
            writes: Rc<RefCell<Vec<RainState>>>
        }

        impl RainStatusSink for CountingSink {
            fn persist(&mut self, state: RainState) -> Result<(), DomeError> {
                self.writes.borrow_mut().push(state);
                Ok(())
            }
        }

        let writes = Rc::new(RefCell::new(vec![]));
        let sink = CountingSink{ writes: Rc::clone(&writes) };
        // the handshake persists the first (NotRaining) sample
        let (mut beaver, script) = connected(HANDSHAKE_NO_SHUTTER, Box::new(sink));
        assert_eq!(1, writes.borrow().len());

        for status in ["status:0#", "status:32#", "status:32#", "status:0#"].iter() {
            script.push(status);
            beaver.write_rain_status();
        }

        use RainState::*;
        assert_eq!(vec![NotRaining, Raining, NotRaining], *writes.borrow());
        assert_eq!(NotRaining, beaver.rain_state());
    }

    #[test]
    fn given_wrapped_shutter_query_the_command_is_quoted() {
        let (mut beaver, script) = connected(HANDSHAKE_WITH_SHUTTER, Box::new(NullRainSink));
        script.push("getvoltage:12.40#");
        assert!((beaver.battery_voltage().unwrap() - 12.4).abs() < 1e-9);
        assert_eq!(
            "!dome sendtoshutter \"shutter getvoltage\"#",
            script.sent().last().unwrap().as_str()
        );
    }

    #[test]
    fn given_failed_handshake_the_driver_stays_disconnected() {
        let responses = Rc::new(RefCell::new(VecDeque::new()));
        responses.borrow_mut().push_back("#".to_string());  // empty reply to the version query
        let sent = Rc::new(RefCell::new(vec![]));
        let transport = ScriptedTransport{
            responses: Rc::clone(&responses),
            sent: Rc::clone(&sent),
            pending: vec![]
        };
        let mut beaver = Beaver::new(Box::new(NullRainSink));
        assert!(matches!(
            beaver.connect(Box::new(transport)),
            Err(DomeError::CannotConnect)
        ));
        assert_eq!(false, beaver.is_connected());
    }
}
