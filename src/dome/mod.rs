//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Dome controller module.
//!

pub mod beaver;
pub mod position;
pub mod protocol;
pub mod rain;
pub mod simulator;
pub mod transport;

use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum DomeError {
    /// Operation attempted while disconnected; never retried.
    NotConnected,
    /// Firmware handshake failed after opening the port.
    CannotConnect,
    /// No response terminator received within the timeout budget.
    Timeout,
    /// Runaway device stream exceeded the receive buffer.
    BufferOverflow,
    /// Nothing left of the response after stripping the envelope.
    EmptyResponse,
    /// Splitting the response payload yielded no fields.
    NoFields,
    /// A field was present but could not be converted to a number.
    MalformedNumber,
    /// Operation-level semantic failure (e.g. dome stopped off target after
    /// the single permitted retry, or an out-of-range calibration status).
    CommandFailed,
    Serial(serialport::Error),
    Io(std::io::Error)
}

impl fmt::Display for DomeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DomeError::NotConnected => write!(f, "not connected to the dome controller"),
            DomeError::CannotConnect => write!(f, "cannot connect to the dome controller"),
            DomeError::Timeout => write!(f, "timed out waiting for a response"),
            DomeError::BufferOverflow => write!(f, "response exceeded the receive buffer"),
            DomeError::EmptyResponse => write!(f, "empty response"),
            DomeError::NoFields => write!(f, "no fields in response"),
            DomeError::MalformedNumber => write!(f, "malformed numeric field in response"),
            DomeError::CommandFailed => write!(f, "command failed"),
            DomeError::Serial(e) => write!(f, "serial port error: {}", e),
            DomeError::Io(e) => write!(f, "I/O error: {}", e)
        }
    }
}

impl Error for DomeError {}

impl From<serialport::Error> for DomeError {
    fn from(e: serialport::Error) -> DomeError {
        DomeError::Serial(e)
    }
}

impl From<std::io::Error> for DomeError {
    fn from(e: std::io::Error) -> DomeError {
        DomeError::Io(e)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ShutterState {
    Open,
    Closed,
    Opening,
    Closing,
    Error
}

impl ShutterState {
    /// Maps the controller's `shutterstatus` code.
    pub fn from_code(code: u32) -> ShutterState {
        match code {
            0 => ShutterState::Open,
            1 => ShutterState::Closed,
            2 => ShutterState::Opening,
            3 => ShutterState::Closing,
            _ => ShutterState::Error
        }
    }
}

/// Decoded snapshot of one `dome status` word.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DeviceStatus {
    pub dome_moving: bool,
    pub shutter_moving: bool,
    pub dome_mech_error: bool,
    pub shutter_mech_error: bool,
    pub shutter_comm_error: bool,
    pub raining: bool,
    pub shutter_state: ShutterState,
    pub at_home: bool,
    pub at_park: bool
}

/// What to do when the rain sensor reports rain.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq,
    serde::Serialize, serde::Deserialize,
    strum_macros::Display, strum_macros::EnumString
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RainAction {
    DoNothing,
    Home,
    Park
}

/// The multi-step operation currently in flight, if any.
///
/// Exactly one is active at a time; entering a new one from `Idle` requires
/// the device to be connected and not mid-calibration. The single-shot retry
/// budgets live beside this on the driver, because home-before-park and
/// home-before-unpark share the homing retry budget with a standalone
/// find-home.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OperationState {
    Idle,
    Goto { target: f64 },
    Homing,
    Parking { via_home: bool },
    Unparking { via_home: bool },
    CalibratingRotation,
    CalibratingShutter
}

pub enum DomeConnection {
    /// Direct serial connection, e.g. "COM3" on Windows or "/dev/ttyUSB0" on Linux.
    Serial { device: String },
    Simulator
}

pub fn connect_to_dome(
    connection: DomeConnection,
    rain_sink: Box<dyn rain::RainStatusSink>
) -> Result<beaver::Beaver, DomeError> {
    let mut dome = beaver::Beaver::new(rain_sink);
    match connection {
        DomeConnection::Serial { device } => {
            dome.connect(Box::new(transport::SerialTransport::open(&device)?))?;
        },

        DomeConnection::Simulator => {
            dome.connect(Box::new(simulator::SimulatedBeaver::new()))?;
        }
    }
    Ok(dome)
}
