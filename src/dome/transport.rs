//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Serial transport and request/response framing.
//!

use crate::dome::DomeError;
use std::time::Duration;

pub const BAUD_RATE: u32 = 115_200;

/// Largest response the controller ever produces.
pub const SERIAL_BUFFER_SIZE: usize = 256;

/// Overall budget for one response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Granularity of waiting for response bytes.
const READ_WAIT_INCREMENT: Duration = Duration::from_millis(25);

/// Every response ends with this character.
pub const RESPONSE_END_CHAR: u8 = b'#';

/// Byte-level channel to the controller.
///
/// The serial port implements it for real hardware; the simulator and the
/// scripted transports used in tests implement it in memory.
pub trait Transport {
    /// Discards any stale bytes buffered in both directions.
    fn purge(&mut self) -> Result<(), DomeError>;

    /// Number of received bytes available for reading right now.
    fn bytes_waiting(&mut self) -> Result<usize, DomeError>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DomeError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), DomeError>;

    fn flush(&mut self) -> Result<(), DomeError>;
}

/// Injected so the framer can be tested without wall-clock delays.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct StdSleeper;

impl Sleeper for StdSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>
}

impl SerialTransport {
    pub fn open(device: &str) -> Result<SerialTransport, DomeError> {
        let port = serialport::new(device, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .flow_control(serialport::FlowControl::None)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(RESPONSE_TIMEOUT)
            .open()?;

        Ok(SerialTransport{ port })
    }
}

impl Transport for SerialTransport {
    fn purge(&mut self) -> Result<(), DomeError> {
        self.port.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    fn bytes_waiting(&mut self) -> Result<usize, DomeError> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DomeError> {
        Ok(std::io::Read::read(&mut self.port, buf)?)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), DomeError> {
        std::io::Write::write_all(&mut self.port, data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DomeError> {
        std::io::Write::flush(&mut self.port)?;
        Ok(())
    }
}

/// Sends `cmd` and reads the `#`-terminated response (terminator stripped).
///
/// Stale input is purged first, so a response can never be paired with an
/// earlier command. The idle clock restarts whenever bytes arrive; exceeding
/// `timeout` with no progress fails with `Timeout`, and a response longer
/// than [`SERIAL_BUFFER_SIZE`] fails with `BufferOverflow`.
pub fn exchange(
    transport: &mut dyn Transport,
    sleeper: &dyn Sleeper,
    cmd: &str,
    timeout: Duration
) -> Result<String, DomeError> {
    transport.purge()?;
    log::debug!("sending: {}", cmd);
    transport.write_all(cmd.as_bytes())?;
    transport.flush()?;
    let reply = read_response(transport, sleeper, timeout)?;
    log::debug!("received: {}", reply);
    Ok(reply)
}

fn read_response(
    transport: &mut dyn Transport,
    sleeper: &dyn Sleeper,
    timeout: Duration
) -> Result<String, DomeError> {
    let mut received: Vec<u8> = vec![];
    let mut idle = Duration::from_millis(0);

    loop {
        let waiting = transport.bytes_waiting()?;
        if waiting == 0 {
            idle += READ_WAIT_INCREMENT;
            if idle >= timeout {
                return Err(DomeError::Timeout);
            }
            sleeper.sleep(READ_WAIT_INCREMENT);
            continue;
        }
        idle = Duration::from_millis(0);

        if received.len() + waiting > SERIAL_BUFFER_SIZE {
            return Err(DomeError::BufferOverflow);
        }

        let mut chunk = vec![0; waiting];
        let num_read = transport.read(&mut chunk)?;
        received.extend_from_slice(&chunk[..num_read]);

        if received.last() == Some(&RESPONSE_END_CHAR) { break; }
    }

    received.pop();
    Ok(String::from_utf8_lossy(&received).into_owned())
}
