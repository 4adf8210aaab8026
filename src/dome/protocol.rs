//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Response parsing and status word decoding.
//!

use crate::dome::{DeviceStatus, DomeError, ShutterState};

pub const FIELD_SEPARATOR: char = ':';

/// Characters making up the response envelope; stripped from both ends.
const ENVELOPE_CHARS: &[char] = &['!', '#', '\r', '\n'];

mod status_bits {
    pub const DOME_MOVING: u32        = 0x0001;
    pub const SHUTTER_MOVING: u32     = 0x0002;
    pub const DOME_MECH_ERROR: u32    = 0x0004;
    pub const SHUTTER_MECH_ERROR: u32 = 0x0008;
    pub const SHUTTER_COMM_ERROR: u32 = 0x0010;
    pub const RAINING: u32            = 0x0060;
    pub const AT_HOME: u32            = 0x0080;
    pub const AT_PARK: u32            = 0x0100;
    pub const SHUTTER_STATE: u32      = 0x1E00;
    pub const SHUTTER_STATE_SHIFT: u32 = 9;
}

/// Splits a raw (already `#`-stripped) response into its fields.
pub fn parse_fields(response: &str, separator: char) -> Result<Vec<String>, DomeError> {
    let payload = response.trim_matches(ENVELOPE_CHARS);
    if payload.is_empty() {
        return Err(DomeError::EmptyResponse);
    }

    let fields: Vec<String> = payload.split(separator).map(|f| f.to_string()).collect();
    if fields.is_empty() {
        return Err(DomeError::NoFields);
    }

    Ok(fields)
}

/// Converts field `index` to a number.
///
/// A missing field is tolerated (`Ok(None)`), letting the caller keep a
/// previous or default value; a present but unparseable field is an error.
pub fn numeric_field<T: std::str::FromStr>(
    fields: &[String],
    index: usize
) -> Result<Option<T>, DomeError> {
    match fields.get(index) {
        None => Ok(None),
        Some(field) => match field.trim().parse::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(DomeError::MalformedNumber)
        }
    }
}

pub fn decode_status(word: u32) -> DeviceStatus {
    DeviceStatus{
        dome_moving: word & status_bits::DOME_MOVING != 0,
        shutter_moving: word & status_bits::SHUTTER_MOVING != 0,
        dome_mech_error: word & status_bits::DOME_MECH_ERROR != 0,
        shutter_mech_error: word & status_bits::SHUTTER_MECH_ERROR != 0,
        shutter_comm_error: word & status_bits::SHUTTER_COMM_ERROR != 0,
        raining: word & status_bits::RAINING != 0,
        at_home: word & status_bits::AT_HOME != 0,
        at_park: word & status_bits::AT_PARK != 0,
        shutter_state: ShutterState::from_code(
            (word & status_bits::SHUTTER_STATE) >> status_bits::SHUTTER_STATE_SHIFT
        )
    }
}

/// Extracts a dotted firmware version from a `seletek version` reply.
///
/// The version field is a digit string whose 2nd, 3rd and 4th characters are
/// the major, minor and patch digits, e.g. "1221" means "2.2.1".
pub fn decode_firmware_version(fields: &[String]) -> Result<String, DomeError> {
    let field = fields.get(1).ok_or(DomeError::CommandFailed)?;
    let digits: Vec<char> = field.chars().collect();
    if digits.len() < 4 {
        return Err(DomeError::CommandFailed);
    }
    Ok(format!("{}.{}.{}", digits[1], digits[2], digits[3]))
}

/// Wraps a shutter-side command for relaying over the wireless link.
pub fn wrap_shutter_command(inner: &str) -> String {
    format!("!dome sendtoshutter \"{}\"#", inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_enveloped_response_fields_are_extracted() {
        let fields = parse_fields("!dome:123:45#", ':').unwrap();
        assert_eq!(vec!["dome", "123", "45"], fields);
    }

    #[test]
    fn given_envelope_only_response_parsing_fails_as_empty() {
        assert!(matches!(parse_fields("####", ':'), Err(DomeError::EmptyResponse)));
        assert!(matches!(parse_fields("!\r\n#", ':'), Err(DomeError::EmptyResponse)));
    }

    #[test]
    fn given_single_field_response_it_is_returned_whole() {
        let fields = parse_fields("ack", ':').unwrap();
        assert_eq!(vec!["ack"], fields);
    }

    #[test]
    fn given_missing_field_numeric_conversion_returns_none() {
        let fields = parse_fields("getaz:10.5", ':').unwrap();
        assert_eq!(None, numeric_field::<f64>(&fields, 5).unwrap());
    }

    #[test]
    fn given_malformed_field_numeric_conversion_fails() {
        let fields = parse_fields("getaz:bogus", ':').unwrap();
        assert!(matches!(numeric_field::<f64>(&fields, 1), Err(DomeError::MalformedNumber)));
    }

    #[test]
    fn given_valid_field_numeric_conversion_succeeds() {
        let fields = parse_fields("getaz:187.25", ':').unwrap();
        assert_eq!(Some(187.25), numeric_field::<f64>(&fields, 1).unwrap());
    }

    #[test]
    fn given_status_word_all_bits_decode_independently() {
        let status = decode_status(0x0001 | 0x0010 | 0x0020 | 0x0080);
        assert!(status.dome_moving);
        assert!(!status.shutter_moving);
        assert!(status.shutter_comm_error);
        assert!(status.raining);
        assert!(status.at_home);
        assert!(!status.at_park);
        assert_eq!(ShutterState::Open, status.shutter_state);
    }

    #[test]
    fn given_shutter_state_nibble_states_decode() {
        assert_eq!(ShutterState::Closed, decode_status(1 << 9).shutter_state);
        assert_eq!(ShutterState::Opening, decode_status(2 << 9).shutter_state);
        assert_eq!(ShutterState::Closing, decode_status(3 << 9).shutter_state);
        assert_eq!(ShutterState::Error, decode_status(7 << 9).shutter_state);
    }

    #[test]
    fn given_version_reply_digits_become_dotted_version() {
        let fields = vec!["version".to_string(), "1221".to_string()];
        assert_eq!("2.2.1", decode_firmware_version(&fields).unwrap());
    }

    #[test]
    fn given_short_version_field_decoding_fails() {
        let fields = vec!["version".to_string(), "12".to_string()];
        assert!(matches!(decode_firmware_version(&fields), Err(DomeError::CommandFailed)));
    }
}
