//! LoRa telemetry frames
//!
//! Wire layout (little-endian), carried hex-encoded inside the
//! transceiver's `+RCV=<addr>,<len>,<hex>,<rssi>,<snr>` lines:
//!
//! ```text
//! offset  size  field
//! 0       32    commitment
//! 32      4     temperature_c     f32 LE
//! 36      4     humidity_pct      f32 LE
//! 40      4     pressure_hpa      f32 LE
//! 44      4     soil_moisture_pct f32 LE
//! 48      64    signature (r||s, P-256)
//! 112     4     timestamp_s       u32 LE
//! ```

use crate::commitment::Commitment;
use thiserror::Error;

/// minimum frame length in bytes; longer frames carry ignored trailing data
pub const FRAME_MIN_LEN: usize = 116;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need {FRAME_MIN_LEN}")]
    TooShort { len: usize },

    #[error("payload is not valid hex")]
    BadHex,

    #[error("declared length {declared} does not match payload of {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("malformed receive line: {0}")]
    BadLine(String),
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("{field} reading {value} outside [{min}, {max}]")]
pub struct SensorRangeError {
    pub field: &'static str,
    pub value: f32,
    pub min: f32,
    pub max: f32,
}

/// one sensor sample, four IEEE-754 floats
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorReading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub pressure_hpa: f32,
    pub soil_moisture_pct: f32,
}

impl SensorReading {
    /// wire encoding, 16 bytes little-endian; also the data-hash preimage
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.temperature_c.to_le_bytes());
        out[4..8].copy_from_slice(&self.humidity_pct.to_le_bytes());
        out[8..12].copy_from_slice(&self.pressure_hpa.to_le_bytes());
        out[12..16].copy_from_slice(&self.soil_moisture_pct.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: &[u8; 16]) -> Self {
        let f = |i: usize| f32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
        Self {
            temperature_c: f(0),
            humidity_pct: f(4),
            pressure_hpa: f(8),
            soil_moisture_pct: f(12),
        }
    }

    /// semantic validity; boundaries are inclusive
    pub fn validate(&self) -> Result<(), SensorRangeError> {
        let check = |field: &'static str, value: f32, min: f32, max: f32| {
            if value.is_nan() || value < min || value > max {
                Err(SensorRangeError {
                    field,
                    value,
                    min,
                    max,
                })
            } else {
                Ok(())
            }
        };
        check("temperature_c", self.temperature_c, -40.0, 85.0)?;
        check("humidity_pct", self.humidity_pct, 0.0, 100.0)?;
        check("pressure_hpa", self.pressure_hpa, 300.0, 1100.0)?;
        check("soil_moisture_pct", self.soil_moisture_pct, 0.0, 100.0)?;
        Ok(())
    }
}

/// fully parsed telemetry packet with receive metadata
#[derive(Clone, Debug, PartialEq)]
pub struct LoraPacket {
    pub src_addr: u16,
    pub commitment: Commitment,
    pub sensor: SensorReading,
    /// raw P-256 signature (r||s), passed through to the circuit unchanged
    pub signature: [u8; 64],
    pub timestamp_s: u32,
    pub rssi: i16,
    pub snr: i16,
}

/// the payload portion of a receive line, before frame decoding
#[derive(Clone, Debug, PartialEq)]
pub struct RcvLine {
    pub src_addr: u16,
    pub payload: Vec<u8>,
    pub rssi: i16,
    pub snr: i16,
}

/// split a `+RCV=<addr>,<len>,<hex>,<rssi>,<snr>` line
pub fn parse_rcv_line(line: &str) -> Result<RcvLine, FrameError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let rest = line
        .strip_prefix("+RCV=")
        .ok_or_else(|| FrameError::BadLine(line.to_string()))?;

    let fields: Vec<&str> = rest.split(',').collect();
    if fields.len() != 5 {
        return Err(FrameError::BadLine(line.to_string()));
    }

    let src_addr: u16 = fields[0]
        .parse()
        .map_err(|_| FrameError::BadLine(line.to_string()))?;
    let declared: usize = fields[1]
        .parse()
        .map_err(|_| FrameError::BadLine(line.to_string()))?;
    let payload = hex::decode(fields[2]).map_err(|_| FrameError::BadHex)?;
    if payload.len() != declared {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    let rssi: i16 = fields[3]
        .parse()
        .map_err(|_| FrameError::BadLine(line.to_string()))?;
    let snr: i16 = fields[4]
        .parse()
        .map_err(|_| FrameError::BadLine(line.to_string()))?;

    Ok(RcvLine {
        src_addr,
        payload,
        rssi,
        snr,
    })
}

/// decode the binary frame out of a receive line
pub fn decode_frame(rcv: &RcvLine) -> Result<LoraPacket, FrameError> {
    let payload = &rcv.payload;
    if payload.len() < FRAME_MIN_LEN {
        return Err(FrameError::TooShort { len: payload.len() });
    }

    let commitment = Commitment::from_bytes(payload[0..32].try_into().unwrap());
    let sensor = SensorReading::from_le_bytes(payload[32..48].try_into().unwrap());
    let signature: [u8; 64] = payload[48..112].try_into().unwrap();
    let timestamp_s = u32::from_le_bytes(payload[112..116].try_into().unwrap());

    Ok(LoraPacket {
        src_addr: rcv.src_addr,
        commitment,
        sensor,
        signature,
        timestamp_s,
        rssi: rcv.rssi,
        snr: rcv.snr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_sensor() -> SensorReading {
        SensorReading {
            temperature_c: 24.5,
            humidity_pct: 61.0,
            pressure_hpa: 1013.2,
            soil_moisture_pct: 37.8,
        }
    }

    pub(crate) fn sample_frame(commitment: [u8; 32], timestamp_s: u32) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_MIN_LEN);
        frame.extend_from_slice(&commitment);
        frame.extend_from_slice(&sample_sensor().to_le_bytes());
        frame.extend_from_slice(&[0x5a; 64]);
        frame.extend_from_slice(&timestamp_s.to_le_bytes());
        frame
    }

    fn rcv_line_for(frame: &[u8]) -> String {
        format!("+RCV=7,{},{},-42,11\r\n", frame.len(), hex::encode(frame))
    }

    #[test]
    fn parses_full_receive_line() {
        let frame = sample_frame([0x01; 32], 1_700_000_000);
        let line = rcv_line_for(&frame);
        let rcv = parse_rcv_line(&line).unwrap();
        assert_eq!(rcv.src_addr, 7);
        assert_eq!(rcv.rssi, -42);
        assert_eq!(rcv.snr, 11);

        let packet = decode_frame(&rcv).unwrap();
        assert_eq!(packet.commitment, Commitment([0x01; 32]));
        assert_eq!(packet.timestamp_s, 1_700_000_000);
        assert_eq!(packet.sensor, sample_sensor());
        assert_eq!(packet.signature, [0x5a; 64]);
    }

    #[test]
    fn short_frame_is_dropped() {
        let frame = vec![0u8; FRAME_MIN_LEN - 1];
        let rcv = parse_rcv_line(&rcv_line_for(&frame)).unwrap();
        assert_eq!(
            decode_frame(&rcv),
            Err(FrameError::TooShort {
                len: FRAME_MIN_LEN - 1
            })
        );
    }

    #[test]
    fn declared_length_must_match() {
        let frame = sample_frame([1; 32], 0);
        let line = format!("+RCV=7,999,{},-42,11", hex::encode(&frame));
        assert_eq!(
            parse_rcv_line(&line),
            Err(FrameError::LengthMismatch {
                declared: 999,
                actual: frame.len()
            })
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            parse_rcv_line("+OK"),
            Err(FrameError::BadLine(_))
        ));
        assert!(matches!(
            parse_rcv_line("+RCV=7,4,deadbeef"),
            Err(FrameError::BadLine(_))
        ));
        assert_eq!(parse_rcv_line("+RCV=7,2,zzzz,-42,11"), Err(FrameError::BadHex));
    }

    #[test]
    fn sensor_roundtrip_le() {
        let sensor = sample_sensor();
        assert_eq!(SensorReading::from_le_bytes(&sensor.to_le_bytes()), sensor);
    }

    #[test]
    fn range_boundaries_inclusive() {
        let mut sensor = sample_sensor();
        sensor.temperature_c = -40.0;
        assert!(sensor.validate().is_ok());
        sensor.temperature_c = 85.0;
        assert!(sensor.validate().is_ok());
        // one ULP outside the boundary must fail
        sensor.temperature_c = f32::from_bits(85.0_f32.to_bits() + 1);
        let err = sensor.validate().unwrap_err();
        assert_eq!(err.field, "temperature_c");

        sensor = sample_sensor();
        sensor.humidity_pct = 100.0;
        assert!(sensor.validate().is_ok());
        sensor.humidity_pct = f32::from_bits(100.0_f32.to_bits() + 1);
        assert!(sensor.validate().is_err());

        sensor = sample_sensor();
        sensor.pressure_hpa = 300.0;
        assert!(sensor.validate().is_ok());
        sensor.pressure_hpa = f32::from_bits(300.0_f32.to_bits() - 1);
        assert!(sensor.validate().is_err());

        sensor = sample_sensor();
        sensor.soil_moisture_pct = 0.0;
        assert!(sensor.validate().is_ok());
        sensor.soil_moisture_pct = -f32::MIN_POSITIVE;
        assert!(sensor.validate().is_err());
    }

    #[test]
    fn nan_readings_rejected() {
        let mut sensor = sample_sensor();
        sensor.pressure_hpa = f32::NAN;
        assert!(sensor.validate().is_err());
    }
}
