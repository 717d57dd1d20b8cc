//! Modbus-RTU wind sensor driver.
//!
//! Function code 0x03 (read holding registers), CRC-16 with polynomial
//! 0xA001 appended little-endian. Register 0 carries wind speed and
//! register 3 the direction angle, both scaled by 1/10. The serial port is
//! hidden behind [`ModbusTransport`] so framing stays testable off-hardware.

use crate::config::Rs485Config;
use crate::types::WindSample;
use crate::wind::{WindError, WindSensor};
use chrono::Utc;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Modbus function code used by the sensor.
const FC_READ_HOLDING: u8 = 0x03;

/// CRC-16/MODBUS over `data`, returned as the two-byte little-endian suffix.
pub fn crc16(data: &[u8]) -> [u8; 2] {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc.to_le_bytes()
}

/// Build a read-holding-registers request frame.
pub fn build_read_request(slave_id: u8, start_register: u16, register_count: u16) -> Vec<u8> {
    let mut frame = vec![
        slave_id,
        FC_READ_HOLDING,
        (start_register >> 8) as u8,
        (start_register & 0xFF) as u8,
        (register_count >> 8) as u8,
        (register_count & 0xFF) as u8,
    ];
    frame.extend_from_slice(&crc16(&frame));
    frame
}

/// Validate a complete response frame and return its register payload.
pub fn parse_read_response(frame: &[u8]) -> Result<&[u8], WindError> {
    if frame.len() < 5 {
        return Err(WindError::Protocol(format!(
            "response too short: {} bytes",
            frame.len()
        )));
    }
    let data_len = frame[2] as usize;
    if frame.len() != 3 + data_len + 2 {
        return Err(WindError::Protocol(format!(
            "response length {} != {}",
            frame.len(),
            3 + data_len + 2
        )));
    }
    if frame[1] != FC_READ_HOLDING {
        return Err(WindError::Protocol(format!(
            "response function {:02X} != 03",
            frame[1]
        )));
    }
    let (body, crc) = frame.split_at(frame.len() - 2);
    if crc != crc16(body) {
        return Err(WindError::Protocol("crc check failed".into()));
    }
    Ok(&frame[3..3 + data_len])
}

/// Decode speed and direction registers; both scaled by 1/10.
pub fn decode_wind_registers(data: &[u8]) -> Result<(f64, f64), WindError> {
    if data.len() < 10 {
        return Err(WindError::Protocol(format!(
            "register payload too short: {} bytes",
            data.len()
        )));
    }
    let speed_raw = (u16::from(data[0]) << 8) | u16::from(data[1]);
    let angle_raw = (u16::from(data[6]) << 8) | u16::from(data[7]);
    let speed_mps = f64::from(speed_raw) / 10.0;
    let direction_deg = (f64::from(angle_raw) / 10.0).rem_euclid(360.0);
    Ok((speed_mps, direction_deg))
}

// ============================================================================
// Transport
// ============================================================================

/// Byte transport under the Modbus framing; a serial port in production.
pub trait ModbusTransport: Send {
    fn open(&mut self) -> Result<(), WindError>;
    fn is_open(&self) -> bool;
    fn clear_input(&mut self);
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), WindError>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), WindError>;
    fn close(&mut self);
}

/// `serialport`-backed transport.
pub struct SerialTransport {
    cfg: Rs485Config,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    pub fn new(cfg: Rs485Config) -> Self {
        Self { cfg, port: None }
    }
}

impl ModbusTransport for SerialTransport {
    fn open(&mut self) -> Result<(), WindError> {
        if self.is_open() {
            return Ok(());
        }
        let data_bits = match self.cfg.bytesize {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let parity = match self.cfg.parity.trim().to_ascii_uppercase().as_str() {
            "E" | "EVEN" => serialport::Parity::Even,
            "O" | "ODD" => serialport::Parity::Odd,
            _ => serialport::Parity::None,
        };
        let stop_bits = if self.cfg.stopbits >= 2 {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        };
        let port = serialport::new(self.cfg.port.clone(), self.cfg.baudrate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_secs_f64(self.cfg.timeout_s.max(0.05)))
            .open()
            .map_err(|e| WindError::Serial(e.to_string()))?;
        self.port = Some(port);
        self.clear_input();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn clear_input(&mut self) {
        if let Some(port) = &self.port {
            let _ = port.clear(serialport::ClearBuffer::Input);
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), WindError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| WindError::NotConnected("port closed".into()))?;
        port.write_all(frame)
            .map_err(|e| WindError::Serial(e.to_string()))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), WindError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| WindError::NotConnected("port closed".into()))?;
        port.read_exact(buf)
            .map_err(|e| WindError::Serial(e.to_string()))
    }

    fn close(&mut self) {
        self.port = None;
    }
}

// ============================================================================
// Sensor
// ============================================================================

/// RS485 anemometer speaking Modbus-RTU.
pub struct Rs485WindSensor {
    cfg: Rs485Config,
    transport: Box<dyn ModbusTransport>,
}

impl Rs485WindSensor {
    /// Production constructor over a real serial port.
    pub fn open(cfg: Rs485Config) -> Self {
        let transport = SerialTransport::new(cfg.clone());
        Self::with_transport(cfg, Box::new(transport))
    }

    /// Inject a transport (tests and alternative links).
    pub fn with_transport(cfg: Rs485Config, transport: Box<dyn ModbusTransport>) -> Self {
        Self { cfg, transport }
    }

    fn exchange(&mut self) -> Result<WindSample, WindError> {
        if !self.transport.is_open() {
            self.transport.open()?;
        }
        let request = build_read_request(
            self.cfg.slave_id,
            self.cfg.start_register,
            self.cfg.register_count,
        );
        self.transport.clear_input();
        self.transport.write_frame(&request)?;

        let mut header = [0u8; 3];
        self.transport.read_exact(&mut header)?;
        let data_len = header[2] as usize;
        let mut rest = vec![0u8; data_len + 2];
        self.transport.read_exact(&mut rest)?;

        let mut frame = Vec::with_capacity(3 + data_len + 2);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&rest);

        let data = parse_read_response(&frame)?;
        let (speed_mps, direction_deg) = decode_wind_registers(data)?;
        debug!(speed_mps, direction_deg, "wind registers read");
        Ok(WindSample {
            ts: Utc::now(),
            speed_mps,
            direction_deg,
        })
    }
}

impl WindSensor for Rs485WindSensor {
    fn connect(&mut self) -> bool {
        self.transport.open().is_ok()
    }

    fn read(&mut self) -> Result<WindSample, WindError> {
        let result = self.exchange();
        if result.is_err() {
            // Force a reopen on the next attempt.
            self.transport.close();
        }
        result
    }

    fn close(&mut self) {
        self.transport.close();
    }
}
