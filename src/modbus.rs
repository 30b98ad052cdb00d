//! Minimal Modbus RTU client over an `embedded-hal` serial port.
//!
//! Only "read input registers" is needed by the sensors on the bus.

use {
    crc::{Crc, CRC_16_MODBUS},
    embedded_hal::serial::{Read, Write},
    std::{
        fmt::Debug,
        time::{Duration, Instant},
    },
    thiserror::Error,
};

pub const READ_INPUT_REGISTERS: u8 = 0x04;

const EXCEPTION_FLAG: u8 = 0x80;
const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("serial I/O error: {0}")]
    Io(String),

    #[error("CRC mismatch: frame carries {received:#06x}, calculated {calculated:#06x}")]
    Crc { received: u16, calculated: u16 },

    #[error("device returned exception code {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },

    #[error("response from address {got} while talking to {expected}")]
    UnexpectedAddress { expected: u8, got: u8 },

    #[error("response for function {got:#04x}, expected {expected:#04x}")]
    UnexpectedFunction { expected: u8, got: u8 },

    #[error("response carries {got} data bytes, expected {expected}")]
    Length { expected: usize, got: usize },
}

/// Appends the CRC in the low-byte-first order RTU uses.
fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = MODBUS_CRC.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn check_crc(frame: &[u8]) -> Result<(), FrameError> {
    let split = frame.len().saturating_sub(2);
    let (body, tail) = frame.split_at(split);
    let received = match tail {
        [lo, hi] => u16::from_le_bytes([*lo, *hi]),
        _ => {
            return Err(FrameError::Length {
                expected: 2,
                got: tail.len(),
            })
        }
    };
    let calculated = MODBUS_CRC.checksum(body);
    if received != calculated {
        return Err(FrameError::Crc {
            received,
            calculated,
        });
    }
    Ok(())
}

pub fn read_request(address: u8, function: u8, register: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![address, function];
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    with_crc(frame)
}

/// Decodes two registers as an IEEE-754 float, high word first.
pub fn registers_to_f32(registers: [u16; 2]) -> f32 {
    let bits = (u32::from(registers[0]) << 16) | u32::from(registers[1]);
    f32::from_bits(bits)
}

/// Borrowed serial port speaking Modbus RTU for the duration of one
/// transaction.
pub struct RtuClient<'a, S> {
    port: &'a mut S,
    timeout: Duration,
}

impl<'a, S, E> RtuClient<'a, S>
where
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    E: Debug,
{
    pub fn new(port: &'a mut S, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    pub fn read_input_registers(
        &mut self,
        address: u8,
        register: u16,
        count: u16,
    ) -> Result<Vec<u16>, FrameError> {
        self.discard_input()?;
        self.send(&read_request(address, READ_INPUT_REGISTERS, register, count))?;

        let deadline = Instant::now() + self.timeout;
        let mut frame = self.receive(3, deadline)?;
        let (got_address, got_function) = (frame[0], frame[1]);

        if got_function == READ_INPUT_REGISTERS | EXCEPTION_FLAG {
            frame.extend(self.receive(2, deadline)?);
            check_crc(&frame)?;
            return Err(FrameError::Exception {
                function: READ_INPUT_REGISTERS,
                code: frame[2],
            });
        }

        let byte_count = usize::from(frame[2]);
        frame.extend(self.receive(byte_count + 2, deadline)?);
        check_crc(&frame)?;

        if got_address != address {
            return Err(FrameError::UnexpectedAddress {
                expected: address,
                got: got_address,
            });
        }
        if got_function != READ_INPUT_REGISTERS {
            return Err(FrameError::UnexpectedFunction {
                expected: READ_INPUT_REGISTERS,
                got: got_function,
            });
        }
        let expected = usize::from(count) * 2;
        if byte_count != expected {
            return Err(FrameError::Length {
                expected,
                got: byte_count,
            });
        }

        Ok(frame[3..3 + byte_count]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Drops whatever a previous, possibly aborted, exchange left in the
    /// receive buffer.
    fn discard_input(&mut self) -> Result<(), FrameError> {
        loop {
            match self.port.read() {
                Ok(_) => continue,
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(FrameError::Io(format!("{:?}", e))),
            }
        }
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        for byte in frame {
            nb::block!(self.port.write(*byte)).map_err(|e| FrameError::Io(format!("{:?}", e)))?;
        }
        nb::block!(self.port.flush()).map_err(|e| FrameError::Io(format!("{:?}", e)))
    }

    fn receive(&mut self, len: usize, deadline: Instant) -> Result<Vec<u8>, FrameError> {
        let mut bytes = Vec::with_capacity(len);
        while bytes.len() < len {
            match self.port.read() {
                Ok(byte) => bytes.push(byte),
                Err(nb::Error::WouldBlock) if Instant::now() >= deadline => {
                    return Err(FrameError::Timeout(self.timeout))
                }
                Err(nb::Error::WouldBlock) => std::thread::yield_now(),
                Err(nb::Error::Other(e)) => return Err(FrameError::Io(format!("{:?}", e))),
            }
        }
        Ok(bytes)
    }
}
