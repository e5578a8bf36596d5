use crate::protocol::{SerialError, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tokio_serial::ClearBuffer;
use tracing::info;

/// Per-read OS timeout. Kept well below the frame timeout so the codec
/// can check its own deadline between reads.
const READ_SLICE: Duration = Duration::from_millis(5);

/// Serial device opened through `tokio-serial` in blocking mode.
pub struct TtySerialPort {
    port: Box<dyn tokio_serial::SerialPort>,
    buf: [u8; 64],
    len: usize,
    pos: usize,
}

impl TtySerialPort {
    pub fn open(device: &str, baud: u32) -> Result<Self, SerialError> {
        let port = tokio_serial::new(device, baud)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| SerialError(format!("{device}: {e}")))?;
        info!(device, baud, "serial port opened");
        Ok(Self {
            port,
            buf: [0; 64],
            len: 0,
            pos: 0,
        })
    }
}

impl SerialPort for TtySerialPort {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read(&mut self) -> nb::Result<u8, SerialError> {
        if self.pos < self.len {
            let byte = self.buf[self.pos];
            self.pos += 1;
            return Ok(byte);
        }
        match self.port.read(&mut self.buf) {
            Ok(0) => Err(nb::Error::WouldBlock),
            Ok(n) => {
                self.len = n;
                self.pos = 1;
                Ok(self.buf[0])
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Err(nb::Error::WouldBlock)
            }
            Err(e) => Err(nb::Error::Other(e.into())),
        }
    }

    fn discard_input(&mut self) -> Result<(), SerialError> {
        self.len = 0;
        self.pos = 0;
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| SerialError(e.to_string()))
    }
}
