//! Paced byte transport for the shared slave bus.
//!
//! The slaves are slow 8-bit micros on a half-duplex party line: writes
//! must be spaced out byte by byte, and reads can only ever be bounded
//! by time, never by a length prefix. Resynchronisation after a framing
//! failure is done by draining whatever is buffered and re-issuing the
//! command.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use log::trace;
use serialport::{ClearBuffer, SerialPort};

use crate::constants::{BAUD_RATE, READ_SLICES, READ_SLICE_MS, WAKE_SETTLE_MS, WRITE_PACING_MS};
use crate::error::{BmsError, Result};
use crate::frame::{self, FrameDecoder};

/// Byte transport under the slave link. Implemented by the real serial
/// port and by the mock used in tests.
pub trait Transport: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Read whatever is available within one timeout slice. Returns
    /// `Ok(0)` when the slice elapses with nothing to read.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Drain and discard all currently buffered input.
    fn clear_input(&mut self) -> Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self, buf)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match Read::read(self, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// The serial link shared by every cell on the bus.
pub struct SlaveLink<T: Transport> {
    transport: T,
    pacing: Duration,
}

impl SlaveLink<Box<dyn SerialPort>> {
    /// Open the bus on the given serial device.
    pub fn open(device: &str) -> Result<Self> {
        let port = serialport::new(device, BAUD_RATE)
            .timeout(Duration::from_millis(READ_SLICE_MS))
            .open()?;
        Ok(SlaveLink::with_transport(port))
    }
}

impl<T: Transport> SlaveLink<T> {
    pub fn with_transport(transport: T) -> Self {
        SlaveLink {
            transport,
            pacing: Duration::from_millis(WRITE_PACING_MS),
        }
    }

    /// Encode and transmit one command frame, one byte at a time.
    pub fn send_command(&mut self, address: u16, command: u8) -> Result<()> {
        let encoded = frame::encode_command(address, command);
        trace!("tx {:02x?} to cell {}", encoded, address);
        for &b in &encoded {
            self.transport.write_all(&[b])?;
            if !self.pacing.is_zero() {
                thread::sleep(self.pacing);
            }
        }
        Ok(())
    }

    /// Collect up to `want` raw bytes within the read budget (five
    /// timeout slices, about a second). Returns whatever arrived; the
    /// caller decides whether a short read is an error.
    pub fn read_exact(&mut self, want: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(want);
        let mut chunk = [0u8; 64];
        for _ in 0..READ_SLICES {
            let n = self.transport.read_some(&mut chunk)?;
            if n == 0 {
                continue;
            }
            out.extend_from_slice(&chunk[..n]);
            if out.len() >= want {
                break;
            }
        }
        Ok(out)
    }

    /// Read and decode one reply frame of `want` logical bytes
    /// (including its CRC). Escaping means the raw length is unknown,
    /// so bytes are fed to the decoder slice by slice until it
    /// completes or the budget runs out.
    pub fn read_frame(&mut self, want: usize) -> Result<Vec<u8>> {
        let mut decoder = FrameDecoder::new(want);
        let mut raw = 0usize;
        let mut chunk = [0u8; 64];
        for _ in 0..READ_SLICES {
            let n = self.transport.read_some(&mut chunk)?;
            if n == 0 {
                continue;
            }
            raw += n;
            decoder.push_all(&chunk[..n]);
            if decoder.is_complete() {
                break;
            }
        }
        if !decoder.is_complete() {
            return Err(BmsError::Timeout { wanted: want, got: raw });
        }
        decoder.finish()
    }

    /// Drop all buffered input; the resync primitive after a framing
    /// or CRC failure.
    pub fn flush_pending(&mut self) -> Result<()> {
        self.transport.clear_input()
    }

    /// Send a run of wake bytes and wait for the slaves to come out of
    /// power-save. They drop characters while waking, hence the settle.
    pub fn wake(&mut self) -> Result<()> {
        for _ in 0..4 {
            self.transport.write_all(&[0x00])?;
            thread::sleep(self.pacing);
        }
        thread::sleep(Duration::from_millis(WAKE_SETTLE_MS));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    #[cfg(test)]
    pub(crate) fn without_pacing(transport: T) -> Self {
        SlaveLink {
            transport,
            pacing: Duration::ZERO,
        }
    }
}

/// Scripted request/response transport for unit tests.
///
/// Each queued reply becomes readable only after a fresh command burst
/// has been written, so one exchange can never swallow the reply
/// scripted for the next one.
#[cfg(test)]
pub(crate) struct MockTransport {
    pub written: Vec<u8>,
    pub cleared: usize,
    script: std::collections::VecDeque<Vec<u8>>,
    pending: std::collections::VecDeque<u8>,
    armed: usize,
    idle: bool,
}

#[cfg(test)]
impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            written: Vec::new(),
            cleared: 0,
            script: std::collections::VecDeque::new(),
            pending: std::collections::VecDeque::new(),
            armed: 0,
            idle: true,
        }
    }

    /// Queue a reply released by the next command burst.
    pub fn expect_reply(&mut self, bytes: Vec<u8>) {
        self.script.push_back(bytes);
    }

    /// Make bytes readable immediately, with no command required.
    pub fn push_readable(&mut self, bytes: Vec<u8>) {
        self.pending.extend(bytes);
    }

    pub fn bytes_written(&self) -> usize {
        self.written.len()
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.idle {
            // a write after a read (or at the start) opens a new exchange
            self.armed += 1;
            self.idle = false;
        }
        self.written.extend_from_slice(buf);
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.idle = true;
        if self.pending.is_empty() && self.armed > 0 {
            if let Some(next) = self.script.pop_front() {
                self.pending.extend(next);
            }
            self.armed -= 1;
        }
        let mut n = 0;
        while n < buf.len() {
            match self.pending.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.cleared += 1;
        self.idle = true;
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_reply;

    #[test]
    fn read_frame_decodes_scripted_reply() {
        let payload = [5u8, 0, 1, 0x10, 0x27];
        let mut mock = MockTransport::new();
        mock.push_readable(encode_reply(&payload));
        let mut link = SlaveLink::without_pacing(mock);
        let decoded = link.read_frame(payload.len() + 2).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn read_frame_times_out_with_byte_count() {
        let mut mock = MockTransport::new();
        mock.push_readable(vec![0xFE, 0x01, 0x02]); // truncated frame
        let mut link = SlaveLink::without_pacing(mock);
        match link.read_frame(9) {
            Err(BmsError::Timeout { wanted: 9, got: 3 }) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn read_frame_reports_zero_bytes_on_silent_bus() {
        let mut link = SlaveLink::without_pacing(MockTransport::new());
        match link.read_frame(9) {
            Err(BmsError::Timeout { got: 0, .. }) => {}
            other => panic!("expected empty Timeout, got {other:?}"),
        }
    }

    #[test]
    fn short_read_returns_actual_count() {
        let mut mock = MockTransport::new();
        mock.push_readable(vec![1, 2, 3]);
        let mut link = SlaveLink::without_pacing(mock);
        let got = link.read_exact(10).unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn flush_discards_pending_input() {
        let mut mock = MockTransport::new();
        mock.push_readable(vec![1, 2, 3]);
        let mut link = SlaveLink::without_pacing(mock);
        link.flush_pending().unwrap();
        assert!(link.read_exact(1).unwrap().is_empty());
        assert_eq!(link.transport().cleared, 1);
    }

    #[test]
    fn send_command_writes_whole_frame() {
        let mut link = SlaveLink::without_pacing(MockTransport::new());
        link.send_command(7, b's').unwrap();
        let expected = crate::frame::encode_command(7, b's');
        assert_eq!(link.transport().written, expected);
    }
}
