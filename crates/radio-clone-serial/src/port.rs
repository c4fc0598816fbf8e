//! Hardware serial links through the `serialport` crate.

use std::{
    io::{self, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use bytes::Bytes;
use radio_clone_core::TransportError;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use tokio::sync::mpsc;

use crate::link::{LinkControl, LinkParts, LinkProvider};

/// How long the reader thread blocks before re-checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Opens a named serial device (e.g. `/dev/ttyUSB0`, `COM3`) at 8N1.
#[derive(Debug, Clone)]
pub struct SerialPortProvider {
    path: String,
}

impl SerialPortProvider {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl LinkProvider for SerialPortProvider {
    fn open(&self, baud_rate: u32) -> Result<LinkParts, TransportError> {
        let port = serialport::new(&self.path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(|e| TransportError::Unavailable(format!("{}: {e}", self.path)))?;
        let reader = port
            .try_clone()
            .map_err(|e| TransportError::Unavailable(format!("{}: {e}", self.path)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let reader_stop = Arc::clone(&stop);
        let reader_thread = std::thread::Builder::new()
            .name("serial-rx".to_string())
            .spawn(move || read_loop(reader, &tx, &reader_stop))
            .map_err(TransportError::Io)?;

        tracing::debug!(path = %self.path, baud_rate, "serial port opened");

        Ok(LinkParts {
            inbound: rx,
            control: Box::new(SerialPortLink {
                port,
                stop,
                reader_thread: Some(reader_thread),
            }),
        })
    }
}

fn read_loop(mut reader: Box<dyn SerialPort>, tx: &mpsc::UnboundedSender<Bytes>, stop: &AtomicBool) {
    let mut buf = [0u8; 256];
    while !stop.load(Ordering::Relaxed) {
        match reader.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::warn!("Serial read failed: {e}");
                break;
            }
        }
    }
}

struct SerialPortLink {
    port: Box<dyn SerialPort>,
    stop: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
}

impl LinkControl for SerialPortLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port
            .write_data_terminal_ready(level)
            .map_err(io::Error::from)
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.port.write_request_to_send(level).map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader_thread.take() {
            if handle.join().is_err() {
                tracing::warn!("Serial reader thread panicked");
            }
        }
    }
}

impl Drop for SerialPortLink {
    fn drop(&mut self) {
        self.close();
    }
}
