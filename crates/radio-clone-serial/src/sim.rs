//! Deterministic simulated radio speaking the block clone protocol.
//!
//! Host writes are parsed synchronously and replies are pushed onto the
//! inbound channel, so a session against this link behaves like a radio
//! on a perfect cable. Faults can be injected per block address.

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use radio_clone_core::{ACK, ControlLines, NAK, TransportError};
use tokio::sync::mpsc;

use crate::link::{LinkControl, LinkParts, LinkProvider};

const BREAK: u8 = 0x02;

/// A command the simulated radio recognised, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCommand {
    Break,
    Program,
    IdentAck,
    Read(u16),
    Write(u16),
    Exit,
    Unexpected(u8),
}

impl SimCommand {
    /// Whether this is a block read or write command.
    #[must_use]
    pub const fn is_block(&self) -> bool {
        matches!(self, Self::Read(_) | Self::Write(_))
    }
}

/// Misbehaviour to inject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    /// Answer the program command with NAK.
    pub refuse_enter: bool,
    /// Answer the ident ACK with NAK.
    pub refuse_ident_ack: bool,
    /// NAK the write block at this address.
    pub nak_write_at: Option<u16>,
    /// Send only half of the read block at this address, then go quiet.
    pub stall_read_at: Option<u16>,
    /// Send a wrong echo header for the read block at this address.
    pub corrupt_read_at: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitProgram,
    Entered,
    AwaitIdentAck,
    Ready,
    AwaitReadAck,
}

struct SimState {
    program_command: Vec<u8>,
    ident: Vec<u8>,
    memory: Vec<u8>,
    faults: Faults,
    unplugged: bool,
    phase: Phase,
    pending: Vec<u8>,
    log: Vec<SimCommand>,
    lines: Option<ControlLines>,
    baud_rate: Option<u32>,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
}

impl SimState {
    fn reply(&self, bytes: &[u8]) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(Bytes::copy_from_slice(bytes));
        }
    }

    fn feed(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        while self.step() {}
    }

    /// Consume one unit from `pending`. Returns false when more bytes are needed.
    fn step(&mut self) -> bool {
        let Some(&first) = self.pending.first() else {
            return false;
        };

        if first == b'E' && self.phase != Phase::AwaitProgram {
            self.consume(1);
            self.log.push(SimCommand::Exit);
            self.phase = Phase::Idle;
            return true;
        }

        match self.phase {
            Phase::Idle => {
                self.consume(1);
                if first == BREAK {
                    self.log.push(SimCommand::Break);
                    self.phase = Phase::AwaitProgram;
                } else {
                    self.log.push(SimCommand::Unexpected(first));
                }
                true
            }
            Phase::AwaitProgram => {
                let want = self.program_command.len();
                let have = self.pending.len().min(want);
                if self.pending[..have] != self.program_command[..have] {
                    self.consume(1);
                    self.log.push(if first == b'E' {
                        SimCommand::Exit
                    } else {
                        SimCommand::Unexpected(first)
                    });
                    self.phase = Phase::Idle;
                    return true;
                }
                if have < want {
                    return false;
                }
                self.consume(want);
                self.log.push(SimCommand::Program);
                if self.faults.refuse_enter {
                    self.reply(&[NAK]);
                    self.phase = Phase::Idle;
                } else {
                    self.reply(&[ACK]);
                    self.phase = Phase::Entered;
                }
                true
            }
            Phase::Entered => {
                self.consume(1);
                if first == BREAK {
                    self.log.push(SimCommand::Break);
                    let ident = self.ident.clone();
                    self.reply(&ident);
                    self.phase = Phase::AwaitIdentAck;
                } else {
                    self.log.push(SimCommand::Unexpected(first));
                }
                true
            }
            Phase::AwaitIdentAck => {
                self.consume(1);
                if first == ACK {
                    self.log.push(SimCommand::IdentAck);
                    if self.faults.refuse_ident_ack {
                        self.reply(&[NAK]);
                        self.phase = Phase::Idle;
                    } else {
                        self.reply(&[ACK]);
                        self.phase = Phase::Ready;
                    }
                } else {
                    self.log.push(SimCommand::Unexpected(first));
                }
                true
            }
            Phase::Ready => self.block_command(first),
            Phase::AwaitReadAck => {
                self.consume(1);
                if first == ACK {
                    self.reply(&[ACK]);
                    self.phase = Phase::Ready;
                } else {
                    self.log.push(SimCommand::Unexpected(first));
                }
                true
            }
        }
    }

    fn block_command(&mut self, command: u8) -> bool {
        if command != b'R' && command != b'W' {
            self.consume(1);
            self.log.push(SimCommand::Unexpected(command));
            return true;
        }
        if self.pending.len() < 4 {
            return false;
        }
        let address = u16::from_be_bytes([self.pending[1], self.pending[2]]);
        let length = usize::from(self.pending[3]);

        if command == b'R' {
            self.consume(4);
            self.log.push(SimCommand::Read(address));
            let payload = self.slice(address, length);
            let echo = if self.faults.corrupt_read_at == Some(address) {
                b'X'
            } else {
                b'W'
            };
            let mut response = vec![echo];
            response.extend_from_slice(&header(address, length));
            if self.faults.stall_read_at == Some(address) {
                response.extend_from_slice(&payload[..length / 2]);
                self.reply(&response);
                self.phase = Phase::Ready;
            } else {
                response.extend_from_slice(&payload);
                self.reply(&response);
                self.phase = Phase::AwaitReadAck;
            }
            return true;
        }

        if self.pending.len() < 4 + length {
            return false;
        }
        let payload: Vec<u8> = self.pending[4..4 + length].to_vec();
        self.consume(4 + length);
        self.log.push(SimCommand::Write(address));
        if self.faults.nak_write_at == Some(address) {
            self.reply(&[NAK]);
            return true;
        }
        let start = usize::from(address);
        let end = (start + length).min(self.memory.len());
        if start < end {
            self.memory[start..end].copy_from_slice(&payload[..end - start]);
        }
        self.reply(&[ACK]);
        true
    }

    fn slice(&self, address: u16, length: usize) -> Vec<u8> {
        let start = usize::from(address);
        (start..start + length)
            .map(|i| self.memory.get(i).copied().unwrap_or(0xFF))
            .collect()
    }

    fn consume(&mut self, n: usize) {
        self.pending.drain(..n.min(self.pending.len()));
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn header(address: u16, length: usize) -> [u8; 3] {
    let [hi, lo] = address.to_be_bytes();
    [hi, lo, length as u8]
}

/// Simulated radio; clones share the same device.
#[derive(Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRadio {
    /// A radio that enters programming mode on `program_command`, answers
    /// with `ident`, and holds `memory`.
    #[must_use]
    pub fn new(program_command: &[u8], ident: &[u8], memory: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                program_command: program_command.to_vec(),
                ident: ident.to_vec(),
                memory,
                faults: Faults::default(),
                unplugged: false,
                phase: Phase::Idle,
                pending: Vec::new(),
                log: Vec::new(),
                lines: None,
                baud_rate: None,
                outbound: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Replace the injected faults.
    pub fn set_faults(&self, faults: Faults) {
        self.lock().faults = faults;
    }

    /// Simulate a missing device: subsequent opens fail.
    pub fn set_unplugged(&self, unplugged: bool) {
        self.lock().unplugged = unplugged;
    }

    #[must_use]
    pub fn memory(&self) -> Vec<u8> {
        self.lock().memory.clone()
    }

    pub fn set_memory(&self, memory: Vec<u8>) {
        self.lock().memory = memory;
    }

    /// Commands received so far.
    #[must_use]
    pub fn commands(&self) -> Vec<SimCommand> {
        self.lock().log.clone()
    }

    /// Number of received commands matching `pred`.
    pub fn count(&self, pred: impl Fn(&SimCommand) -> bool) -> usize {
        self.lock().log.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Last control line levels the host set.
    #[must_use]
    pub fn lines(&self) -> Option<ControlLines> {
        self.lock().lines
    }

    /// Baud rate of the most recent open.
    #[must_use]
    pub fn baud_rate(&self) -> Option<u32> {
        self.lock().baud_rate
    }
}

impl LinkProvider for SimulatedRadio {
    fn open(&self, baud_rate: u32) -> Result<LinkParts, TransportError> {
        let mut state = self.lock();
        if state.unplugged {
            return Err(TransportError::Unavailable(
                "simulated radio is unplugged".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.outbound = Some(tx);
        state.baud_rate = Some(baud_rate);
        state.phase = Phase::Idle;
        state.pending.clear();
        drop(state);

        Ok(LinkParts {
            inbound: rx,
            control: Box::new(SimLink { radio: self.clone() }),
        })
    }
}

struct SimLink {
    radio: SimulatedRadio,
}

impl LinkControl for SimLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.radio.lock().feed(data);
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        let mut state = self.radio.lock();
        let rts = state.lines.map_or(true, |l| l.rts);
        state.lines = Some(ControlLines { dtr: level, rts });
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        let mut state = self.radio.lock();
        let dtr = state.lines.map_or(true, |l| l.dtr);
        state.lines = Some(ControlLines { dtr, rts: level });
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.radio.lock();
        state.outbound = None;
        state.phase = Phase::Idle;
        state.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn radio() -> SimulatedRadio {
        SimulatedRadio::new(b"PROGRAM", b"P3107\x01\x00\x00", (0..32).collect())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn test_full_handshake_and_read() {
        let radio = radio();
        let LinkParts {
            mut inbound,
            mut control,
        } = radio.open(9600).unwrap();

        control.write_all(&[BREAK]).unwrap();
        control.write_all(b"PROG").unwrap();
        assert!(drain(&mut inbound).is_empty());
        control.write_all(b"RAM").unwrap();
        assert_eq!(drain(&mut inbound), vec![ACK]);

        control.write_all(&[BREAK]).unwrap();
        assert_eq!(drain(&mut inbound), b"P3107\x01\x00\x00");
        control.write_all(&[ACK]).unwrap();
        assert_eq!(drain(&mut inbound), vec![ACK]);

        control.write_all(&[b'R', 0x00, 0x08, 0x08]).unwrap();
        let response = drain(&mut inbound);
        assert_eq!(&response[..4], &[b'W', 0x00, 0x08, 0x08]);
        assert_eq!(&response[4..], &[8, 9, 10, 11, 12, 13, 14, 15]);

        control.write_all(&[ACK, b'E']).unwrap();
        assert_eq!(drain(&mut inbound), vec![ACK]);
        assert_eq!(
            radio.commands(),
            vec![
                SimCommand::Break,
                SimCommand::Program,
                SimCommand::Break,
                SimCommand::IdentAck,
                SimCommand::Read(0x0008),
                SimCommand::Exit,
            ]
        );
    }

    #[test]
    fn test_write_nak_fault_leaves_memory() {
        let radio = radio();
        radio.set_faults(Faults {
            nak_write_at: Some(0x10),
            ..Faults::default()
        });
        let LinkParts {
            mut inbound,
            mut control,
        } = radio.open(9600).unwrap();
        control.write_all(&[BREAK]).unwrap();
        control.write_all(b"PROGRAM").unwrap();
        control.write_all(&[BREAK, ACK]).unwrap();
        drain(&mut inbound);

        let mut cmd = vec![b'W', 0x00, 0x00, 0x04];
        cmd.extend_from_slice(&[0xAA; 4]);
        control.write_all(&cmd).unwrap();
        assert_eq!(drain(&mut inbound), vec![ACK]);

        let mut cmd = vec![b'W', 0x00, 0x10, 0x04];
        cmd.extend_from_slice(&[0xBB; 4]);
        control.write_all(&cmd).unwrap();
        assert_eq!(drain(&mut inbound), vec![NAK]);

        let memory = radio.memory();
        assert_eq!(&memory[..4], &[0xAA; 4]);
        assert_eq!(&memory[0x10..0x14], &[0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn test_unplugged_open_fails() {
        let radio = radio();
        radio.set_unplugged(true);
        assert!(matches!(
            radio.open(9600),
            Err(TransportError::Unavailable(_))
        ));
    }
}
