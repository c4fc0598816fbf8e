//! Block clone protocol state machine.
//!
//! One engine runs one operation at a time against an injected
//! `CloneTransport`: enter programming mode, check the ident, move blocks,
//! then always send the exit command.

use std::sync::Arc;

use radio_clone_core::{
    ACK, BlockSpan, CloneError, CloneImage, CloneTiming, CloneTransport, ProgressStore,
    TransportError,
};
use serde::Serialize;

use crate::family::DeviceFamily;

const BREAK: u8 = 0x02;
const READ: u8 = b'R';
const WRITE: u8 = b'W';
const EXIT: u8 = b'E';

/// Length of the identification reply.
pub const IDENT_LEN: usize = 8;

/// Engine state. Every operation starts and ends outside programming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Entering,
    Identified,
    Reading,
    Writing,
    Exiting,
    Failed,
}

/// Scoped programming mode.
///
/// `exit` sends the exit command. If the guard is dropped without it (the
/// operation future was cancelled), the command is sent from a spawned task.
#[must_use = "programming mode must be exited"]
pub struct ProgrammingMode {
    transport: Arc<dyn CloneTransport>,
    armed: bool,
}

impl ProgrammingMode {
    pub fn new(transport: Arc<dyn CloneTransport>) -> Self {
        Self {
            transport,
            armed: true,
        }
    }

    /// Send the exit command.
    ///
    /// # Errors
    /// Returns the transport error if the write fails.
    pub async fn exit(mut self) -> Result<(), TransportError> {
        self.armed = false;
        self.transport.write_bytes(&[EXIT]).await.map(|_| ())
    }
}

impl Drop for ProgrammingMode {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let transport = Arc::clone(&self.transport);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.write_bytes(&[EXIT]).await {
                        tracing::warn!("Failed to leave programming mode: {e}");
                    }
                });
            }
            Err(_) => tracing::warn!("No runtime to leave programming mode"),
        }
    }
}

/// Drives one device family over one transport.
pub struct CloneEngine {
    transport: Arc<dyn CloneTransport>,
    family: Arc<DeviceFamily>,
    timing: CloneTiming,
    progress: Option<Arc<ProgressStore>>,
    history: Vec<EngineState>,
}

impl CloneEngine {
    #[must_use]
    pub fn new(transport: Arc<dyn CloneTransport>, family: Arc<DeviceFamily>, timing: CloneTiming) -> Self {
        Self {
            transport,
            family,
            timing,
            progress: None,
            history: vec![EngineState::Idle],
        }
    }

    /// Publish per-block progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<ProgressStore>) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn family(&self) -> &DeviceFamily {
        &self.family
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.history.last().copied().unwrap_or(EngineState::Idle)
    }

    /// States visited by the last operation, starting at `Idle`.
    #[must_use]
    pub fn history(&self) -> &[EngineState] {
        &self.history
    }

    /// Read the full memory image.
    ///
    /// # Errors
    /// Any protocol or transport failure. The exit command is sent either way.
    pub async fn download(&mut self) -> Result<CloneImage, CloneError> {
        self.begin();
        let mode = ProgrammingMode::new(Arc::clone(&self.transport));
        let result = self.download_blocks().await;
        self.finish(mode, result).await
    }

    /// Write `image` over the family's write ranges.
    ///
    /// # Errors
    /// `InvalidImage` before any I/O when the image does not belong to this
    /// family; otherwise any protocol or transport failure.
    pub async fn upload(&mut self, image: &CloneImage) -> Result<(), CloneError> {
        if image.key() != &self.family.key {
            return Err(CloneError::InvalidImage(format!(
                "image is for {}, not {}",
                image.key(),
                self.family.key
            )));
        }
        if image.size() != self.family.memory_size {
            return Err(CloneError::InvalidImage(format!(
                "image is {} bytes, {} expects {}",
                image.size(),
                self.family.key,
                self.family.memory_size
            )));
        }

        self.begin();
        let mode = ProgrammingMode::new(Arc::clone(&self.transport));
        let result = self.upload_blocks(image.bytes()).await;
        self.finish(mode, result).await
    }

    fn begin(&mut self) {
        self.history.clear();
        self.history.push(EngineState::Idle);
    }

    fn transition(&mut self, next: EngineState) {
        tracing::debug!(from = ?self.state(), to = ?next, "Clone state");
        self.history.push(next);
    }

    async fn finish<T>(
        &mut self,
        mode: ProgrammingMode,
        result: Result<T, CloneError>,
    ) -> Result<T, CloneError> {
        self.transition(EngineState::Exiting);
        if let Err(e) = mode.exit().await {
            tracing::warn!("Failed to send exit command: {e}");
        }
        match &result {
            Ok(_) => self.transition(EngineState::Idle),
            Err(e) => {
                tracing::warn!(key = %self.family.key, "Clone operation failed: {e}");
                self.transition(EngineState::Failed);
            }
        }
        if let Some(progress) = &self.progress {
            progress.push_finished(result.is_ok());
        }
        result
    }

    async fn download_blocks(&mut self) -> Result<CloneImage, CloneError> {
        self.enter().await?;
        self.identify().await?;
        self.transition(EngineState::Reading);

        let plan = self.family.read_plan();
        let mut bytes = Vec::with_capacity(self.family.memory_size);
        for (done, span) in plan.iter().enumerate() {
            let payload = self.read_block(*span).await?;
            bytes.extend_from_slice(&payload);
            tracing::debug!(address = span.address, length = span.length, "Read block");
            self.status("Cloning from radio", done + 1, plan.len());
        }

        tracing::info!(key = %self.family.key, size = bytes.len(), "Downloaded image");
        CloneImage::new(self.family.key.clone(), bytes, self.family.memory_size)
    }

    async fn upload_blocks(&mut self, image: &[u8]) -> Result<(), CloneError> {
        self.enter().await?;
        self.identify().await?;
        self.transition(EngineState::Writing);

        let plan = self.family.write_plan();
        for (done, span) in plan.iter().enumerate() {
            let start = usize::from(span.address);
            let payload = &image[start..start + usize::from(span.length)];
            self.write_block(*span, payload).await?;
            tracing::debug!(address = span.address, length = span.length, "Wrote block");
            self.status("Cloning to radio", done + 1, plan.len());
        }

        tracing::info!(key = %self.family.key, blocks = plan.len(), "Uploaded image");
        Ok(())
    }

    async fn enter(&mut self) -> Result<(), CloneError> {
        self.transition(EngineState::Entering);
        self.send(&[BREAK]).await?;
        if !self.timing.enter_pause.is_zero() {
            tokio::time::sleep(self.timing.enter_pause).await;
        }
        self.send(&self.family.program_command).await?;

        let reply = self.recv(1).await?;
        if reply.as_slice() != [ACK] {
            return Err(CloneError::ProtocolRefused(format!(
                "expected ACK after program command, got {}",
                describe(&reply)
            )));
        }
        Ok(())
    }

    async fn identify(&mut self) -> Result<(), CloneError> {
        self.send(&[BREAK]).await?;
        let outcome = self
            .transport
            .read_bytes(IDENT_LEN, self.timing.read_timeout)
            .await?;
        if outcome.bytes.len() < IDENT_LEN {
            return Err(CloneError::Timeout {
                partial: outcome.bytes,
            });
        }
        if !self.family.matches_ident(&outcome.bytes) {
            return Err(CloneError::IdentMismatch {
                ident: outcome.bytes,
            });
        }

        self.send(&[ACK]).await?;
        let reply = self.recv(1).await?;
        if reply.as_slice() != [ACK] {
            return Err(CloneError::ProtocolRefused(format!(
                "ident not acknowledged, got {}",
                describe(&reply)
            )));
        }
        tracing::debug!(ident = ?outcome.bytes, "Radio identified");
        self.transition(EngineState::Identified);
        Ok(())
    }

    async fn read_block(&self, span: BlockSpan) -> Result<Vec<u8>, CloneError> {
        let failed = || CloneError::BlockReadFailed {
            address: span.address,
        };
        let header = span.header();
        let mut command = vec![READ];
        command.extend_from_slice(&header);
        self.send(&command).await?;

        let length = usize::from(span.length);
        let mut response = self.recv(4 + length).await?;
        if response.len() < 4 + length || response[0] != WRITE || response[1..4] != header {
            tracing::debug!(
                address = span.address,
                got = response.len(),
                "Bad block response"
            );
            return Err(failed());
        }

        self.send(&[ACK]).await?;
        if self.recv(1).await?.as_slice() != [ACK] {
            return Err(failed());
        }
        Ok(response.split_off(4))
    }

    async fn write_block(&self, span: BlockSpan, payload: &[u8]) -> Result<(), CloneError> {
        let mut command = Vec::with_capacity(4 + payload.len());
        command.push(WRITE);
        command.extend_from_slice(&span.header());
        command.extend_from_slice(payload);
        self.send(&command).await?;

        if self.recv(1).await?.as_slice() != [ACK] {
            return Err(CloneError::BlockWriteFailed {
                address: span.address,
            });
        }
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), CloneError> {
        self.transport.write_bytes(bytes).await?;
        Ok(())
    }

    async fn recv(&self, count: usize) -> Result<Vec<u8>, CloneError> {
        Ok(self
            .transport
            .read_bytes(count, self.timing.read_timeout)
            .await?
            .bytes)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn status(&self, message: &str, current: usize, max: usize) {
        if let Some(progress) = &self.progress {
            progress.push_status(message, current as u32, max as u32);
        }
    }
}

fn describe(bytes: &[u8]) -> String {
    match bytes {
        [] => "nothing".to_string(),
        [b] => format!("{b:#04x}"),
        _ => format!("{} bytes", bytes.len()),
    }
}
