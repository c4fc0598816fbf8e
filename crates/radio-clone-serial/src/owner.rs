//! The transport owner: one serial session, buffered reads, serialized writes.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use radio_clone_core::{CloneTransport, ControlLines, ReadOutcome, SessionInfo, TransportError};
use tokio::{
    sync::{Mutex, Notify, mpsc},
    task::JoinHandle,
    time::Instant,
};

use crate::link::{LinkControl, LinkProvider};

type SharedLink = Arc<StdMutex<Box<dyn LinkControl>>>;

/// Inbound FIFO. Appended only by the accumulation task, drained only by reads.
#[derive(Default)]
struct ReadBuffer {
    bytes: StdMutex<VecDeque<u8>>,
    notify: Notify,
}

impl ReadBuffer {
    fn append(&self, chunk: &[u8]) {
        if let Ok(mut bytes) = self.bytes.lock() {
            bytes.extend(chunk);
        }
        self.notify.notify_one();
    }

    fn take(&self, max: usize) -> Vec<u8> {
        let Ok(mut bytes) = self.bytes.lock() else {
            return Vec::new();
        };
        let n = max.min(bytes.len());
        bytes.drain(..n).collect()
    }

    fn clear(&self) {
        if let Ok(mut bytes) = self.bytes.lock() {
            bytes.clear();
        }
    }
}

struct SerialSession {
    info: SessionInfo,
    buffer: Arc<ReadBuffer>,
    link: SharedLink,
    pump: JoinHandle<()>,
}

/// Exclusive owner of the physical channel.
///
/// At most one session is open at a time. Writes and line changes are
/// serialized so bytes from different callers never interleave; reads are
/// serialized separately and never fail on a missed deadline.
pub struct TransportOwner {
    provider: Arc<dyn LinkProvider>,
    session: Mutex<Option<SerialSession>>,
    io: Mutex<()>,
    reads: Mutex<()>,
}

impl TransportOwner {
    /// Create an owner that opens links through `provider`.
    #[must_use]
    pub fn new(provider: impl LinkProvider + 'static) -> Self {
        Self::with_provider(Arc::new(provider))
    }

    #[must_use]
    pub fn with_provider(provider: Arc<dyn LinkProvider>) -> Self {
        Self {
            provider,
            session: Mutex::new(None),
            io: Mutex::new(()),
            reads: Mutex::new(()),
        }
    }

    /// Whether a session is open.
    pub async fn is_open(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Info for the open session.
    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.session.lock().await.as_ref().map(|s| s.info)
    }

    async fn handles(&self) -> Result<(SharedLink, Arc<ReadBuffer>), TransportError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| (Arc::clone(&s.link), Arc::clone(&s.buffer)))
            .ok_or(TransportError::NotConnected)
    }
}

async fn accumulate(mut inbound: mpsc::UnboundedReceiver<Bytes>, buffer: Arc<ReadBuffer>) {
    while let Some(chunk) = inbound.recv().await {
        buffer.append(&chunk);
    }
    tracing::debug!("Serial inbound feed ended");
}

/// Run `f` against the link on the blocking pool.
async fn on_link<T, F>(link: SharedLink, f: F) -> Result<T, TransportError>
where
    F: FnOnce(&mut dyn LinkControl) -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = link
            .lock()
            .map_err(|_| io::Error::other("serial link lock poisoned"))?;
        f(&mut **guard)
    })
    .await
    .map_err(|e| TransportError::Io(io::Error::other(e)))?
    .map_err(TransportError::Io)
}

#[async_trait]
impl CloneTransport for TransportOwner {
    async fn open(&self, baud_rate: u32) -> Result<SessionInfo, TransportError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        let provider = Arc::clone(&self.provider);
        let parts = tokio::task::spawn_blocking(move || provider.open(baud_rate))
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))??;

        let buffer = Arc::new(ReadBuffer::default());
        let pump = tokio::spawn(accumulate(parts.inbound, Arc::clone(&buffer)));
        let info = SessionInfo { baud_rate };
        *session = Some(SerialSession {
            info,
            buffer,
            link: Arc::new(StdMutex::new(parts.control)),
            pump,
        });

        tracing::info!(baud_rate, "Serial session opened");
        Ok(info)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session.pump.abort();
        on_link(session.link, |link| {
            link.close();
            Ok(())
        })
        .await?;
        tracing::info!("Serial session closed");
        Ok(())
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        let (link, _) = self.handles().await?;
        let _io = self.io.lock().await;
        let data = bytes.to_vec();
        let written = data.len();
        on_link(link, move |link| link.write_all(&data)).await?;
        tracing::trace!(written, "Serial write");
        Ok(written)
    }

    async fn read_bytes(&self, count: usize, timeout: Duration) -> Result<ReadOutcome, TransportError> {
        let (_, buffer) = self.handles().await?;
        let _reader = self.reads.lock().await;
        let deadline = Instant::now() + timeout;
        let mut bytes = Vec::with_capacity(count);

        loop {
            bytes.extend(buffer.take(count - bytes.len()));
            if bytes.len() >= count {
                return Ok(ReadOutcome {
                    bytes,
                    timed_out: false,
                });
            }
            if tokio::time::timeout_at(deadline, buffer.notify.notified())
                .await
                .is_err()
            {
                bytes.extend(buffer.take(count - bytes.len()));
                let timed_out = bytes.len() < count;
                if timed_out {
                    tracing::debug!(wanted = count, got = bytes.len(), "Serial read timed out");
                }
                return Ok(ReadOutcome { bytes, timed_out });
            }
        }
    }

    async fn prepare_clone(&self, lines: ControlLines, settle: Duration) -> Result<(), TransportError> {
        let (link, buffer) = self.handles().await?;
        let _io = self.io.lock().await;
        on_link(link, move |link| {
            link.clear_input()?;
            link.set_dtr(lines.dtr)?;
            link.set_rts(lines.rts)
        })
        .await?;
        buffer.clear();
        tracing::debug!(dtr = lines.dtr, rts = lines.rts, ?settle, "Preparing clone session");
        tokio::time::sleep(settle).await;
        Ok(())
    }

    async fn reset_input(&self) -> Result<(), TransportError> {
        let (link, buffer) = self.handles().await?;
        let _io = self.io.lock().await;
        on_link(link, |link| link.clear_input()).await?;
        buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::sim::{SimCommand, SimulatedRadio};

    fn owner() -> (TransportOwner, SimulatedRadio) {
        let radio = SimulatedRadio::new(b"PROGRAM", b"P3107\x01\x00\x00", vec![0x5A; 64]);
        (TransportOwner::new(radio.clone()), radio)
    }

    #[tokio::test]
    async fn test_single_session() {
        let (owner, radio) = owner();
        assert_ok!(owner.open(9600).await);
        assert!(matches!(
            owner.open(9600).await,
            Err(TransportError::AlreadyOpen)
        ));
        assert_eq!(radio.baud_rate(), Some(9600));

        assert_ok!(owner.close().await);
        assert_ok!(owner.close().await);
        assert!(!owner.is_open().await);
        assert_ok!(owner.open(19200).await);
        assert_eq!(owner.session_info().await, Some(SessionInfo { baud_rate: 19200 }));
    }

    #[tokio::test]
    async fn test_operations_require_session() {
        let (owner, _) = owner();
        assert!(matches!(
            owner.write_bytes(b"E").await,
            Err(TransportError::NotConnected)
        ));
        assert_err!(owner.read_bytes(1, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_unavailable_device() {
        let (owner, radio) = owner();
        radio.set_unplugged(true);
        assert!(matches!(
            owner.open(9600).await,
            Err(TransportError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_read_returns_partial_on_timeout() {
        let (owner, _) = owner();
        owner.open(9600).await.unwrap();

        owner.write_bytes(&[0x02]).await.unwrap();
        owner.write_bytes(b"PROGRAM").await.unwrap();
        let ack = owner.read_bytes(1, Duration::from_millis(200)).await.unwrap();
        assert_eq!(ack.bytes, vec![0x06]);
        assert!(!ack.timed_out);

        owner.write_bytes(&[0x02]).await.unwrap();
        let ident = owner.read_bytes(12, Duration::from_millis(30)).await.unwrap();
        assert!(ident.timed_out);
        assert_eq!(ident.bytes, b"P3107\x01\x00\x00");
    }

    #[tokio::test]
    async fn test_zero_length_read_is_immediate() {
        let (owner, _) = owner();
        owner.open(9600).await.unwrap();
        let outcome = owner.read_bytes(0, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::default());
    }

    #[tokio::test]
    async fn test_prepare_clone_sets_lines_and_clears_buffer() {
        let (owner, radio) = owner();
        owner.open(9600).await.unwrap();

        owner.write_bytes(&[0x02]).await.unwrap();
        owner.write_bytes(b"PROGRAM").await.unwrap();
        owner.read_bytes(1, Duration::from_millis(200)).await.unwrap();
        owner.write_bytes(&[0x02]).await.unwrap();
        let first = owner.read_bytes(1, Duration::from_millis(200)).await.unwrap();
        assert_eq!(first.bytes, b"P");

        let lines = ControlLines {
            dtr: false,
            rts: true,
        };
        owner.prepare_clone(lines, Duration::ZERO).await.unwrap();
        assert_eq!(radio.lines(), Some(lines));

        let outcome = owner.read_bytes(1, Duration::from_millis(20)).await.unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.bytes.is_empty());
        assert_eq!(
            radio.commands(),
            vec![SimCommand::Break, SimCommand::Program, SimCommand::Break]
        );
    }

    #[tokio::test]
    async fn test_reset_input_drops_pending_bytes() {
        let (owner, _) = owner();
        assert!(matches!(
            owner.reset_input().await,
            Err(TransportError::NotConnected)
        ));
        owner.open(9600).await.unwrap();

        owner.write_bytes(&[0x02]).await.unwrap();
        owner.write_bytes(b"PROGRAM").await.unwrap();
        owner.read_bytes(1, Duration::from_millis(200)).await.unwrap();
        owner.write_bytes(&[0x02]).await.unwrap();
        let first = owner.read_bytes(1, Duration::from_millis(200)).await.unwrap();
        assert_eq!(first.bytes, b"P");

        assert_ok!(owner.reset_input().await);
        let outcome = owner.read_bytes(1, Duration::from_millis(20)).await.unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.bytes.is_empty());
    }

    #[tokio::test]
    async fn test_close_stops_accumulation() {
        let (owner, _) = owner();
        owner.open(9600).await.unwrap();
        owner.close().await.unwrap();
        assert!(matches!(
            owner.read_bytes(1, Duration::from_millis(5)).await,
            Err(TransportError::NotConnected)
        ));
    }
}
