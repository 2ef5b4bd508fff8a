//! Logical channels over one physical stream.
//!
//! Frame layout: `channel(1B) kind(1B) length(4B) payload`. Channel 0 carries
//! the command channel, channel 1 the DataStore envelopes, every other id is
//! handed out for process side channels.

use crate::error::{DStoreError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const COMMAND_CHANNEL: u8 = 0;
pub const DATASTORE_CHANNEL: u8 = 1;
const FIRST_SIDE_CHANNEL: u8 = 2;

const FRAME_DATA: u8 = 0;
const FRAME_EOF: u8 = 1;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
/// Frames held for a channel nobody has opened yet.
const MAX_EARLY_FRAMES: usize = 256;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct Slot {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    opened: bool,
    early: usize,
}

impl Slot {
    fn fresh() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
            opened: false,
            early: 0,
        }
    }
}

struct Routes {
    slots: HashMap<u8, Slot>,
    /// Ids dropped on this side whose peer has not sent EOF yet. Their
    /// frames are discarded.
    retired: HashSet<u8>,
    next_id: u8,
}

/// Write side shared by every logical channel of one stream.
#[derive(Clone)]
pub struct MuxWriter {
    inner: Arc<TokioMutex<BoxedWriter>>,
    closed: CancellationToken,
}

impl MuxWriter {
    async fn write_frame(&self, channel: u8, kind: u8, payload: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(DStoreError::Transport("connection closed".to_string()));
        }
        let mut frame = BytesMut::with_capacity(6 + payload.len());
        frame.put_u8(channel);
        frame.put_u8(kind);
        frame.put_u32(payload.len() as u32);
        frame.put_slice(payload);
        let mut writer = self.inner.lock().await;
        writer.write_all(&frame).await.map_err(DStoreError::transport)?;
        writer.flush().await.map_err(DStoreError::transport)
    }
}

/// Splits one duplex stream into independently readable channels.
#[derive(Clone)]
pub struct Multiplexer {
    writer: MuxWriter,
    routes: Arc<StdMutex<Routes>>,
}

impl Multiplexer {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let closed = CancellationToken::new();
        let writer = MuxWriter {
            inner: Arc::new(TokioMutex::new(Box::new(write_half) as BoxedWriter)),
            closed: closed.clone(),
        };
        let routes = Arc::new(StdMutex::new(Routes {
            slots: HashMap::new(),
            retired: HashSet::new(),
            next_id: FIRST_SIDE_CHANNEL,
        }));

        let reader_routes = routes.clone();
        tokio::spawn(async move {
            if let Err(e) = read_frames(read_half, &reader_routes).await {
                debug!(error = %e, "Multiplexer reader stopped");
            }
            closed.cancel();
            if let Ok(mut routes) = reader_routes.lock() {
                for slot in routes.slots.values_mut() {
                    slot.tx = None;
                }
            }
        });

        Self { writer, routes }
    }

    pub fn is_closed(&self) -> bool {
        self.writer.closed.is_cancelled()
    }

    /// Resolves once the underlying stream has gone away.
    pub async fn closed(&self) {
        self.writer.closed.cancelled().await
    }

    /// Opens (or adopts) the channel with the given id. Frames received
    /// before the channel was opened are buffered and delivered first.
    pub fn open(&self, id: u8) -> Result<LogicalChannel> {
        let mut routes = lock_routes(&self.routes)?;
        routes.retired.remove(&id);
        let slot = routes.slots.entry(id).or_insert_with(Slot::fresh);
        if slot.opened {
            return Err(DStoreError::InvalidArgument(format!("channel {} is already open", id)));
        }
        slot.opened = true;
        let rx = slot.rx.take().unwrap_or_else(|| {
            // Slot was created and closed by the peer before we got here.
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        });
        Ok(LogicalChannel {
            id,
            rx,
            writer: self.writer.clone(),
            routes: self.routes.clone(),
        })
    }

    /// Picks a side-channel id that is not in use. Retired ids are only
    /// reused once every other id is taken.
    pub fn allocate(&self) -> Result<LogicalChannel> {
        let id = {
            let mut routes = lock_routes(&self.routes)?;
            let mut candidate = None;
            let mut fallback = None;
            for _ in 0..(u8::MAX - FIRST_SIDE_CHANNEL + 1) {
                let id = routes.next_id;
                routes.next_id = if id == u8::MAX { FIRST_SIDE_CHANNEL } else { id + 1 };
                if routes.slots.contains_key(&id) {
                    continue;
                }
                if routes.retired.contains(&id) {
                    fallback.get_or_insert(id);
                    continue;
                }
                candidate = Some(id);
                break;
            }
            candidate
                .or(fallback)
                .ok_or_else(|| DStoreError::Transport("no free side channels".to_string()))?
        };
        self.open(id)
    }

    pub fn writer(&self) -> MuxWriter {
        self.writer.clone()
    }

    /// Sends one data frame on `channel` without holding a channel handle.
    pub async fn send_to(&self, channel: u8, data: &[u8]) -> Result<()> {
        self.writer.write_frame(channel, FRAME_DATA, data).await
    }

    /// Signals end of stream on `channel`.
    pub async fn close_channel(&self, channel: u8) -> Result<()> {
        self.writer.write_frame(channel, FRAME_EOF, &[]).await
    }
}

fn lock_routes(routes: &StdMutex<Routes>) -> Result<std::sync::MutexGuard<'_, Routes>> {
    routes
        .lock()
        .map_err(|e| DStoreError::Transport(format!("channel table poisoned: {}", e)))
}

async fn read_frames<R: AsyncRead + Unpin>(mut reader: R, routes: &StdMutex<Routes>) -> Result<()> {
    loop {
        let channel = match reader.read_u8().await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(DStoreError::transport(e)),
        };
        let kind = reader.read_u8().await.map_err(DStoreError::transport)?;
        let len = reader.read_u32().await.map_err(DStoreError::transport)?;
        if len > MAX_FRAME_LEN {
            return Err(DStoreError::Protocol(format!("frame of {} bytes exceeds limit", len)));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await.map_err(DStoreError::transport)?;

        if kind != FRAME_DATA && kind != FRAME_EOF {
            warn!(channel, kind, "Unknown frame kind");
            return Err(DStoreError::Protocol(format!("unknown frame kind {}", kind)));
        }

        let mut routes = lock_routes(routes)?;
        if routes.retired.contains(&channel) {
            if kind == FRAME_EOF {
                routes.retired.remove(&channel);
            }
            trace!(channel, "Discarding frame for retired channel");
            continue;
        }
        let slot = routes.slots.entry(channel).or_insert_with(Slot::fresh);
        if kind == FRAME_EOF {
            slot.tx = None;
            continue;
        }
        if !slot.opened {
            if slot.early >= MAX_EARLY_FRAMES {
                warn!(channel, "Too many frames for an unopened channel, dropping");
                continue;
            }
            slot.early += 1;
        }
        if let Some(tx) = &slot.tx {
            if tx.send(Bytes::from(payload)).is_err() {
                debug!(channel, "Dropping frame for closed channel");
            }
        }
    }
}

/// One logical, ordered byte-message channel.
pub struct LogicalChannel {
    id: u8,
    rx: mpsc::UnboundedReceiver<Bytes>,
    writer: MuxWriter,
    routes: Arc<StdMutex<Routes>>,
}

impl std::fmt::Debug for LogicalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalChannel").field("id", &self.id).finish()
    }
}

impl LogicalChannel {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.writer.write_frame(self.id, FRAME_DATA, data).await
    }

    /// Next message, or `None` once the peer closed the channel or the
    /// connection dropped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub async fn close(&self) -> Result<()> {
        self.writer.write_frame(self.id, FRAME_EOF, &[]).await
    }

    pub fn is_connection_closed(&self) -> bool {
        self.writer.closed.is_cancelled()
    }
}

impl Drop for LogicalChannel {
    fn drop(&mut self) {
        if let Ok(mut routes) = self.routes.lock() {
            let peer_open = routes
                .slots
                .remove(&self.id)
                .is_some_and(|slot| slot.tx.is_some());
            // Frames the peer still sends are discarded until its EOF.
            if peer_open && !self.writer.closed.is_cancelled() {
                routes.retired.insert(self.id);
            }
        }
    }
}
