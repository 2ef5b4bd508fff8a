use crate::store::element::{ElementId, ElementSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A single mirrored mutation. Only the changed element travels, never the
/// subtree below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Delta {
    Created { parent: ElementId, element: ElementSnapshot },
    Updated { element: ElementSnapshot },
    Removed { parent: ElementId, id: ElementId },
    /// A chunk of a file replicated to the peer. Offset 0 starts the file over.
    Transfer {
        status: ElementId,
        destination: String,
        offset: u64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl Delta {
    pub fn element_id(&self) -> &ElementId {
        match self {
            Delta::Created { element, .. } | Delta::Updated { element } => &element.id,
            Delta::Removed { id, .. } => id,
            Delta::Transfer { status, .. } => status,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// File chunks that may sit in the mirror queue at once. Element deltas are
/// not limited.
pub const TRANSFER_WINDOW: usize = 16;

type Queued = (Delta, Option<OwnedSemaphorePermit>);

/// Write end of the mirror queue.
#[derive(Clone)]
pub struct DeltaSender {
    tx: mpsc::UnboundedSender<Queued>,
    window: Arc<Semaphore>,
}

impl DeltaSender {
    /// Queues an element delta. Fails with the delta when the reader is gone.
    pub fn send(&self, delta: Delta) -> Result<(), Delta> {
        self.tx.send((delta, None)).map_err(|e| e.0 .0)
    }

    /// Queues a file chunk, waiting while the transfer window is full.
    pub async fn send_transfer(&self, delta: Delta) -> Result<(), Delta> {
        let permit = tokio::select! {
            permit = self.window.clone().acquire_owned() => permit.ok(),
            _ = self.tx.closed() => None,
        };
        match permit {
            Some(permit) => self.tx.send((delta, Some(permit))).map_err(|e| e.0 .0),
            None => Err(delta),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read end of the mirror queue. Taking a chunk off the queue frees its
/// place in the transfer window.
pub struct DeltaReceiver {
    rx: mpsc::UnboundedReceiver<Queued>,
}

impl DeltaReceiver {
    pub async fn recv(&mut self) -> Option<Delta> {
        self.rx.recv().await.map(|(delta, _permit)| delta)
    }

    pub fn try_recv(&mut self) -> Result<Delta, TryRecvError> {
        self.rx.try_recv().map(|(delta, _permit)| delta)
    }
}

pub fn delta_channel() -> (DeltaSender, DeltaReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let window = Arc::new(Semaphore::new(TRANSFER_WINDOW));
    (DeltaSender { tx, window }, DeltaReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transfer_data_travels_as_base64() {
        let delta = Delta::Transfer {
            status: ElementId::from("srv.4"),
            destination: "/tmp/out.bin".to_string(),
            offset: 0,
            data: vec![0, 159, 255],
        };
        let json = serde_json::to_string(&delta).unwrap();
        assert!(json.contains("\"op\":\"transfer\""));
        assert!(json.contains("\"data\":\"AJ//\""));
        assert_eq!(serde_json::from_str::<Delta>(&json).unwrap(), delta);
    }

    fn chunk(offset: u64) -> Delta {
        Delta::Transfer {
            status: ElementId::from("srv.4"),
            destination: "/tmp/out.bin".to_string(),
            offset,
            data: vec![0; 8],
        }
    }

    #[tokio::test]
    async fn chunks_wait_for_the_reader_once_the_window_is_full() {
        let (tx, mut rx) = delta_channel();
        for i in 0..TRANSFER_WINDOW as u64 {
            tx.send_transfer(chunk(i * 8)).await.unwrap();
        }
        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send_transfer(chunk(999))).await;
        assert!(blocked.is_err());

        // Element deltas are never held back.
        tx.send(Delta::Removed {
            parent: ElementId::from("root"),
            id: ElementId::from("srv.9"),
        })
        .unwrap();

        assert!(matches!(rx.recv().await, Some(Delta::Transfer { offset: 0, .. })));
        tokio::time::timeout(Duration::from_millis(500), tx.send_transfer(chunk(1000)))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn closed_reader_fails_a_waiting_chunk() {
        let (tx, rx) = delta_channel();
        for i in 0..TRANSFER_WINDOW as u64 {
            tx.send_transfer(chunk(i)).await.unwrap();
        }
        let pending = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send_transfer(chunk(99)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);
        assert!(pending.await.unwrap().is_err());
        assert!(tx.is_closed());
    }
}
