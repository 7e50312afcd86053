use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{WiretapError, WiretapResult};

/// One live push-channel subscriber.
///
/// A subscriber is a handle to an outbound frame queue. A single writer
/// task (spawned by the hub) drains the queue onto the upgraded stream, so
/// frames reach each peer in exactly the order they were enqueued, while
/// different subscribers' writers run in parallel. The first write error
/// ends the writer, which closes the queue; enqueue then fails and the hub
/// deregisters the subscriber.
pub struct Subscriber {
    pub id: u64,
    tx: mpsc::UnboundedSender<Arc<Vec<u8>>>,
}

impl Subscriber {
    /// Create a subscriber and the receiving end of its frame queue.
    pub fn new(id: u64) -> (Self, mpsc::UnboundedReceiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    /// Queue one pre-encoded frame for delivery. Fails once the writer has
    /// torn down.
    pub fn enqueue(&self, frame: Arc<Vec<u8>>) -> WiretapResult<()> {
        self.tx.send(frame).map_err(|_| {
            WiretapError::internal(format!("subscriber {} queue closed", self.id))
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain a subscriber's frame queue onto its stream. Returns when the queue
/// closes (normal teardown) or a write fails (peer gone).
pub async fn write_frames<W>(
    mut rx: mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
    mut writer: W,
) -> WiretapResult<()>
where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(frame) = rx.recv().await {
        writer
            .write_all(&frame)
            .await
            .map_err(|e| WiretapError::internal(format!("subscriber write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| WiretapError::internal(format!("subscriber flush failed: {}", e)))?;
    }

    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_frames_delivered_in_enqueue_order() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut client_read, _client_write) = tokio::io::split(client);
        let (_server_read, server_write) = tokio::io::split(server);

        let (sub, rx) = Subscriber::new(1);
        tokio::spawn(write_frames(rx, server_write));

        sub.enqueue(Arc::new(b"\x81\x01a".to_vec())).unwrap();
        sub.enqueue(Arc::new(b"\x81\x01b".to_vec())).unwrap();
        sub.enqueue(Arc::new(b"\x81\x01c".to_vec())).unwrap();

        let mut buf = [0u8; 9];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x81\x01a\x81\x01b\x81\x01c");
    }

    #[tokio::test]
    async fn test_writer_exit_closes_queue() {
        let (client, server) = tokio::io::duplex(16);
        let (_server_read, server_write) = tokio::io::split(server);
        drop(client);

        let (sub, rx) = Subscriber::new(2);
        let writer = tokio::spawn(write_frames(rx, server_write));

        // The peer is gone; the first write fails and the writer returns
        sub.enqueue(Arc::new(b"\x81\x01a".to_vec())).ok();
        let result = writer.await.unwrap();
        assert!(result.is_err());

        // Once the receiver is dropped, enqueue fails and the subscriber
        // reports itself closed
        for _ in 0..50 {
            if sub.is_closed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(sub.enqueue(Arc::new(b"\x81\x00".to_vec())).is_err());
        assert!(sub.is_closed());
    }

    #[tokio::test]
    async fn test_queue_close_shuts_stream_down() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut client_read, _client_write) = tokio::io::split(client);
        let (_server_read, server_write) = tokio::io::split(server);

        let (sub, rx) = Subscriber::new(3);
        let writer = tokio::spawn(write_frames(rx, server_write));

        drop(sub); // queue closes, writer drains and shuts the stream down
        writer.await.unwrap().unwrap();

        let mut buf = [0u8; 1];
        let n = client_read.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "stream should be at EOF");
    }
}
