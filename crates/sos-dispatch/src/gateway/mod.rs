// Realtime Fan-out Gateway
//
// Live WebSocket connections grouped into chat rooms and one flat
// notification set. Each connection owns a bounded outbound queue drained by
// its own writer task, so a broadcast only ever waits on queues, never on
// sockets, and every wait is bounded by the send timeout.

pub mod notifications;
pub mod rooms;

pub use notifications::NotificationHub;
pub use rooms::{ChatRooms, Member};

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::future::join_all;
use futures_util::{Sink, SinkExt};
use sos_protocol::ServerFrame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// Close code sent to a chat client whose room or token is not valid.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

const ENCODE_FAILED: &str = r#"{"type":"error","message":"An internal error occurred."}"#;

/// Sending half of one live connection. Clones share the queue and the
/// close signal.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<Arc<str>>,
    send_timeout: Duration,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<Arc<str>>, send_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            send_timeout,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue `text` for the writer. `false` if the connection is gone or its
    /// queue stayed full for the whole send timeout.
    pub async fn send(&self, text: Arc<str>) -> bool {
        matches!(
            tokio::time::timeout(self.send_timeout, self.tx.send(text)).await,
            Ok(Ok(()))
        )
    }

    /// Tell the socket task to stop reading and drop the socket.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close` has been called on any clone.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Send `text` to every target concurrently. Connections that fail are
/// closed and their ids returned; the rest are unaffected by those failures.
pub async fn fan_out(targets: &[ConnectionHandle], text: Arc<str>) -> Vec<Uuid> {
    let sends = targets.iter().map(|conn| {
        let text = Arc::clone(&text);
        async move {
            let ok = conn.send(text).await;
            if !ok {
                conn.close();
            }
            (conn.id(), ok)
        }
    });

    join_all(sends)
        .await
        .into_iter()
        .filter_map(|(id, ok)| (!ok).then_some(id))
        .collect()
}

pub fn encode(frame: &ServerFrame) -> Arc<str> {
    match serde_json::to_string(frame) {
        Ok(json) => Arc::from(json),
        Err(e) => {
            error!(error = %e, "failed to encode server frame");
            Arc::from(ENCODE_FAILED)
        }
    }
}

/// Drain `rx` into `sink` until the queue closes or a write fails.
pub fn spawn_writer<S>(mut sink: S, mut rx: mpsc::Receiver<Arc<str>>) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.to_string().into())).await.is_err() {
                debug!("socket write failed, writer stopping");
                break;
            }
        }
    })
}

/// New connection handle plus the queue its writer drains.
pub fn connection(buffer: usize, send_timeout: Duration) -> (ConnectionHandle, mpsc::Receiver<Arc<str>>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (ConnectionHandle::new(tx, send_timeout), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_isolates_failures() {
        let (ok, mut ok_rx) = connection(4, Duration::from_millis(50));
        let (broken, broken_rx) = connection(4, Duration::from_millis(50));
        drop(broken_rx);
        // Full queue nobody drains.
        let (slow, _slow_rx) = connection(1, Duration::from_millis(50));
        assert!(slow.send(Arc::from("backlog")).await);

        let failed = fan_out(&[ok.clone(), broken.clone(), slow.clone()], Arc::from("hi")).await;

        assert_eq!(failed.len(), 2);
        assert!(failed.contains(&broken.id()));
        assert!(failed.contains(&slow.id()));
        assert_eq!(&*ok_rx.recv().await.unwrap(), "hi");

        assert!(broken.is_closed());
        assert!(slow.is_closed());
        assert!(!ok.is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_every_clone() {
        let (conn, _rx) = connection(1, Duration::from_millis(50));
        let reader = conn.clone();
        let waiter = tokio::spawn(async move { reader.closed().await });

        conn.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("close signal not delivered")
            .unwrap();
    }

    #[tokio::test]
    async fn test_writer_forwards_queued_frames() {
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<Message>();
        let sink = Box::pin(futures_util::sink::unfold(sink_tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(|_| ())?;
            Ok::<_, ()>(tx)
        }));
        let (conn, rx) = connection(4, Duration::from_millis(50));
        let writer = spawn_writer(sink, rx);

        assert!(conn.send(encode(&ServerFrame::system("hello"))).await);
        drop(conn);
        writer.await.unwrap();

        match sink_rx.recv().await {
            Some(Message::Text(text)) => {
                let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(json["type"], "system");
                assert_eq!(json["message"], "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
