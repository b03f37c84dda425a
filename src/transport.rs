//! Request/reply transport between workers and the authority.
//!
//! The core only requires a duplex, addressable channel whose replies can
//! be correlated to requests; whether that is an in-process channel or a
//! socket is up to the embedder. An in-process tokio channel realization
//! is provided here and is what the tests use.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{RatebridgeError, Result};
use crate::protocol::{CoordinatorReply, WireMessage};

/// A request/reply channel from a worker to the authority.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message and wait for the correlated reply.
    async fn send(&self, message: WireMessage) -> Result<CoordinatorReply>;
}

/// One in-flight message with its reply slot, as received by the authority.
#[derive(Debug)]
pub struct Envelope {
    pub message: WireMessage,
    pub reply: oneshot::Sender<CoordinatorReply>,
}

/// Receiving end handed to the coordinator's serve loop.
pub type MessageReceiver = mpsc::Receiver<Envelope>;

/// In-process transport backed by a tokio mpsc channel.
///
/// Cloning is cheap; every worker in the same process can hold a clone.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Envelope>,
}

/// Create a connected transport pair: the worker-side sender and the
/// authority-side receiver.
pub fn channel(capacity: usize) -> (ChannelTransport, MessageReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChannelTransport { tx }, rx)
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: WireMessage) -> Result<CoordinatorReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RatebridgeError::Coordinator("transport closed".to_string()))?;
        // A dropped reply sender means the coordinator discarded the
        // message, e.g. because the opcode did not match.
        reply_rx
            .await
            .map_err(|_| RatebridgeError::Coordinator("message dropped without reply".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CoordinatorRequest, WireMessage};

    #[tokio::test]
    async fn test_send_receives_correlated_reply() {
        let (transport, mut rx) = channel(8);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let _ = envelope.reply.send(CoordinatorReply::Hash {
                    hash: Some("abcd".to_string()),
                });
            }
        });

        let reply = transport
            .send(WireMessage::new(CoordinatorRequest::Hash {
                id: "GET:/channels/:id".to_string(),
            }))
            .await
            .unwrap();
        match reply {
            CoordinatorReply::Hash { hash } => assert_eq!(hash.as_deref(), Some("abcd")),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_reply_is_an_error() {
        let (transport, mut rx) = channel(8);

        tokio::spawn(async move {
            // Discard the envelope without replying.
            let _ = rx.recv().await;
        });

        let result = transport
            .send(WireMessage::new(CoordinatorRequest::Hash {
                id: "GET:/users/@me".to_string(),
            }))
            .await;
        assert!(matches!(result, Err(RatebridgeError::Coordinator(_))));
    }

    #[tokio::test]
    async fn test_closed_channel_is_an_error() {
        let (transport, rx) = channel(8);
        drop(rx);

        let result = transport
            .send(WireMessage::new(CoordinatorRequest::Hash {
                id: "GET:/users/@me".to_string(),
            }))
            .await;
        assert!(matches!(result, Err(RatebridgeError::Coordinator(_))));
    }
}
