//! Transfer stream capabilities and the in-process channel implementation.
//!
//! A transfer is a client stream: the sender pushes one
//! [`TimeSeriesChunk`] per series, closes its side, and receives a single
//! [`TransferResult`]. Only an explicit close ends the stream cleanly; a
//! sender that goes away without closing is a failed transfer.

use super::message::{TimeSeriesChunk, TransferChunksResponse, TransferResult};
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Identity of one transfer stream, shared by both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferContext {
    /// Unique id of the stream.
    pub transfer_id: Uuid,
}

impl TransferContext {
    /// Context for a new stream.
    pub fn new() -> Self {
        Self {
            transfer_id: Uuid::new_v4(),
        }
    }
}

impl Default for TransferContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending end of a transfer stream.
#[async_trait]
pub trait TransferSender: Send + std::fmt::Debug {
    /// Send one series.
    async fn send(&mut self, msg: TimeSeriesChunk) -> Result<()>;

    /// Close the sending side and wait for the receiver's answer.
    async fn close_and_recv(&mut self) -> Result<TransferChunksResponse>;

    /// Stream context.
    fn context(&self) -> &TransferContext;
}

/// Receiving end of a transfer stream.
#[async_trait]
pub trait TransferReceiver: Send + std::fmt::Debug {
    /// Next series, or `None` once the sender closed its side.
    async fn recv(&mut self) -> Result<Option<TimeSeriesChunk>>;

    /// Answer the sender and close the stream.
    async fn send_and_close(&mut self, result: TransferResult) -> Result<()>;

    /// Stream context.
    fn context(&self) -> &TransferContext;
}

/// Client of a peer ingester.
#[async_trait]
pub trait IngesterClient: Send + Sync + std::fmt::Debug {
    /// Open a transfer stream to the peer.
    async fn transfer_chunks(&self) -> Result<Box<dyn TransferSender>>;
}

/// Resolves peer addresses to clients.
#[async_trait]
pub trait ClientFactory: Send + Sync + std::fmt::Debug {
    /// Connect to the ingester at `addr`.
    async fn connect(&self, addr: &str) -> Result<Arc<dyn IngesterClient>>;
}

/// What travels over the in-process channel.
#[derive(Debug)]
enum StreamItem {
    Series(TimeSeriesChunk),
    /// The sender closed its side.
    End,
}

/// Create a connected in-process stream with `buffer` messages in flight.
pub fn channel_stream(buffer: usize) -> (ChannelSender, ChannelReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let (ack_tx, ack_rx) = oneshot::channel();
    let context = TransferContext::new();
    (
        ChannelSender {
            tx: Some(tx),
            ack_rx: Some(ack_rx),
            context: context.clone(),
        },
        ChannelReceiver {
            rx,
            ack_tx: Some(ack_tx),
            ended: false,
            context,
        },
    )
}

/// Sending end of [`channel_stream`].
#[derive(Debug)]
pub struct ChannelSender {
    tx: Option<mpsc::Sender<StreamItem>>,
    ack_rx: Option<oneshot::Receiver<TransferResult>>,
    context: TransferContext,
}

#[async_trait]
impl TransferSender for ChannelSender {
    async fn send(&mut self, msg: TimeSeriesChunk) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(TransferError::StreamClosed)?;
        tx.send(StreamItem::Series(msg))
            .await
            .map_err(|_| TransferError::StreamClosed.into())
    }

    async fn close_and_recv(&mut self) -> Result<TransferChunksResponse> {
        if let Some(tx) = self.tx.take() {
            // A receiver that already gave up still answers on the ack channel.
            let _ = tx.send(StreamItem::End).await;
        }
        let ack_rx = self.ack_rx.take().ok_or(TransferError::StreamClosed)?;
        match ack_rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => Err(TransferError::Remote(message).into()),
            Err(_) => Err(TransferError::StreamClosed.into()),
        }
    }

    fn context(&self) -> &TransferContext {
        &self.context
    }
}

/// Receiving end of [`channel_stream`].
#[derive(Debug)]
pub struct ChannelReceiver {
    rx: mpsc::Receiver<StreamItem>,
    ack_tx: Option<oneshot::Sender<TransferResult>>,
    ended: bool,
    context: TransferContext,
}

#[async_trait]
impl TransferReceiver for ChannelReceiver {
    async fn recv(&mut self) -> Result<Option<TimeSeriesChunk>> {
        if self.ended {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(StreamItem::Series(msg)) => Ok(Some(msg)),
            Some(StreamItem::End) => {
                self.ended = true;
                Ok(None)
            }
            None => Err(TransferError::StreamClosed.into()),
        }
    }

    async fn send_and_close(&mut self, result: TransferResult) -> Result<()> {
        self.rx.close();
        let ack_tx = self.ack_tx.take().ok_or(TransferError::StreamClosed)?;
        ack_tx
            .send(result)
            .map_err(|_| TransferError::StreamClosed.into())
    }

    fn context(&self) -> &TransferContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::Labels;

    fn msg(name: &str) -> TimeSeriesChunk {
        TimeSeriesChunk {
            from_instance_id: "ing-1".into(),
            tenant: "t1".into(),
            labels: Labels::metric(name),
            chunks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut tx, mut rx) = channel_stream(4);
        assert_eq!(tx.context(), rx.context());

        let receiver = tokio::spawn(async move {
            let mut n = 0;
            while let Some(_msg) = rx.recv().await.unwrap() {
                n += 1;
            }
            rx.send_and_close(Ok(TransferChunksResponse { series_received: n }))
                .await
                .unwrap();
        });

        tx.send(msg("a")).await.unwrap();
        tx.send(msg("b")).await.unwrap();
        let response = tx.close_and_recv().await.unwrap();
        assert_eq!(response.series_received, 2);
        receiver.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_reaches_sender() {
        let (mut tx, mut rx) = channel_stream(1);
        rx.send_and_close(Err("rejected".into())).await.unwrap();

        assert!(tx.send(msg("a")).await.is_err());
        assert!(matches!(
            tx.close_and_recv().await,
            Err(Error::Transfer(TransferError::Remote(m))) if m == "rejected"
        ));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_not_a_clean_close() {
        let (mut tx, mut rx) = channel_stream(4);
        tx.send(msg("a")).await.unwrap();
        drop(tx);

        assert!(rx.recv().await.unwrap().is_some());
        assert!(matches!(
            rx.recv().await,
            Err(Error::Transfer(TransferError::StreamClosed))
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_keeps_reporting_end() {
        let (mut tx, mut rx) = channel_stream(4);
        let sender = tokio::spawn(async move { tx.close_and_recv().await });

        assert!(rx.recv().await.unwrap().is_none());
        assert!(rx.recv().await.unwrap().is_none());
        rx.send_and_close(Ok(TransferChunksResponse { series_received: 0 }))
            .await
            .unwrap();
        assert_eq!(sender.await.unwrap().unwrap().series_received, 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_stream() {
        let (mut tx, rx) = channel_stream(1);
        drop(rx);
        assert!(matches!(
            tx.close_and_recv().await,
            Err(Error::Transfer(TransferError::StreamClosed))
        ));
    }
}
