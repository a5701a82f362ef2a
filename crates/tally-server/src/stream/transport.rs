//! Client transport abstraction.
//!
//! A session worker owns exactly one transport and is the only writer.

use async_trait::async_trait;
use bytes::Bytes;
use tally_core::Frame;
use tokio::sync::mpsc;

use super::errors::TransportError;

/// Byte sink for one client's event stream.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one frame.
    async fn write(&self, frame: Frame) -> Result<(), TransportError>;

    /// Resolve once the peer is gone.
    async fn closed(&self);
}

/// Transport backed by a bounded channel feeding an HTTP response body.
///
/// Dropping the response body closes the receiver, which surfaces here as
/// [`TransportError::Closed`] on write and as completion of
/// [`closed`](Transport::closed).
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelTransport {
    /// Create a transport and the receiver that feeds the response body.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(frame.into_bytes())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn write_reaches_receiver() {
        let (transport, mut rx) = ChannelTransport::new(4);
        transport.write(Frame::keepalive()).await.unwrap();
        assert_eq!(&rx.recv().await.unwrap()[..], Frame::KEEPALIVE);
    }

    #[tokio::test]
    async fn write_after_receiver_dropped_fails() {
        let (transport, rx) = ChannelTransport::new(4);
        drop(rx);
        assert_eq!(
            transport.write(Frame::keepalive()).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn closed_resolves_when_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new(4);
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), transport.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closed_pending_while_receiver_alive() {
        let (transport, _rx) = ChannelTransport::new(4);
        let waited = tokio::time::timeout(Duration::from_millis(20), transport.closed()).await;
        assert!(waited.is_err());
    }
}
