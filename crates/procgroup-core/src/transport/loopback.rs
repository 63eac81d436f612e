//! Transport for a group made of the current process alone.

use async_trait::async_trait;
use bytes::Bytes;

use super::mailbox::Mailbox;
use super::{
    check_rank, Envelope, Rank, RemoteCall, StatsCounter, Tag, Transport, TransportStats,
    CONTROLLER_RANK,
};
use crate::error::Result;

/// Single-process transport: rank 0 of a group of one.
///
/// Messages sent to rank 0 land in the process's own mailbox. There is no
/// group collective, so callers fall back to their local path.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    mailbox: Mailbox,
    stats: StatsCounter,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, dest: Rank, envelope: Envelope) -> Result<()> {
        check_rank(dest, 1)?;
        self.stats.record(&envelope);
        self.mailbox.deliver(envelope)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_rank(&self) -> Rank {
        CONTROLLER_RANK
    }

    fn group_size(&self) -> usize {
        1
    }

    fn supports_collectives(&self) -> bool {
        false
    }

    async fn send(&self, dest: Rank, tag: Tag, payload: Bytes) -> Result<()> {
        self.deliver(dest, Envelope::message(CONTROLLER_RANK, tag, payload))
    }

    async fn receive(&self, source: Rank, tag: Tag) -> Result<Bytes> {
        check_rank(source, 1)?;
        self.mailbox.take(source, tag).await
    }

    async fn trigger_remote_call(&self, dest: Rank, tag: Tag, payload: Bytes) -> Result<()> {
        self.deliver(dest, Envelope::remote_call(CONTROLLER_RANK, tag, payload))
    }

    async fn next_remote_call(&self) -> Result<RemoteCall> {
        self.mailbox.next_call().await
    }

    async fn finalize(&self) -> Result<()> {
        self.mailbox.close();
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;

    #[tokio::test]
    async fn test_loopback_identity() {
        let transport = LoopbackTransport::new();
        assert_eq!(transport.local_rank(), 0);
        assert_eq!(transport.group_size(), 1);
        assert!(!transport.supports_collectives());
    }

    #[tokio::test]
    async fn test_send_to_self() {
        let transport = LoopbackTransport::new();
        transport
            .send(0, Tag(42), Bytes::from_static(b"self"))
            .await
            .unwrap();
        assert_eq!(transport.receive(0, Tag(42)).await.unwrap(), "self");
        assert_eq!(transport.stats().messages_sent, 1);
        assert_eq!(transport.stats().bytes_sent, 4);
    }

    #[tokio::test]
    async fn test_other_ranks_are_rejected() {
        let transport = LoopbackTransport::new();
        let result = transport.send(1, Tag(1), Bytes::new()).await;
        assert!(matches!(
            result,
            Err(ProcessError::InvalidRank { rank: 1, size: 1 })
        ));
        assert_eq!(transport.stats(), TransportStats::default());
    }

    #[tokio::test]
    async fn test_default_gather_collects_local_value() {
        let transport = LoopbackTransport::new();
        let results = transport
            .gather(0, Bytes::from_static(&[1]))
            .await
            .unwrap();
        assert_eq!(results, Some(vec![Bytes::from_static(&[1])]));
    }

    #[tokio::test]
    async fn test_finalize_closes_mailbox() {
        let transport = LoopbackTransport::new();
        transport.finalize().await.unwrap();
        assert!(transport.send(0, Tag(1), Bytes::new()).await.is_err());
        assert!(matches!(
            transport.next_remote_call().await,
            Err(ProcessError::ChannelClosed)
        ));
    }
}
