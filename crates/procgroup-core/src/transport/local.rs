//! Transport for a group whose ranks all live in the current OS process.
//!
//! Each rank is typically driven by its own tokio task. Delivery is a
//! direct push into the destination's mailbox, so ordering between one
//! source and one destination is the send order.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::mailbox::Mailbox;
use super::{check_rank, Envelope, Rank, RemoteCall, StatsCounter, Tag, Transport, TransportStats};
use crate::error::Result;

/// One rank of an in-process group created by [`local_group`].
#[derive(Debug)]
pub struct LocalGroupTransport {
    rank: Rank,
    mailboxes: Arc<Vec<Mailbox>>,
    stats: StatsCounter,
}

/// Create the transports of an in-process group of `size` ranks.
///
/// The returned vector is indexed by rank. A size of zero is treated as 1.
pub fn local_group(size: usize) -> Vec<LocalGroupTransport> {
    let size = size.max(1);
    let mailboxes: Arc<Vec<Mailbox>> = Arc::new((0..size).map(|_| Mailbox::new()).collect());
    (0..size)
        .map(|rank| LocalGroupTransport {
            rank,
            mailboxes: mailboxes.clone(),
            stats: StatsCounter::default(),
        })
        .collect()
}

impl LocalGroupTransport {
    fn deliver(&self, dest: Rank, envelope: Envelope) -> Result<()> {
        check_rank(dest, self.mailboxes.len())?;
        self.stats.record(&envelope);
        self.mailboxes[dest].deliver(envelope)
    }

    fn own_mailbox(&self) -> &Mailbox {
        &self.mailboxes[self.rank]
    }

    /// Messages waiting in this rank's mailbox for a matching receive.
    pub fn pending(&self) -> usize {
        self.own_mailbox().pending()
    }
}

#[async_trait]
impl Transport for LocalGroupTransport {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn group_size(&self) -> usize {
        self.mailboxes.len()
    }

    async fn send(&self, dest: Rank, tag: Tag, payload: Bytes) -> Result<()> {
        self.deliver(dest, Envelope::message(self.rank, tag, payload))
    }

    async fn receive(&self, source: Rank, tag: Tag) -> Result<Bytes> {
        check_rank(source, self.group_size())?;
        self.own_mailbox().take(source, tag).await
    }

    async fn trigger_remote_call(&self, dest: Rank, tag: Tag, payload: Bytes) -> Result<()> {
        self.deliver(dest, Envelope::remote_call(self.rank, tag, payload))
    }

    async fn next_remote_call(&self) -> Result<RemoteCall> {
        self.own_mailbox().next_call().await
    }

    async fn finalize(&self) -> Result<()> {
        self.own_mailbox().close();
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
    async fn test_group_identity() {
        let group = local_group(4);
        assert_eq!(group.len(), 4);
        for (rank, transport) in group.iter().enumerate() {
            assert_eq!(transport.local_rank(), rank);
            assert_eq!(transport.group_size(), 4);
            assert!(transport.supports_collectives());
        }
        assert_eq!(local_group(0).len(), 1);
    }

    #[tokio::test]
    async fn test_point_to_point() {
        let group = local_group(3);
        group[2]
            .send(0, Tag(7), Bytes::from_static(b"two"))
            .await
            .unwrap();
        group[1]
            .send(0, Tag(7), Bytes::from_static(b"one"))
            .await
            .unwrap();

        assert_eq!(group[0].pending(), 2);
        assert_eq!(group[0].receive(1, Tag(7)).await.unwrap(), "one");
        assert_eq!(group[0].receive(2, Tag(7)).await.unwrap(), "two");
        assert_eq!(group[1].stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_remote_call_reaches_destination_only() {
        let group = local_group(3);
        group[0]
            .trigger_remote_call(2, Tag::STREAM_EXECUTION, Bytes::from_static(b"stream"))
            .await
            .unwrap();

        let call = group[2].next_remote_call().await.unwrap();
        assert_eq!(call.source, 0);
        assert_eq!(call.tag, Tag::STREAM_EXECUTION);
        assert_eq!(call.payload, "stream");
        assert_eq!(group[0].stats().remote_calls_sent, 1);
    }

    #[tokio::test]
    async fn test_invalid_destination() {
        let group = local_group(2);
        let result = group[0].trigger_remote_call(5, Tag::BREAK, Bytes::new()).await;
        assert!(matches!(
            result,
            Err(ProcessError::InvalidRank { rank: 5, size: 2 })
        ));
    }

    #[tokio::test]
    async fn test_finalized_rank_refuses_delivery() {
        let group = local_group(2);
        group[1].finalize().await.unwrap();
        assert!(group[0].send(1, Tag(1), Bytes::new()).await.is_err());
        assert!(group[1].send(0, Tag(1), Bytes::new()).await.is_ok());
    }
}
