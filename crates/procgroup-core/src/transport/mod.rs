//! Message transport between the processes of a group.
//!
//! Every implementation moves [`envelope::Envelope`]s between ranks and
//! sorts them on arrival into a per-rank [`mailbox::Mailbox`]:
//!
//! - point-to-point messages wait keyed by `(source, tag)` until a matching
//!   [`Transport::receive`] takes them;
//! - remote calls queue in arrival order for [`Transport::next_remote_call`].
//!
//! # Implementations
//!
//! - [`LoopbackTransport`]: a group of one, no collectives.
//! - [`LocalGroupTransport`]: N ranks inside one OS process.
//! - [`TcpTransport`]: one rank per OS process over TCP.

pub mod envelope;
pub mod local;
pub mod loopback;
pub(crate) mod mailbox;
pub mod tcp;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::GroupConfig;
use crate::error::{ProcessError, Result};

pub use envelope::{Envelope, EnvelopeKind};
pub use local::{local_group, LocalGroupTransport};
pub use loopback::LoopbackTransport;
pub use tcp::TcpTransport;

/// 0-based identity of a process in its group.
pub type Rank = usize;

/// The rank that drives the group and aggregates results.
pub const CONTROLLER_RANK: Rank = 0;

/// Logical channel id for messages and remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub u32);

impl Tag {
    /// Remote call carrying a command stream to execute.
    pub const STREAM_EXECUTION: Tag = Tag(397529);
    /// Remote call that ends a worker's remote call loop.
    pub const BREAK: Tag = Tag(239954);
    /// Remote call asking a worker to take part in an information gather.
    pub const GATHER_INFORMATION: Tag = Tag(498797);
    /// Point-to-point snapshots sent to root during a gather.
    pub const INFORMATION: Tag = Tag(498799);
    /// Remote call asking a worker to load an extension.
    pub const LOAD_MODULE: Tag = Tag(498800);
    /// Point-to-point frames of the gather collective.
    pub const COLLECTIVE: Tag = Tag(498801);
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote call delivered to this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub source: Rank,
    pub tag: Tag,
    pub payload: Bytes,
}

/// Counters of what a transport has sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub remote_calls_sent: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    messages_sent: AtomicU64,
    remote_calls_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl StatsCounter {
    pub(crate) fn record(&self, envelope: &Envelope) {
        match envelope.kind {
            EnvelopeKind::Message => self.messages_sent.fetch_add(1, Ordering::Relaxed),
            EnvelopeKind::RemoteCall => self.remote_calls_sent.fetch_add(1, Ordering::Relaxed),
        };
        self.bytes_sent
            .fetch_add(envelope.payload.len() as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            remote_calls_sent: self.remote_calls_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn check_rank(rank: Rank, size: usize) -> Result<()> {
    if rank >= size {
        return Err(ProcessError::InvalidRank { rank, size });
    }
    Ok(())
}

/// Point-to-point and remote-call messaging within a process group.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn local_rank(&self) -> Rank;

    fn group_size(&self) -> usize;

    /// Whether [`Transport::gather`] takes part in a real group collective.
    fn supports_collectives(&self) -> bool {
        true
    }

    /// Send `payload` to `dest`, matched there by source rank and `tag`.
    async fn send(&self, dest: Rank, tag: Tag, payload: Bytes) -> Result<()>;

    /// Wait for the next message from `source` on `tag`.
    async fn receive(&self, source: Rank, tag: Tag) -> Result<Bytes>;

    /// Queue a remote call on `dest`.
    async fn trigger_remote_call(&self, dest: Rank, tag: Tag, payload: Bytes) -> Result<()>;

    /// Wait for the next remote call addressed to this process.
    async fn next_remote_call(&self) -> Result<RemoteCall>;

    /// Collect one buffer from every rank at `root`, in rank order.
    ///
    /// Returns `Some` on root and `None` everywhere else.
    async fn gather(&self, root: Rank, local: Bytes) -> Result<Option<Vec<Bytes>>> {
        let size = self.group_size();
        check_rank(root, size)?;

        if self.local_rank() != root {
            self.send(root, Tag::COLLECTIVE, local).await?;
            return Ok(None);
        }

        let mut results = Vec::with_capacity(size);
        for rank in 0..size {
            if rank == root {
                results.push(local.clone());
            } else {
                results.push(self.receive(rank, Tag::COLLECTIVE).await?);
            }
        }
        Ok(Some(results))
    }

    /// Release the transport. Pending receives fail with `ChannelClosed`.
    async fn finalize(&self) -> Result<()>;

    fn stats(&self) -> TransportStats;
}

/// Build the transport described by `config`.
///
/// A group of one gets a [`LoopbackTransport`]; anything larger joins the
/// TCP mesh described by the peer list.
pub async fn connect(config: &GroupConfig) -> Result<Arc<dyn Transport>> {
    config.validate()?;

    if config.size() == 1 {
        info!("Starting single-process group");
        return Ok(Arc::new(LoopbackTransport::new()));
    }

    info!(
        "Joining group of {} as rank {}",
        config.size(),
        config.rank
    );
    let transport = TcpTransport::connect(config).await?;
    Ok(Arc::new(transport))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_tags_are_distinct() {
        let tags = [
            Tag::STREAM_EXECUTION,
            Tag::BREAK,
            Tag::GATHER_INFORMATION,
            Tag::INFORMATION,
            Tag::LOAD_MODULE,
            Tag::COLLECTIVE,
        ];
        let unique: std::collections::BTreeSet<_> = tags.iter().collect();
        assert_eq!(unique.len(), tags.len());
    }

    #[test]
    fn test_check_rank() {
        assert!(check_rank(0, 1).is_ok());
        assert!(matches!(
            check_rank(3, 3),
            Err(ProcessError::InvalidRank { rank: 3, size: 3 })
        ));
    }

    #[tokio::test]
    async fn test_connect_single_process_is_loopback() {
        let transport = connect(&GroupConfig::single_process()).await.unwrap();
        assert_eq!(transport.local_rank(), 0);
        assert_eq!(transport.group_size(), 1);
        assert!(!transport.supports_collectives());
    }

    #[tokio::test]
    async fn test_gather_in_rank_order() {
        let group = local_group(3);
        let mut tasks = Vec::new();
        for transport in group {
            tasks.push(tokio::spawn(async move {
                let rank = transport.local_rank();
                let local = Bytes::from(vec![rank as u8 * 10]);
                transport.gather(0, local).await.unwrap()
            }));
        }

        let results = futures::future::join_all(tasks).await;
        let root = results[0].as_ref().unwrap().clone().unwrap();
        assert_eq!(
            root,
            vec![
                Bytes::from_static(&[0]),
                Bytes::from_static(&[10]),
                Bytes::from_static(&[20])
            ]
        );
        assert!(results[1].as_ref().unwrap().is_none());
        assert!(results[2].as_ref().unwrap().is_none());
    }
}
