//! Networked transport: one rank per OS process, full TCP mesh.
//!
//! Every rank listens on its own peer address and opens one outgoing
//! connection to every other rank. The first frame on a connection is a
//! hello carrying the sender's rank; every later frame is an
//! [`Envelope`]. Startup completes once this rank has connected to every
//! peer and every peer has said hello, so no rank can finalize while
//! another is still dialing it.
//!
//! # Thread Safety
//!
//! Outgoing connections are behind a tokio `Mutex` per peer so that frames
//! from concurrent senders are never interleaved. Inbound connections each
//! get a reader task that feeds the shared mailbox.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::envelope::{read_frame, write_frame, Envelope};
use super::mailbox::Mailbox;
use super::{check_rank, Rank, RemoteCall, StatsCounter, Tag, Transport, TransportStats};
use crate::config::{GroupConfig, TransportConfig};
use crate::error::{ProcessError, Result};

/// One rank of a TCP process group.
#[derive(Debug)]
pub struct TcpTransport {
    rank: Rank,
    size: usize,
    local_addr: SocketAddr,
    mailbox: Arc<Mailbox>,
    links: Vec<Option<Mutex<OwnedWriteHalf>>>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    stats: StatsCounter,
}

impl TcpTransport {
    /// Bind this rank's peer address and join the mesh.
    pub async fn connect(config: &GroupConfig) -> Result<Self> {
        config.validate()?;
        let addr = *config.peers.get(config.rank).ok_or_else(|| ProcessError::Config {
            message: "a networked group needs a peer list".into(),
        })?;
        let listener = TcpListener::bind(addr).await.map_err(|e| ProcessError::Startup {
            message: format!("rank {} cannot listen on {}: {}", config.rank, addr, e),
        })?;
        Self::with_listener(config.rank, &config.peers, listener, config.connect_timeout).await
    }

    /// Join the mesh using an already bound listener for this rank.
    pub async fn with_listener(
        rank: Rank,
        peers: &[SocketAddr],
        listener: TcpListener,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let size = peers.len();
        check_rank(rank, size)?;
        let local_addr = listener.local_addr()?;
        info!("Rank {} listening on {}", rank, local_addr);

        let mailbox = Arc::new(Mailbox::new());
        let (hello_tx, mut hello_rx) = mpsc::unbounded_channel::<Rank>();
        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            rank,
            size,
            mailbox.clone(),
            hello_tx,
        ));

        let startup = async {
            let mut links = Vec::with_capacity(size);
            for (peer, addr) in peers.iter().enumerate() {
                if peer == rank {
                    links.push(None);
                    continue;
                }
                let stream = Self::dial(*addr).await;
                stream.set_nodelay(true)?;
                let (_reader, mut writer) = stream.into_split();
                write_frame(&mut writer, &(rank as u32).to_be_bytes()).await?;
                debug!("Rank {} connected to rank {} at {}", rank, peer, addr);
                links.push(Some(Mutex::new(writer)));
            }

            let mut greeted = BTreeSet::new();
            while greeted.len() < size - 1 {
                match hello_rx.recv().await {
                    Some(peer) => {
                        greeted.insert(peer);
                    }
                    None => return Err(ProcessError::ChannelClosed),
                }
            }
            Ok(links)
        };

        let links = match tokio::time::timeout(connect_timeout, startup).await {
            Ok(Ok(links)) => links,
            Ok(Err(e)) => {
                accept_task.abort();
                return Err(ProcessError::Startup {
                    message: format!("rank {} could not join the group: {}", rank, e),
                });
            }
            Err(_) => {
                accept_task.abort();
                return Err(ProcessError::Startup {
                    message: format!(
                        "rank {} timed out after {:?} waiting for {} peers",
                        rank,
                        connect_timeout,
                        size - 1
                    ),
                });
            }
        };

        info!("Rank {} joined group of {}", rank, size);
        Ok(Self {
            rank,
            size,
            local_addr,
            mailbox,
            links,
            accept_task: std::sync::Mutex::new(Some(accept_task)),
            stats: StatsCounter::default(),
        })
    }

    /// Address this rank accepts peer connections on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connect to a peer, retrying until it is listening.
    ///
    /// The caller bounds the total wait with the startup timeout.
    async fn dial(addr: SocketAddr) -> TcpStream {
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return stream,
                Err(e) => {
                    debug!("Peer {} not reachable yet: {}", addr, e);
                    tokio::time::sleep(TransportConfig::CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        rank: Rank,
        size: usize,
        mailbox: Arc<Mailbox>,
        hello_tx: mpsc::UnboundedSender<Rank>,
    ) {
        // Dropping the set when this task is aborted stops every reader.
        let mut readers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let mailbox = mailbox.clone();
                            let hello_tx = hello_tx.clone();
                            readers.spawn(async move {
                                if let Err(e) = Self::read_loop(stream, size, &mailbox, hello_tx).await {
                                    warn!("Connection from {} to rank {} failed: {}", peer_addr, rank, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Rank {} accept error: {}", rank, e);
                        }
                    }
                }
                Some(_) = readers.join_next(), if !readers.is_empty() => {}
            }
        }
    }

    async fn read_loop(
        stream: TcpStream,
        size: usize,
        mailbox: &Mailbox,
        hello_tx: mpsc::UnboundedSender<Rank>,
    ) -> Result<()> {
        let (mut reader, _writer) = stream.into_split();

        let hello = read_frame(&mut reader, 4)
            .await?
            .ok_or(ProcessError::ChannelClosed)?;
        let hello: [u8; 4] = hello.as_slice().try_into().map_err(|_| ProcessError::Decode {
            message: format!("hello frame of {} bytes", hello.len()),
        })?;
        let peer = u32::from_be_bytes(hello) as Rank;
        check_rank(peer, size)?;
        // The startup wait may already be over; a closed channel is fine.
        let _ = hello_tx.send(peer);

        while let Some(frame) = read_frame(&mut reader, TransportConfig::MAX_FRAME_SIZE).await? {
            let envelope = Envelope::decode(Bytes::from(frame))?;
            if envelope.source != peer {
                warn!(
                    "Dropping envelope claiming rank {} on connection from rank {}",
                    envelope.source, peer
                );
                continue;
            }
            if let Err(e) = mailbox.deliver(envelope) {
                debug!("Mailbox refused envelope from rank {}: {}", peer, e);
                break;
            }
        }

        debug!("Rank {} closed its connection", peer);
        Ok(())
    }

    async fn deliver(&self, dest: Rank, envelope: Envelope) -> Result<()> {
        check_rank(dest, self.size)?;
        self.stats.record(&envelope);

        if dest == self.rank {
            return self.mailbox.deliver(envelope);
        }

        let link = self.links[dest]
            .as_ref()
            .ok_or_else(|| ProcessError::transport(format!("no link to rank {}", dest)))?;
        let frame = envelope.encode()?;
        let mut writer = link.lock().await;
        write_frame(&mut *writer, &frame)
            .await
            .map_err(|e| ProcessError::transport(format!("send to rank {} failed: {}", dest, e)))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn group_size(&self) -> usize {
        self.size
    }

    async fn send(&self, dest: Rank, tag: Tag, payload: Bytes) -> Result<()> {
        self.deliver(dest, Envelope::message(self.rank, tag, payload))
            .await
    }

    async fn receive(&self, source: Rank, tag: Tag) -> Result<Bytes> {
        check_rank(source, self.size)?;
        self.mailbox.take(source, tag).await
    }

    async fn trigger_remote_call(&self, dest: Rank, tag: Tag, payload: Bytes) -> Result<()> {
        self.deliver(dest, Envelope::remote_call(self.rank, tag, payload))
            .await
    }

    async fn next_remote_call(&self) -> Result<RemoteCall> {
        self.mailbox.next_call().await
    }

    async fn finalize(&self) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        for link in self.links.iter().flatten() {
            let mut writer = link.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("Shutting down link from rank {} failed: {}", self.rank, e);
            }
        }

        let accept_task = self
            .accept_task
            .lock()
            .map_err(|e| ProcessError::Other(format!("Failed to acquire accept task lock: {}", e)))?
            .take();
        if let Some(task) = accept_task {
            task.abort();
        }

        self.mailbox.close();
        info!("Rank {} left the group", self.rank);
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Ok(mut task) = self.accept_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
