//! Per-rank inbox that sorts arriving envelopes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use super::envelope::{Envelope, EnvelopeKind};
use super::{Rank, RemoteCall, Tag};
use crate::error::{ProcessError, Result};

type MessageQueues = HashMap<(Rank, Tag), VecDeque<Bytes>>;

/// Messages wait here keyed by `(source, tag)`; remote calls queue in
/// arrival order.
#[derive(Debug)]
pub(crate) struct Mailbox {
    messages: Mutex<MessageQueues>,
    arrived: Notify,
    calls_tx: Mutex<Option<mpsc::UnboundedSender<RemoteCall>>>,
    calls_rx: AsyncMutex<mpsc::UnboundedReceiver<RemoteCall>>,
    closed: AtomicBool,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        Self {
            messages: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
            calls_tx: Mutex::new(Some(calls_tx)),
            calls_rx: AsyncMutex::new(calls_rx),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_messages(&self) -> Result<MutexGuard<'_, MessageQueues>> {
        self.messages
            .lock()
            .map_err(|e| ProcessError::Other(format!("Failed to acquire mailbox lock: {}", e)))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sort an arriving envelope into the message queues or the call queue.
    pub(crate) fn deliver(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(ProcessError::ChannelClosed);
        }

        match envelope.kind {
            EnvelopeKind::Message => {
                self.lock_messages()?
                    .entry((envelope.source, envelope.tag))
                    .or_default()
                    .push_back(envelope.payload);
                self.arrived.notify_waiters();
            }
            EnvelopeKind::RemoteCall => {
                let calls = self
                    .calls_tx
                    .lock()
                    .map_err(|e| ProcessError::Other(format!("Failed to acquire call queue lock: {}", e)))?;
                let tx = calls.as_ref().ok_or(ProcessError::ChannelClosed)?;
                tx.send(RemoteCall {
                    source: envelope.source,
                    tag: envelope.tag,
                    payload: envelope.payload,
                })
                .map_err(|_| ProcessError::ChannelClosed)?;
            }
        }
        Ok(())
    }

    fn try_take(&self, source: Rank, tag: Tag) -> Result<Option<Bytes>> {
        let mut messages = self.lock_messages()?;
        let Some(queue) = messages.get_mut(&(source, tag)) else {
            return Ok(None);
        };
        let payload = queue.pop_front();
        if queue.is_empty() {
            messages.remove(&(source, tag));
        }
        Ok(payload)
    }

    /// Wait for the oldest message from `source` on `tag`.
    pub(crate) async fn take(&self, source: Rank, tag: Tag) -> Result<Bytes> {
        loop {
            // Registered before the check so a delivery in between still wakes us.
            let arrived = self.arrived.notified();
            if let Some(payload) = self.try_take(source, tag)? {
                return Ok(payload);
            }
            if self.is_closed() {
                return Err(ProcessError::ChannelClosed);
            }
            arrived.await;
        }
    }

    /// Wait for the next remote call.
    pub(crate) async fn next_call(&self) -> Result<RemoteCall> {
        let mut calls = self.calls_rx.lock().await;
        calls.recv().await.ok_or(ProcessError::ChannelClosed)
    }

    /// Number of messages waiting for a matching receive.
    pub(crate) fn pending(&self) -> usize {
        self.lock_messages()
            .map(|m| m.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Refuse further deliveries and wake every waiting receive.
    ///
    /// Remote calls already queued are still handed out.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls_tx.lock() {
            calls.take();
        }
        self.arrived.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_messages_match_source_and_tag() {
        let mailbox = Mailbox::new();
        mailbox
            .deliver(Envelope::message(2, Tag(5), Bytes::from_static(b"from 2")))
            .unwrap();
        mailbox
            .deliver(Envelope::message(1, Tag(5), Bytes::from_static(b"from 1")))
            .unwrap();
        mailbox
            .deliver(Envelope::message(1, Tag(6), Bytes::from_static(b"other tag")))
            .unwrap();

        assert_eq!(mailbox.take(1, Tag(5)).await.unwrap(), "from 1");
        assert_eq!(mailbox.take(2, Tag(5)).await.unwrap(), "from 2");
        assert_eq!(mailbox.pending(), 1);
    }

    #[tokio::test]
    async fn test_same_source_keeps_send_order() {
        let mailbox = Mailbox::new();
        for payload in [&b"first"[..], &b"second"[..], &b"third"[..]] {
            mailbox
                .deliver(Envelope::message(1, Tag(1), Bytes::copy_from_slice(payload)))
                .unwrap();
        }
        assert_eq!(mailbox.take(1, Tag(1)).await.unwrap(), "first");
        assert_eq!(mailbox.take(1, Tag(1)).await.unwrap(), "second");
        assert_eq!(mailbox.take(1, Tag(1)).await.unwrap(), "third");
    }

    #[tokio::test]
    async fn test_take_waits_for_delivery() {
        let mailbox = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.take(3, Tag(9)).await })
        };

        tokio::task::yield_now().await;
        mailbox
            .deliver(Envelope::message(3, Tag(9), Bytes::from_static(b"late")))
            .unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_remote_calls_in_arrival_order() {
        let mailbox = Mailbox::new();
        mailbox
            .deliver(Envelope::remote_call(0, Tag(1), Bytes::from_static(b"a")))
            .unwrap();
        mailbox
            .deliver(Envelope::remote_call(0, Tag(2), Bytes::from_static(b"b")))
            .unwrap();

        assert_eq!(mailbox.next_call().await.unwrap().tag, Tag(1));
        assert_eq!(mailbox.next_call().await.unwrap().tag, Tag(2));
    }

    #[tokio::test]
    async fn test_close_wakes_receivers() {
        let mailbox = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.take(1, Tag(1)).await })
        };

        tokio::task::yield_now().await;
        mailbox.close();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(ProcessError::ChannelClosed)
        ));
        assert!(matches!(
            mailbox.next_call().await,
            Err(ProcessError::ChannelClosed)
        ));
        assert!(mailbox
            .deliver(Envelope::message(1, Tag(1), Bytes::new()))
            .is_err());
    }
}
