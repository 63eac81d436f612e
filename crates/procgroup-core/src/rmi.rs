//! Remote-call handler registry.
//!
//! A handler is bound to a [`Tag`]. When a remote call with that tag reaches
//! [`ProcessModule::process_rmis`], the handler runs with mutable access to
//! the module that received the call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::module::ProcessModule;
use crate::transport::{RemoteCall, Tag};

/// Reacts to remote calls carrying one tag.
#[async_trait]
pub trait RemoteCallHandler: Send + Sync {
    async fn handle(&self, module: &mut ProcessModule, call: RemoteCall) -> Result<()>;
}

/// Handlers keyed by tag. At most one handler per tag.
#[derive(Clone, Default)]
pub struct RmiRegistry {
    handlers: BTreeMap<Tag, Arc<dyn RemoteCallHandler>>,
}

impl fmt::Debug for RmiRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl RmiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `tag`, returning the handler it replaces.
    pub fn register<H>(&mut self, tag: Tag, handler: H) -> Option<Arc<dyn RemoteCallHandler>>
    where
        H: RemoteCallHandler + 'static,
    {
        self.handlers.insert(tag, Arc::new(handler))
    }

    pub fn unregister(&mut self, tag: Tag) -> Option<Arc<dyn RemoteCallHandler>> {
        self.handlers.remove(&tag)
    }

    /// The handler bound to `tag`, cloned out so the caller can lend the
    /// module to it.
    pub fn get(&self, tag: Tag) -> Option<Arc<dyn RemoteCallHandler>> {
        self.handlers.get(&tag).cloned()
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.handlers.contains_key(&tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
