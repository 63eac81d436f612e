//! The process module: role assignment, stream fan-out and result reduction.
//!
//! Every process of a group owns one [`ProcessModule`]. Rank 0 is the
//! controller: it runs the [`Application`] and drives the rest of the group.
//! Every other rank is a worker that sits in [`ProcessModule::process_rmis`]
//! executing what the controller sends until it is told to stop.
//!
//! # Protocols
//!
//! - **Stream dispatch**: the controller triggers [`Tag::STREAM_EXECUTION`]
//!   on ranks `1..size` in increasing order, then executes the same stream
//!   locally.
//! - **Information gathering**: every process captures a snapshot of one
//!   target object; workers send theirs to root on [`Tag::INFORMATION`] and
//!   root merges them in rank order. Root-only kinds skip the exchange.
//! - **Extension load**: every process loads locally and the results meet
//!   at root through [`Transport::gather`].
//! - **Teardown**: [`ProcessModule::exit`] triggers [`Tag::BREAK`] on every
//!   worker.
//!
//! A receive waits for its exact `(source, tag)` with no timeout, so a
//! worker that never answers stalls root.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::GroupConfig;
use crate::error::{ProcessError, Result};
use crate::information::{Information, InformationRegistry};
use crate::interpreter::{shared, Interpreter, ObjectInterpreter, SharedInterpreter};
use crate::rmi::{RemoteCallHandler, RmiRegistry};
use crate::stream::{CommandStream, ObjectId};
use crate::transport::{self, Rank, RemoteCall, Tag, Transport, CONTROLLER_RANK};

/// What a process does in its group. Fixed by its rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    /// Rank 0: runs the application and aggregates results.
    Controller,
    /// Any other rank: executes what the controller sends.
    Worker,
}

impl ProcessRole {
    pub fn for_rank(rank: Rank) -> Self {
        if rank == CONTROLLER_RANK {
            ProcessRole::Controller
        } else {
            ProcessRole::Worker
        }
    }

    pub fn is_controller(self) -> bool {
        self == ProcessRole::Controller
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Controller => write!(f, "controller"),
            ProcessRole::Worker => write!(f, "worker"),
        }
    }
}

/// Where a command stream should run.
///
/// Client, server and render server all live in this group, so every
/// destination reduces either to "every process" or to "this process".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Client,
    Server,
    ServerRoot,
    RenderServer,
    RenderServerRoot,
    ClientAndServer,
    ClientAndServerRoot,
    ClientAndRenderServer,
    ClientAndRenderServerRoot,
    RenderServerAndServer,
    RenderServerAndServerRoot,
    RenderServerClientAndServer,
}

impl Destination {
    pub const ALL: [Destination; 12] = [
        Destination::Client,
        Destination::Server,
        Destination::ServerRoot,
        Destination::RenderServer,
        Destination::RenderServerRoot,
        Destination::ClientAndServer,
        Destination::ClientAndServerRoot,
        Destination::ClientAndRenderServer,
        Destination::ClientAndRenderServerRoot,
        Destination::RenderServerAndServer,
        Destination::RenderServerAndServerRoot,
        Destination::RenderServerClientAndServer,
    ];

    /// Whether the stream fans out to every worker before running here.
    ///
    /// The render server is spread over the whole group, so even
    /// `RenderServerRoot` broadcasts.
    pub fn broadcasts(self) -> bool {
        match self {
            Destination::Server
            | Destination::RenderServer
            | Destination::RenderServerRoot
            | Destination::ClientAndServer
            | Destination::ClientAndRenderServer
            | Destination::RenderServerAndServer
            | Destination::RenderServerClientAndServer => true,
            Destination::Client
            | Destination::ServerRoot
            | Destination::ClientAndServerRoot
            | Destination::RenderServerAndServerRoot
            | Destination::ClientAndRenderServerRoot => false,
        }
    }
}

/// The program run by the controller once the group is up.
#[async_trait]
pub trait Application: Send {
    /// Drive the group. The returned status becomes the controller's.
    async fn run(&mut self, module: &mut ProcessModule) -> Result<i32>;
}

/// Per-rank results of a replicated extension load.
///
/// Root sees every rank; a worker only sees itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLoadReport {
    pub name: String,
    pub results: BTreeMap<Rank, bool>,
}

impl ModuleLoadReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            results: BTreeMap::new(),
        }
    }

    /// True when every reported rank loaded the extension.
    pub fn all_loaded(&self) -> bool {
        self.results.values().all(|loaded| *loaded)
    }

    pub fn failed_ranks(&self) -> Vec<Rank> {
        self.results
            .iter()
            .filter(|(_, loaded)| !**loaded)
            .map(|(rank, _)| *rank)
            .collect()
    }
}

/// Payload of a [`Tag::GATHER_INFORMATION`] remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GatherRequest {
    kind: String,
    object: ObjectId,
}

/// Payload of a [`Tag::LOAD_MODULE`] remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoadModuleRequest {
    name: String,
}

fn decode_request<T: for<'de> Deserialize<'de>>(call: &RemoteCall) -> Result<T> {
    serde_json::from_slice(&call.payload).map_err(|e| ProcessError::Decode {
        message: format!(
            "invalid payload for remote call {} from rank {}: {}",
            call.tag, call.source, e
        ),
    })
}

/// One process's membership in a process group.
pub struct ProcessModule {
    transport: Option<Arc<dyn Transport>>,
    interpreter: SharedInterpreter,
    stream: CommandStream,
    information: InformationRegistry,
    temporary_information: Option<Box<dyn Information>>,
    handlers: RmiRegistry,
    exited: bool,
}

impl fmt::Debug for ProcessModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessModule")
            .field("partition_id", &self.partition_id())
            .field("partition_count", &self.partition_count())
            .field("stream", &self.stream.len())
            .field("handlers", &self.handlers)
            .field("exited", &self.exited)
            .finish()
    }
}

impl Default for ProcessModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessModule {
    /// A module with no transport: a lone controller that executes
    /// everything locally.
    pub fn new() -> Self {
        Self::build(None, shared(ObjectInterpreter::new()))
    }

    /// A module around an already connected transport.
    pub fn with_transport(transport: Arc<dyn Transport>, interpreter: SharedInterpreter) -> Self {
        Self::build(Some(transport), interpreter)
    }

    fn build(transport: Option<Arc<dyn Transport>>, interpreter: SharedInterpreter) -> Self {
        let mut module = Self {
            transport,
            interpreter,
            stream: CommandStream::new(),
            information: InformationRegistry::default(),
            temporary_information: None,
            handlers: RmiRegistry::new(),
            exited: false,
        };
        module.register_handler(Tag::STREAM_EXECUTION, StreamExecutionHandler);
        module.register_handler(Tag::GATHER_INFORMATION, GatherInformationHandler);
        module.register_handler(Tag::LOAD_MODULE, LoadModuleHandler);
        module
    }

    /// Replace the information kinds this module can gather.
    pub fn with_information_registry(mut self, registry: InformationRegistry) -> Self {
        self.information = registry;
        self
    }

    /// Join the group described by `config` and run the entry routine.
    ///
    /// Returns the controller's status on rank 0 and 0 on workers.
    pub async fn start<A>(config: &GroupConfig, app: &mut A) -> Result<i32>
    where
        A: Application + ?Sized,
    {
        Self::start_with_interpreter(config, shared(ObjectInterpreter::new()), app).await
    }

    /// Like [`ProcessModule::start`], with a caller supplied interpreter.
    pub async fn start_with_interpreter<A>(
        config: &GroupConfig,
        interpreter: SharedInterpreter,
        app: &mut A,
    ) -> Result<i32>
    where
        A: Application + ?Sized,
    {
        let transport = transport::connect(config).await.map_err(|e| match e {
            ProcessError::Startup { .. } => e,
            other => ProcessError::Startup {
                message: other.to_string(),
            },
        })?;

        let size = transport.group_size();
        let rank = transport.local_rank();
        let mut module = Self::with_transport(transport, interpreter);

        if size > 1 {
            let span = info_span!("node", rank, size);
            module.run(app, config.interactive).instrument(span).await
        } else {
            module.run(app, config.interactive).await
        }
    }

    /// The entry routine every process runs once the group is up.
    ///
    /// The controller runs `app` (or nothing when not interactive), then
    /// tears the group down unless the application already did. Workers
    /// serve remote calls until teardown. The transport is finalized on
    /// every path.
    pub async fn run<A>(&mut self, app: &mut A, interactive: bool) -> Result<i32>
    where
        A: Application + ?Sized,
    {
        let role = self.role();
        info!(
            "Process {} of {} running as {}",
            self.partition_id(),
            self.partition_count(),
            role
        );

        let result = match role {
            ProcessRole::Controller => {
                let status = if interactive {
                    app.run(self).await
                } else {
                    info!("Not interactive, finishing immediately");
                    Ok(0)
                };
                let teardown = self.exit().await;
                match (status, teardown) {
                    (Ok(status), Ok(())) => Ok(status),
                    (Err(e), _) | (Ok(_), Err(e)) => Err(e),
                }
            }
            ProcessRole::Worker => self.process_rmis().await.map(|()| 0),
        };

        let finalized = self.finalize().await;
        let status = result?;
        finalized?;
        info!("Process {} finished with status {}", self.partition_id(), status);
        Ok(status)
    }

    async fn finalize(&self) -> Result<()> {
        match &self.transport {
            Some(transport) => transport.finalize().await,
            None => Ok(()),
        }
    }

    /// Tear the group down: trigger [`Tag::BREAK`] on every worker.
    ///
    /// Controller only. A second call sends nothing.
    pub async fn exit(&mut self) -> Result<()> {
        if !self.role().is_controller() {
            return Err(ProcessError::NotController);
        }
        if self.exited {
            debug!("Group already torn down");
            return Ok(());
        }
        self.exited = true;

        let Some(transport) = self.transport.clone() else {
            return Ok(());
        };
        let rank = transport.local_rank();
        for worker in (0..transport.group_size()).filter(|r| *r != rank) {
            debug!("Sending teardown to rank {}", worker);
            transport
                .trigger_remote_call(worker, Tag::BREAK, Bytes::new())
                .await?;
        }
        Ok(())
    }

    /// Whether [`ProcessModule::exit`] already ran.
    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// This process's rank, or 0 without a transport.
    pub fn partition_id(&self) -> Rank {
        self.transport
            .as_ref()
            .map(|t| t.local_rank())
            .unwrap_or(CONTROLLER_RANK)
    }

    /// Size of the group, or 1 without a transport.
    pub fn partition_count(&self) -> usize {
        self.transport.as_ref().map(|t| t.group_size()).unwrap_or(1)
    }

    pub fn role(&self) -> ProcessRole {
        ProcessRole::for_rank(self.partition_id())
    }

    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    pub fn interpreter(&self) -> &SharedInterpreter {
        &self.interpreter
    }

    fn lock_interpreter(&self) -> Result<MutexGuard<'_, dyn Interpreter + 'static>> {
        self.interpreter
            .lock()
            .map_err(|e| ProcessError::Other(format!("Failed to acquire interpreter lock: {}", e)))
    }

    fn execute_locally(&self, data: &[u8]) -> Result<()> {
        self.lock_interpreter()?.execute_stream(data)
    }

    /// The resident stream consumed by [`ProcessModule::send_stream`].
    pub fn stream(&self) -> &CommandStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut CommandStream {
        &mut self.stream
    }

    /// Dispatch the resident stream to `destination` and reset it.
    pub async fn send_stream(&mut self, destination: Destination) -> Result<()> {
        let mut stream = std::mem::take(&mut self.stream);
        let result = if destination.broadcasts() {
            self.dispatch_to_workers_and_self(&mut stream).await
        } else {
            self.dispatch_to_self_only(&mut stream)
        };
        self.stream = stream;
        result
    }

    /// Execute `stream` on every worker and then here. The stream is reset
    /// whether or not execution succeeded.
    pub async fn dispatch_to_workers_and_self(&self, stream: &mut CommandStream) -> Result<()> {
        let result = self.broadcast_and_execute(stream.data()).await;
        stream.reset();
        result
    }

    async fn broadcast_and_execute(&self, data: &[u8]) -> Result<()> {
        if let Some(transport) = &self.transport {
            let rank = transport.local_rank();
            let payload = Bytes::copy_from_slice(data);
            for worker in (1..transport.group_size()).filter(|r| *r != rank) {
                transport
                    .trigger_remote_call(worker, Tag::STREAM_EXECUTION, payload.clone())
                    .await?;
            }
        }
        self.execute_locally(data)
    }

    /// Execute `stream` here only, then reset it.
    pub fn dispatch_to_self_only(&self, stream: &mut CommandStream) -> Result<()> {
        let result = self.execute_locally(stream.data());
        stream.reset();
        result
    }

    /// Execute `stream` on one process. The local rank runs it directly
    /// without going through the transport.
    pub async fn send_stream_to_server_node_internal(
        &self,
        rank: Rank,
        stream: &CommandStream,
    ) -> Result<()> {
        if rank == self.partition_id() {
            return self.execute_locally(stream.data());
        }

        let transport = self
            .transport
            .as_ref()
            .ok_or(ProcessError::InvalidRank { rank, size: 1 })?;
        transport
            .trigger_remote_call(rank, Tag::STREAM_EXECUTION, Bytes::copy_from_slice(stream.data()))
            .await
    }

    /// The inner content of the interpreter object `object` is gathered
    /// from every process into one `kind` snapshot at root.
    ///
    /// Controller only. Both the kind and the target are checked on root
    /// before any worker is involved, so a bad request leaves no frames
    /// behind.
    pub async fn gather_information(
        &mut self,
        kind: &str,
        object: ObjectId,
    ) -> Result<Option<&dyn Information>> {
        if !self.role().is_controller() {
            return Err(ProcessError::NotController);
        }
        self.create_information(kind)?;
        self.check_target(object)?;

        if let Some(transport) = self.transport.clone() {
            let request = serde_json::to_vec(&GatherRequest {
                kind: kind.to_string(),
                object,
            })?;
            let payload = Bytes::from(request);
            let rank = transport.local_rank();
            for worker in (0..transport.group_size()).filter(|r| *r != rank) {
                transport
                    .trigger_remote_call(worker, Tag::GATHER_INFORMATION, payload.clone())
                    .await?;
            }
        }

        self.gather_information_internal(kind, object).await
    }

    /// This process's part of an information gather.
    ///
    /// Workers send their snapshot to root (nothing for root-only kinds)
    /// and return `None`. Root merges everything into
    /// [`ProcessModule::temporary_information`] and returns it.
    pub async fn gather_information_internal(
        &mut self,
        kind: &str,
        object: ObjectId,
    ) -> Result<Option<&dyn Information>> {
        let mut snapshot = self.create_information(kind)?;
        self.check_target(object)?;

        let rank = self.partition_id();
        if rank != CONTROLLER_RANK {
            if snapshot.root_only() {
                debug!("{} is root only, nothing to send", kind);
                return Ok(None);
            }
            self.capture(snapshot.as_mut(), object)?;
            let transport = self.transport.clone().ok_or(ProcessError::InvalidRank {
                rank: CONTROLLER_RANK,
                size: 1,
            })?;
            let data = snapshot.encode()?;
            debug!("Sending {} ({} bytes) to root", kind, data.len());
            transport
                .send(CONTROLLER_RANK, Tag::INFORMATION, Bytes::from(data))
                .await?;
            return Ok(None);
        }

        self.capture(snapshot.as_mut(), object)?;
        if !snapshot.root_only() {
            if let Some(transport) = self.transport.clone() {
                // Every worker's frame is taken off the mailbox even after a
                // bad one, so the next gather starts from an empty queue.
                let mut first_error = None;
                for worker in 1..transport.group_size() {
                    let data = transport.receive(worker, Tag::INFORMATION).await?;
                    if first_error.is_some() {
                        continue;
                    }
                    let merged = self.create_information(kind).and_then(|mut piece| {
                        piece.decode(&data)?;
                        snapshot.merge(piece.as_ref())
                    });
                    if let Err(e) = merged {
                        warn!("Dropping {} from rank {}: {}", kind, worker, e);
                        first_error = Some(e);
                    }
                }
                if let Some(e) = first_error {
                    return Err(e);
                }
            }
        }

        self.temporary_information = Some(snapshot);
        Ok(self.temporary_information.as_deref())
    }

    /// Result of the last gather completed on root.
    pub fn temporary_information(&self) -> Option<&dyn Information> {
        self.temporary_information.as_deref()
    }

    fn create_information(&self, kind: &str) -> Result<Box<dyn Information>> {
        self.information.create(kind).ok_or_else(|| {
            error!("Could not create information object {}", kind);
            ProcessError::UnknownInformationKind {
                kind: kind.to_string(),
            }
        })
    }

    fn check_target(&self, object: ObjectId) -> Result<()> {
        if self.lock_interpreter()?.object(object).is_none() {
            error!("No object with id {} to gather from", object);
            return Err(ProcessError::NullTarget { object });
        }
        Ok(())
    }

    fn capture(&self, snapshot: &mut dyn Information, object: ObjectId) -> Result<()> {
        let interpreter = self.lock_interpreter()?;
        let target = interpreter
            .object(object)
            .ok_or(ProcessError::NullTarget { object })?;
        snapshot.capture_from(target)
    }

    /// Load extension `name` on every process.
    ///
    /// Controller only. Returns true when every process loaded it.
    pub async fn load_module(&mut self, name: &str) -> Result<bool> {
        if !self.role().is_controller() {
            return Err(ProcessError::NotController);
        }

        if let Some(transport) = self.transport.clone() {
            let payload = Bytes::from(serde_json::to_vec(&LoadModuleRequest {
                name: name.to_string(),
            })?);
            let rank = transport.local_rank();
            for worker in (0..transport.group_size()).filter(|r| *r != rank) {
                transport
                    .trigger_remote_call(worker, Tag::LOAD_MODULE, payload.clone())
                    .await?;
            }
        }

        self.load_module_internal(name).await
    }

    /// This process's part of an extension load.
    ///
    /// Root gets the AND over the group; a worker gets its own result
    /// rather than an unconditional success.
    pub async fn load_module_internal(&self, name: &str) -> Result<bool> {
        Ok(self.load_module_report(name).await?.all_loaded())
    }

    /// Same protocol as [`ProcessModule::load_module_internal`], keeping
    /// the result of every rank.
    pub async fn load_module_report(&self, name: &str) -> Result<ModuleLoadReport> {
        let loaded = self.lock_interpreter()?.load_extension(name);
        let rank = self.partition_id();
        let mut report = ModuleLoadReport::new(name);

        let transport = match &self.transport {
            Some(transport) if transport.supports_collectives() => transport,
            _ => {
                report.results.insert(rank, loaded);
                return Ok(report);
            }
        };

        match transport
            .gather(CONTROLLER_RANK, Bytes::from(vec![loaded as u8]))
            .await?
        {
            Some(results) => {
                for (peer, result) in results.iter().enumerate() {
                    report.results.insert(peer, result.first() == Some(&1));
                }
                let failed = report.failed_ranks();
                if !failed.is_empty() {
                    warn!("Extension {} failed to load on ranks {:?}", name, failed);
                }
            }
            None => {
                report.results.insert(rank, loaded);
            }
        }
        Ok(report)
    }

    /// Bind a handler to remote calls carrying `tag`.
    pub fn register_handler<H>(&mut self, tag: Tag, handler: H)
    where
        H: RemoteCallHandler + 'static,
    {
        if self.handlers.register(tag, handler).is_some() {
            debug!("Replaced handler for remote call {}", tag);
        }
    }

    pub fn unregister_handler(&mut self, tag: Tag) -> bool {
        self.handlers.unregister(tag).is_some()
    }

    pub fn handlers(&self) -> &RmiRegistry {
        &self.handlers
    }

    /// Serve remote calls until [`Tag::BREAK`] arrives.
    ///
    /// Handler failures are logged and the loop keeps going. Calls with no
    /// handler are dropped.
    pub async fn process_rmis(&mut self) -> Result<()> {
        let Some(transport) = self.transport.clone() else {
            debug!("No transport, no remote calls to serve");
            return Ok(());
        };

        loop {
            let call = transport.next_remote_call().await?;
            let (source, tag) = (call.source, call.tag);

            if tag == Tag::BREAK {
                info!("Teardown received from rank {}", source);
                return Ok(());
            }

            let handler = self.handlers.get(tag);
            match handler {
                Some(handler) => {
                    if let Err(e) = handler.handle(self, call).await {
                        error!(
                            "Remote call {} from rank {} failed: {}",
                            tag, source, e
                        );
                    }
                }
                None => {
                    warn!("No handler for remote call {} from rank {}", tag, source);
                }
            }
        }
    }
}

struct StreamExecutionHandler;

#[async_trait]
impl RemoteCallHandler for StreamExecutionHandler {
    async fn handle(&self, module: &mut ProcessModule, call: RemoteCall) -> Result<()> {
        module.execute_locally(&call.payload)
    }
}

struct GatherInformationHandler;

#[async_trait]
impl RemoteCallHandler for GatherInformationHandler {
    async fn handle(&self, module: &mut ProcessModule, call: RemoteCall) -> Result<()> {
        let request: GatherRequest = decode_request(&call)?;
        module
            .gather_information_internal(&request.kind, request.object)
            .await
            .map(|_| ())
    }
}

struct LoadModuleHandler;

#[async_trait]
impl RemoteCallHandler for LoadModuleHandler {
    async fn handle(&self, module: &mut ProcessModule, call: RemoteCall) -> Result<()> {
        let request: LoadModuleRequest = decode_request(&call)?;
        module.load_module_internal(&request.name).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::information::DataInformation;
    use crate::objects::PointCloud;
    use crate::stream::Value;
    use crate::transport::{local_group, LoopbackTransport, TransportStats};

    fn cloud_stream(id: ObjectId, points: &[[f64; 3]]) -> CommandStream {
        let mut stream = CommandStream::new();
        stream.new_object(PointCloud::CLASS_NAME, id).unwrap();
        for p in points {
            stream
                .invoke(
                    id,
                    "AddPoint",
                    vec![Value::Float(p[0]), Value::Float(p[1]), Value::Float(p[2])],
                )
                .unwrap();
        }
        stream
    }

    #[test]
    fn test_role_for_rank() {
        assert_eq!(ProcessRole::for_rank(0), ProcessRole::Controller);
        assert_eq!(ProcessRole::for_rank(3), ProcessRole::Worker);
        assert_eq!(ProcessRole::Worker.to_string(), "worker");
    }

    #[test]
    fn test_destination_mapping() {
        let broadcast: Vec<_> = Destination::ALL
            .iter()
            .filter(|d| d.broadcasts())
            .collect();
        assert_eq!(broadcast.len(), 7);
        assert!(Destination::RenderServerRoot.broadcasts());
        assert!(!Destination::ServerRoot.broadcasts());
        assert!(!Destination::Client.broadcasts());

        let parsed: Destination = serde_json::from_str("\"client_and_server_root\"").unwrap();
        assert_eq!(parsed, Destination::ClientAndServerRoot);
    }

    #[test]
    fn test_load_report() {
        let mut report = ModuleLoadReport::new("Filters");
        report.results.insert(0, true);
        report.results.insert(1, false);
        report.results.insert(2, true);
        assert!(!report.all_loaded());
        assert_eq!(report.failed_ranks(), vec![1]);
        assert!(ModuleLoadReport::new("Empty").all_loaded());
    }

    #[tokio::test]
    async fn test_defaults_without_transport() {
        let mut module = ProcessModule::new();
        assert_eq!(module.partition_id(), 0);
        assert_eq!(module.partition_count(), 1);
        assert_eq!(module.role(), ProcessRole::Controller);
        assert!(module.transport().is_none());

        // Nothing to serve and nobody to tear down
        module.process_rmis().await.unwrap();
        module.exit().await.unwrap();
        assert!(module.has_exited());
    }

    #[tokio::test]
    async fn test_send_stream_resets_resident_stream() {
        let mut module = ProcessModule::new();
        *module.stream_mut() = cloud_stream(ObjectId(1), &[[1.0, 2.0, 3.0]]);

        module.send_stream(Destination::Client).await.unwrap();
        assert!(module.stream().is_empty());
        assert!(module.interpreter().lock().unwrap().object(ObjectId(1)).is_some());
    }

    #[tokio::test]
    async fn test_failed_dispatch_still_resets() {
        let module = ProcessModule::new();
        let mut stream = CommandStream::new();
        stream.invoke(ObjectId(4), "Clear", vec![]).unwrap();

        let result = module.dispatch_to_workers_and_self(&mut stream).await;
        assert!(matches!(result, Err(ProcessError::Interpreter { .. })));
        assert!(stream.is_empty());

        let mut stream = CommandStream::new();
        stream.invoke(ObjectId(4), "Clear", vec![]).unwrap();
        assert!(module.dispatch_to_self_only(&mut stream).is_err());
        assert!(stream.is_empty());
    }

    #[tokio::test]
    async fn test_self_node_dispatch_skips_transport() {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let module = ProcessModule::with_transport(transport.clone(), shared(ObjectInterpreter::new()));

        let stream = cloud_stream(ObjectId(2), &[]);
        module
            .send_stream_to_server_node_internal(0, &stream)
            .await
            .unwrap();

        assert_eq!(transport.stats(), TransportStats::default());
        assert!(module.interpreter().lock().unwrap().object(ObjectId(2)).is_some());
    }

    #[tokio::test]
    async fn test_single_process_gather_is_local_snapshot() {
        let mut module = ProcessModule::new();
        let mut stream = cloud_stream(ObjectId(1), &[[0.0, 0.0, 0.0], [1.0, 2.0, 3.0]]);
        module.dispatch_to_self_only(&mut stream).unwrap();

        let info = module
            .gather_information(DataInformation::KIND, ObjectId(1))
            .await
            .unwrap()
            .unwrap();
        let info = info.as_any().downcast_ref::<DataInformation>().unwrap();
        assert_eq!(info.number_of_points, 2);
        assert_eq!(info.number_of_partitions, 1);
        assert!(module.temporary_information().is_some());
    }

    #[tokio::test]
    async fn test_gather_rejects_unknown_kind_and_missing_target() {
        let mut module = ProcessModule::new();
        let result = module.gather_information("NoSuchInformation", ObjectId(1)).await;
        assert!(matches!(
            result,
            Err(ProcessError::UnknownInformationKind { .. })
        ));

        let result = module
            .gather_information(DataInformation::KIND, ObjectId(99))
            .await;
        assert!(matches!(
            result,
            Err(ProcessError::NullTarget {
                object: ObjectId(99)
            })
        ));
        assert!(module.temporary_information().is_none());
    }

    #[tokio::test]
    async fn test_worker_only_operations() {
        let mut group = local_group(2);
        let worker: Arc<dyn Transport> = Arc::new(group.remove(1));
        let mut module = ProcessModule::with_transport(worker, shared(ObjectInterpreter::new()));

        assert_eq!(module.role(), ProcessRole::Worker);
        assert!(matches!(module.exit().await, Err(ProcessError::NotController)));
        assert!(matches!(
            module.load_module("Filters").await,
            Err(ProcessError::NotController)
        ));
    }

    #[tokio::test]
    async fn test_loopback_load_module_falls_back_to_local() {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let mut interpreter = ObjectInterpreter::new();
        interpreter.register_extension(
            crate::interpreter::Extension::new("Filters").with_class("Glyphs", PointCloud::create),
        );
        let mut module = ProcessModule::with_transport(transport.clone(), shared(interpreter));

        assert!(module.load_module("Filters").await.unwrap());
        assert!(!module.load_module("Missing").await.unwrap());
        assert_eq!(transport.stats(), TransportStats::default());
    }

    #[tokio::test]
    async fn test_builtin_handlers_registered() {
        let module = ProcessModule::new();
        for tag in [Tag::STREAM_EXECUTION, Tag::GATHER_INFORMATION, Tag::LOAD_MODULE] {
            assert!(module.handlers().contains(tag));
        }
        assert!(!module.handlers().contains(Tag::BREAK));
    }
}
