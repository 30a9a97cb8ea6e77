//! Distributed worker
//!
//! Pulls units from a coordinator and runs them on a local engine, one per
//! slot. `build_once` fixtures are arbitrated by the coordinator.

use anyhow::{Context, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::protocol::{read_message, write_message, Envelope, ProtocolError, Reply, Request};
use crate::executor::{Flow, RunOptions, Runner};
use crate::fixture::{BuildAuthority, BuildGrant, ResourceError};
use crate::hierarchy::TestTree;
use crate::models::TestResult;
use crate::results::{ResultSink, SinkSet};

#[derive(Default)]
struct Pending {
    replies: HashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

struct ConnectionInner {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    // Shared with the reader task only, so the last handle dropped hangs up.
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
}

/// Registered connection to a coordinator, shared by all slots
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect and register `capacity` slots.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        passkey: &str,
        capacity: usize,
    ) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let register = Request::Register {
            passkey: passkey.to_string(),
            capacity,
        };
        write_message(&mut write, &Envelope::new(0, register)).await?;

        match read_message::<_, Envelope<Reply>>(&mut reader).await? {
            Some(Envelope {
                body: Reply::Registered,
                ..
            }) => {}
            Some(Envelope {
                body: Reply::Refused { reason },
                ..
            }) => return Err(ProtocolError::Refused(reason)),
            Some(other) => return Err(ProtocolError::Unexpected(format!("{:?}", other.body))),
            None => return Err(ProtocolError::Closed),
        }

        let pending = Arc::new(Mutex::new(Pending::default()));
        let routing = pending.clone();
        tokio::spawn(async move {
            loop {
                match read_message::<_, Envelope<Reply>>(&mut reader).await {
                    Ok(Some(reply)) => {
                        let sender = routing.lock().replies.remove(&reply.id);
                        match sender {
                            Some(sender) => {
                                let _ = sender.send(reply.body);
                            }
                            None => warn!("Reply to unknown request {}", reply.id),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Coordinator connection failed: {}", e);
                        break;
                    }
                }
            }
            // Dropping the senders fails every request still waiting.
            let mut pending = routing.lock();
            pending.closed = true;
            pending.replies.clear();
        });

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                writer: tokio::sync::Mutex::new(write),
                pending,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, request: Request) -> Result<Reply, ProtocolError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.closed {
                return Err(ProtocolError::Closed);
            }
            pending.replies.insert(id, tx);
        }

        {
            let mut writer = self.inner.writer.lock().await;
            write_message(&mut *writer, &Envelope::new(id, request)).await?;
        }

        rx.await.map_err(|_| ProtocolError::Closed)
    }

    /// Hang up. The coordinator still answers requests already sent.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.inner.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

/// Build authority deferring to the coordinator. Called from blocking
/// engine threads.
pub struct RemoteAuthority {
    connection: Connection,
    runtime: RuntimeHandle,
}

impl RemoteAuthority {
    pub fn new(connection: Connection, runtime: RuntimeHandle) -> Self {
        Self {
            connection,
            runtime,
        }
    }
}

impl BuildAuthority for RemoteAuthority {
    fn claim(&self, name: &str) -> Result<BuildGrant, ResourceError> {
        let query = Request::BuildQuery {
            resource: name.to_string(),
        };
        match self.runtime.block_on(self.connection.request(query)) {
            Ok(Reply::YouBuild) => Ok(BuildGrant::Build),
            Ok(Reply::AlreadyBuilt { reference }) => Ok(BuildGrant::Reuse(reference)),
            Ok(Reply::BuildFailed { cause }) => Ok(BuildGrant::Failed(cause)),
            Ok(other) => Err(ResourceError::build(
                name,
                format!("unexpected reply to build query: {other:?}"),
            )),
            Err(e) => Err(ResourceError::build(name, e)),
        }
    }

    fn report(&self, name: &str, result: Result<Option<String>, String>) {
        let (reference, error) = match result {
            Ok(reference) => (reference, None),
            Err(cause) => (None, Some(cause)),
        };
        let report = Request::ReportBuild {
            resource: name.to_string(),
            reference,
            error,
        };
        if let Err(e) = self.runtime.block_on(self.connection.request(report)) {
            warn!("Failed to report build of '{}': {}", name, e);
        }
    }
}

/// Sink forwarding results to the coordinator
pub struct RemoteSink {
    connection: Connection,
    runtime: RuntimeHandle,
}

impl RemoteSink {
    pub fn new(connection: Connection, runtime: RuntimeHandle) -> Self {
        Self {
            connection,
            runtime,
        }
    }
}

impl ResultSink for RemoteSink {
    fn on_result(&mut self, result: &TestResult) {
        let report = Request::ReportResult {
            result: result.clone(),
        };
        if let Err(e) = self.runtime.block_on(self.connection.request(report)) {
            warn!("Failed to report result of {}: {}", result.uid, e);
        }
    }
}

/// Worker runtime
pub struct Worker {
    tree: Arc<TestTree>,
    capacity: usize,
    options: RunOptions,
    skip_build: bool,
}

impl Worker {
    pub fn new(tree: Arc<TestTree>, capacity: usize) -> Self {
        Self {
            tree,
            capacity: capacity.max(1),
            options: RunOptions::default(),
            skip_build: false,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn skip_build(mut self, skip: bool) -> Self {
        self.skip_build = skip;
        self
    }

    /// Register with the coordinator and run units until there are no more.
    /// Returns the number of units run.
    pub async fn run(self, addr: impl ToSocketAddrs, passkey: &str) -> Result<usize> {
        let connection = Connection::connect(addr, passkey, self.capacity)
            .await
            .context("Failed to register with coordinator")?;
        info!("Registered with coordinator ({} slot(s))", self.capacity);

        let runtime = RuntimeHandle::current();
        let authority = Arc::new(RemoteAuthority::new(connection.clone(), runtime.clone()));
        let manager = Arc::new(
            self.tree
                .resource_manager()?
                .with_authority(authority)
                .skip_build(self.skip_build),
        );

        let sinks = SinkSet::new();
        sinks.attach(RemoteSink::new(connection.clone(), runtime));
        let runner = Arc::new(Runner::new(manager.clone(), sinks).with_options(self.options));

        {
            let (runner, tree) = (runner.clone(), self.tree.clone());
            tokio::task::spawn_blocking(move || runner.build_eager(&tree)).await?;
        }

        let slots: Vec<_> = (0..self.capacity)
            .map(|slot| {
                tokio::spawn(run_slot(
                    slot,
                    connection.clone(),
                    runner.clone(),
                    self.tree.clone(),
                ))
            })
            .collect();

        let mut units = 0;
        let mut failure = None;
        for joined in join_all(slots).await {
            match joined? {
                Ok(count) => units += count,
                Err(e) => failure = Some(e),
            }
        }

        // Fixtures built here may still be in use on other workers until the
        // last unit of the run is done. A failed slot leaves its unit
        // unfinished, so only wait when every slot ended cleanly.
        if failure.is_none() {
            match connection.request(Request::AwaitRunEnd).await {
                Ok(Reply::RunFinished) => debug!("Every unit of the run is done"),
                Ok(other) => warn!("Unexpected reply while waiting for run end: {:?}", other),
                Err(ProtocolError::Closed) => debug!("Coordinator closed the connection"),
                Err(e) => warn!("Failed to wait for run end: {}", e),
            }
        }

        tokio::task::spawn_blocking(move || manager.shutdown()).await?;
        if let Err(e) = connection.close().await {
            debug!("Failed to close coordinator connection: {}", e);
        }

        match failure {
            Some(e) => Err(e).context("Worker slot failed"),
            None => {
                info!("Worker finished after {} unit(s)", units);
                Ok(units)
            }
        }
    }
}

async fn run_slot(
    slot: usize,
    connection: Connection,
    runner: Arc<Runner>,
    tree: Arc<TestTree>,
) -> Result<usize, ProtocolError> {
    let mut units = 0;
    loop {
        let (unit, uid) = match connection.request(Request::RequestUnit).await? {
            Reply::Assign { unit, uid } => (unit, uid),
            Reply::NoMoreWork => break,
            other => return Err(ProtocolError::Unexpected(format!("{other:?}"))),
        };
        debug!("Slot {} running {}", slot, uid);

        if tree.find(&uid).is_none() {
            // Coordinator and worker collected different trees.
            warn!("Assigned unknown unit {}", uid);
            let result = TestResult::error(uid.clone(), uid.clone(), format!("unknown test uid '{uid}'"));
            connection.request(Request::ReportResult { result }).await?;
            connection.request(Request::Complete { unit }).await?;
            continue;
        }

        let flow = {
            let (runner, tree) = (runner.clone(), tree.clone());
            tokio::task::spawn_blocking(move || run_unit(&runner, &tree, &uid))
                .await
                .map_err(|e| ProtocolError::Unexpected(format!("unit panicked: {e}")))?
        };

        connection.request(Request::Complete { unit }).await?;
        units += 1;

        if flow == Flow::Abort {
            break;
        }
    }
    Ok(units)
}

fn run_unit(runner: &Runner, tree: &TestTree, uid: &str) -> Flow {
    let mut results = Vec::new();
    match tree.find(uid) {
        Some(item) => runner.run_item(item, &mut results),
        None => Flow::Continue,
    }
}
