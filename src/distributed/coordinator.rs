//! Distributed coordinator
//!
//! Hands indivisible units (suites, or single targeted cases) to workers on
//! request, arbitrates `build_once` fixtures across the fleet and forwards
//! reported results to its sinks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::protocol::{read_message, write_message, Envelope, ProtocolError, Reply, Request};
use crate::hierarchy::{HierarchyError, TestTree};
use crate::models::{RunSummary, TestResult};
use crate::results::SinkSet;

/// Units of a run: every suite, or exactly the requested uids.
pub fn plan_units(tree: &TestTree, uids: &[String]) -> Result<Vec<String>, HierarchyError> {
    if uids.is_empty() {
        return Ok(tree.suites().iter().map(|s| s.uid()).collect());
    }
    for uid in uids {
        if tree.find(uid).is_none() {
            return Err(HierarchyError::UnknownUid(uid.clone()));
        }
    }
    Ok(uids.to_vec())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitState {
    Pending,
    Assigned,
    Done,
}

#[derive(Debug)]
struct QueueInner {
    units: Vec<(String, UnitState)>,
    stopped: bool,
}

impl QueueInner {
    fn is_finished(&self) -> bool {
        self.units.iter().all(|(_, state)| match state {
            UnitState::Done => true,
            UnitState::Pending => self.stopped,
            UnitState::Assigned => false,
        })
    }
}

/// Units and their assignment state. A unit is handed out exactly once.
#[derive(Debug)]
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    finished: Notify,
}

impl WorkQueue {
    pub fn new(uids: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                units: uids.into_iter().map(|u| (u, UnitState::Pending)).collect(),
                stopped: false,
            }),
            finished: Notify::new(),
        }
    }

    /// Assign the next pending unit
    pub fn next(&self) -> Option<(u64, String)> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return None;
        }
        let (idx, (uid, state)) = inner
            .units
            .iter_mut()
            .enumerate()
            .find(|(_, (_, state))| *state == UnitState::Pending)?;
        *state = UnitState::Assigned;
        Some((idx as u64, uid.clone()))
    }

    /// Mark an assigned unit done. Returns false for unknown or unassigned units.
    pub fn complete(&self, unit: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some((_, state)) = inner.units.get_mut(unit as usize) else {
            return false;
        };
        if *state != UnitState::Assigned {
            return false;
        }
        *state = UnitState::Done;

        if inner.is_finished() {
            self.finished.notify_waiters();
        }
        true
    }

    /// Stop handing out units; those already assigned still complete.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        if inner.is_finished() {
            self.finished.notify_waiters();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().is_finished()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every unit is done, or stopped and every assigned one done.
    /// A unit whose worker vanished is never reclaimed, so this then waits
    /// forever.
    pub async fn wait_finished(&self) {
        loop {
            let notified = self.finished.notified();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Debug)]
enum BuildEntry {
    Building,
    Built(Option<String>),
    Failed(String),
}

/// Fleet-wide record of `build_once` fixtures
#[derive(Debug, Default)]
pub struct BuildRegistry {
    entries: Mutex<HashMap<String, BuildEntry>>,
    changed: Notify,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer a build query. The first asker is granted the build; later
    /// askers wait for its report.
    pub async fn query(&self, resource: &str) -> Reply {
        loop {
            let notified = self.changed.notified();
            {
                let mut entries = self.entries.lock();
                match entries.get(resource) {
                    None => {
                        entries.insert(resource.to_string(), BuildEntry::Building);
                        debug!("Granting build of '{}'", resource);
                        return Reply::YouBuild;
                    }
                    Some(BuildEntry::Built(reference)) => {
                        return Reply::AlreadyBuilt {
                            reference: reference.clone(),
                        }
                    }
                    Some(BuildEntry::Failed(cause)) => {
                        return Reply::BuildFailed {
                            cause: cause.clone(),
                        }
                    }
                    Some(BuildEntry::Building) => {}
                }
            }
            notified.await;
        }
    }

    pub fn report(&self, resource: &str, result: Result<Option<String>, String>) {
        let entry = match result {
            Ok(reference) => {
                info!("Fixture '{}' built", resource);
                BuildEntry::Built(reference)
            }
            Err(cause) => {
                warn!("Fixture '{}' failed to build: {}", resource, cause);
                BuildEntry::Failed(cause)
            }
        };
        self.entries.lock().insert(resource.to_string(), entry);
        self.changed.notify_waiters();
    }
}

/// Coordinator options
#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    pub passkey: String,
    /// Concurrent request handlers
    pub threads: usize,
    /// Stop assigning units after the first failure
    pub fail_fast: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            passkey: String::new(),
            threads: 1,
            fail_fast: false,
        }
    }
}

/// A worker that registered during the run
#[derive(Clone, Debug, PartialEq, Eq)]
struct WorkerInfo {
    peer: SocketAddr,
    capacity: usize,
}

struct Shared {
    options: CoordinatorOptions,
    queue: WorkQueue,
    builds: BuildRegistry,
    sinks: SinkSet,
    dispatchers: Semaphore,
    results: Mutex<Vec<TestResult>>,
    workers: Mutex<Vec<WorkerInfo>>,
}

impl Shared {
    /// Record a registration; returns the fleet's worker count and slots.
    fn register(&self, peer: SocketAddr, capacity: usize) -> (usize, usize) {
        let mut workers = self.workers.lock();
        workers.push(WorkerInfo { peer, capacity });
        (workers.len(), workers.iter().map(|w| w.capacity).sum())
    }

    async fn dispatch(&self, request: Request) -> Reply {
        // Requests that wait on other workers must not hold a dispatcher.
        let _permit = match &request {
            Request::BuildQuery { .. } | Request::AwaitRunEnd => None,
            _ => match self.dispatchers.acquire().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return Reply::Error {
                        message: "coordinator shutting down".to_string(),
                    }
                }
            },
        };

        match request {
            Request::BuildQuery { resource } => self.builds.query(&resource).await,
            Request::RequestUnit => match self.queue.next() {
                Some((unit, uid)) => {
                    debug!("Assigning unit {} ({})", unit, uid);
                    Reply::Assign { unit, uid }
                }
                None => Reply::NoMoreWork,
            },
            Request::ReportResult { result } => {
                if self.options.fail_fast && result.status.is_failure() {
                    info!("Fail fast: no further units will be assigned");
                    self.queue.stop();
                }
                self.sinks.result(&result);
                self.results.lock().push(result);
                Reply::Ack
            }
            Request::ReportBuild {
                resource,
                reference,
                error,
            } => {
                let result = match error {
                    Some(cause) => Err(cause),
                    None => Ok(reference),
                };
                self.builds.report(&resource, result);
                Reply::Ack
            }
            Request::Complete { unit } => {
                if !self.queue.complete(unit) {
                    warn!("Completion for unknown or unassigned unit {}", unit);
                }
                Reply::Ack
            }
            Request::AwaitRunEnd => {
                self.queue.wait_finished().await;
                Reply::RunFinished
            }
            Request::Register { .. } => Reply::Error {
                message: "already registered".to_string(),
            },
        }
    }
}

/// Server side of a distributed run
pub struct Coordinator {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Coordinator {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        units: Vec<String>,
        sinks: SinkSet,
        options: CoordinatorOptions,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let threads = options.threads.max(1);

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                options,
                queue: WorkQueue::new(units),
                builds: BuildRegistry::new(),
                sinks,
                dispatchers: Semaphore::new(threads),
                results: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept workers until every unit is done, then wait for every worker
    /// to hang up and return the summary. Workers only hang up after their
    /// last reply arrived and their fixtures are torn down.
    pub async fn serve(self) -> RunSummary {
        let Coordinator { listener, shared } = self;
        info!(
            "Coordinator listening on {} with {} unit(s)",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            shared.queue.len()
        );
        shared.sinks.run_start();

        let mut connections = JoinSet::new();
        tokio::select! {
            _ = shared.queue.wait_finished() => {}
            _ = accept_loop(&listener, shared.clone(), &mut connections) => {}
        }
        drop(listener);

        if !connections.is_empty() {
            debug!("Waiting for {} worker connection(s) to close", connections.len());
        }
        while connections.join_next().await.is_some() {}

        let results = std::mem::take(&mut *shared.results.lock());
        let summary = RunSummary::new(results);
        let workers = shared.workers.lock();
        info!(
            "Distributed run completed - {} ({}/{} passed) on {} worker(s) with {} slot(s)",
            summary.outcome(),
            summary.passed,
            summary.total,
            workers.len(),
            workers.iter().map(|w| w.capacity).sum::<usize>()
        );
        for worker in workers.iter() {
            debug!("Worker {} served {} slot(s)", worker.peer, worker.capacity);
        }
        drop(workers);
        shared.sinks.run_end(&summary);
        summary
    }
}

async fn accept_loop(listener: &TcpListener, shared: Arc<Shared>, connections: &mut JoinSet<()>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                connections.spawn(async move {
                    match handle_connection(stream, peer, shared).await {
                        Ok(()) => debug!("Worker {} disconnected", peer),
                        Err(e) => warn!("Worker {}: {}", peer, e),
                    }
                });
            }
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), ProtocolError> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let Some(first) = read_message::<_, Envelope<Request>>(&mut reader).await? else {
        return Ok(());
    };
    match first.body {
        Request::Register { passkey, capacity } if passkey == shared.options.passkey => {
            let (workers, slots) = shared.register(peer, capacity);
            info!(
                "Worker {} registered with {} slot(s); fleet: {} worker(s), {} slot(s)",
                peer, capacity, workers, slots
            );
            write_message(&mut write, &Envelope::new(first.id, Reply::Registered)).await?;
        }
        Request::Register { .. } => {
            let reason = "invalid passkey".to_string();
            let reply = Reply::Refused {
                reason: reason.clone(),
            };
            write_message(&mut write, &Envelope::new(first.id, reply)).await?;
            return Err(ProtocolError::Refused(reason));
        }
        other => return Err(ProtocolError::Unexpected(format!("{other:?}"))),
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope<Reply>>();
    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            write_message(&mut write, &reply).await?;
        }
        Ok::<(), ProtocolError>(())
    });

    while let Some(request) = read_message::<_, Envelope<Request>>(&mut reader).await? {
        let shared = shared.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = shared.dispatch(request.body).await;
            let _ = tx.send(Envelope::new(request.id, reply));
        });
    }

    drop(tx);
    match writer.await {
        Ok(result) => result,
        Err(e) => Err(ProtocolError::Io(io::Error::other(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    #[test]
    fn test_queue_assigns_each_unit_once() {
        let queue = WorkQueue::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(queue.next(), Some((0, "a".to_string())));
        assert_eq!(queue.next(), Some((1, "b".to_string())));
        assert_eq!(queue.next(), None);
        assert!(!queue.is_finished());

        assert!(queue.complete(0));
        assert!(!queue.complete(0));
        assert!(queue.complete(1));
        assert!(queue.is_finished());
    }

    #[test]
    fn test_queue_stop_leaves_pending_units() {
        let queue = WorkQueue::new(vec!["a".to_string(), "b".to_string()]);
        let (unit, _) = queue.next().unwrap();
        queue.stop();

        assert_eq!(queue.next(), None);
        assert!(!queue.is_finished());
        queue.complete(unit);
        assert!(queue.is_finished());
    }

    #[test]
    fn test_complete_rejects_pending_unit() {
        let queue = WorkQueue::new(vec!["a".to_string()]);
        assert!(!queue.complete(0));
        assert!(!queue.complete(9));
    }

    #[tokio::test]
    async fn test_wait_finished_wakes_on_completion() {
        let queue = Arc::new(WorkQueue::new(vec!["a".to_string()]));
        let (unit, _) = queue.next().unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_finished().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.complete(unit);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_registry_grants_one_builder() {
        let registry = Arc::new(BuildRegistry::new());
        assert_eq!(registry.query("gem5").await, Reply::YouBuild);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.query("gem5").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.report("gem5", Ok(Some("/build/gem5.opt".to_string())));
        let reply = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reply,
            Reply::AlreadyBuilt {
                reference: Some("/build/gem5.opt".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_registry_concurrent_queries() {
        let registry = Arc::new(BuildRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.query("gem5").await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.report("gem5", Err("scons exited with 2".to_string()));

        let mut replies = Vec::new();
        for handle in handles {
            replies.push(
                tokio::time::timeout(Duration::from_secs(5), handle)
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(replies.iter().filter(|r| **r == Reply::YouBuild).count(), 1);
        assert!(replies.contains(&Reply::BuildFailed {
            cause: "scons exited with 2".to_string()
        }));
    }

    #[tokio::test]
    async fn test_dispatch_fail_fast_stops_queue() {
        let coordinator = Coordinator::bind(
            "127.0.0.1:0",
            vec!["a".to_string(), "b".to_string()],
            SinkSet::new(),
            CoordinatorOptions {
                fail_fast: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let shared = coordinator.shared.clone();

        assert!(matches!(
            shared.dispatch(Request::RequestUnit).await,
            Reply::Assign { unit: 0, .. }
        ));
        let result = TestResult::fail("m:TestCase:x", "x", 1, "boom");
        assert_eq!(
            shared.dispatch(Request::ReportResult { result }).await,
            Reply::Ack
        );
        assert_eq!(shared.dispatch(Request::RequestUnit).await, Reply::NoMoreWork);

        shared.dispatch(Request::Complete { unit: 0 }).await;
        assert!(shared.queue.is_finished());
    }

    #[tokio::test]
    async fn test_await_run_end_holds_no_dispatcher() {
        let coordinator = Coordinator::bind(
            "127.0.0.1:0",
            vec!["a".to_string()],
            SinkSet::new(),
            CoordinatorOptions::default(),
        )
        .await
        .unwrap();
        let shared = coordinator.shared.clone();

        let waiter = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.dispatch(Request::AwaitRunEnd).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The only dispatcher is still free for the unit's own traffic.
        assert!(matches!(
            shared.dispatch(Request::RequestUnit).await,
            Reply::Assign { unit: 0, .. }
        ));
        assert!(!waiter.is_finished());

        shared.dispatch(Request::Complete { unit: 0 }).await;
        let reply = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Reply::RunFinished);
    }

    async fn call(
        reader: &mut BufReader<OwnedReadHalf>,
        write: &mut OwnedWriteHalf,
        id: u64,
        request: Request,
    ) -> Reply {
        write_message(write, &Envelope::new(id, request)).await.unwrap();
        let reply: Envelope<Reply> = read_message(reader).await.unwrap().unwrap();
        assert_eq!(reply.id, id);
        reply.body
    }

    #[tokio::test]
    async fn test_serve_records_workers_and_waits_for_hangup() {
        let coordinator = Coordinator::bind(
            "127.0.0.1:0",
            vec!["a".to_string()],
            SinkSet::new(),
            CoordinatorOptions {
                passkey: "hunter2".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let addr = coordinator.local_addr().unwrap();
        let shared = coordinator.shared.clone();
        let server = tokio::spawn(coordinator.serve());

        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = BufReader::new(read);
        let register = Request::Register {
            passkey: "hunter2".to_string(),
            capacity: 3,
        };
        assert_eq!(call(&mut reader, &mut write, 1, register).await, Reply::Registered);
        assert_eq!(
            *shared.workers.lock(),
            vec![WorkerInfo {
                peer: write.local_addr().unwrap(),
                capacity: 3
            }]
        );

        assert_eq!(
            call(&mut reader, &mut write, 2, Request::RequestUnit).await,
            Reply::Assign {
                unit: 0,
                uid: "a".to_string()
            }
        );
        assert_eq!(
            call(&mut reader, &mut write, 3, Request::Complete { unit: 0 }).await,
            Reply::Ack
        );
        assert_eq!(
            call(&mut reader, &mut write, 4, Request::AwaitRunEnd).await,
            Reply::RunFinished
        );

        // Every unit is done, but the worker is still connected.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_finished());

        write.shutdown().await.unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.total, 0);
    }
}
