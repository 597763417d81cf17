//! In-process communication fabric shared by the local-cluster ranks
//!
//! The fabric provides the primitives the in-process backends are built on:
//!
//! - a FIFO mailbox per ordered rank pair for messages and sample arrays
//! - per-pair flag counters for rendezvous
//! - one symmetric region per rank for one-sided gets
//! - a registry of registered regions for remote puts
//! - a transmit and a receive completion queue per rank
//! - a global barrier
//!
//! A rank obtains its [`FabricPort`] with [`LocalFabric::attach`] exactly once.

use super::RegionHandle;
use crate::error::{AppError, Result, RetryPolicy};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Barrier;

/// Payload carried by a fabric mailbox
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Data(Vec<u8>),
    Samples(Vec<f64>),
    Handle(RegionHandle),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Data(_) => "data",
            Message::Samples(_) => "samples",
            Message::Handle(_) => "handle",
        }
    }
}

/// Completion-queue event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqEntry {
    /// A locally posted put finished
    Post { post_id: u64 },
    /// A peer's put into this rank's region finished
    Remote { from: usize },
}

/// Outcome of one completion-queue poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CqPoll {
    Event(CqEntry),
    NotDone,
    TransactionError(String),
}

#[derive(Debug, Default)]
struct CompletionQueues {
    tx: Mutex<VecDeque<CqEntry>>,
    rx: Mutex<VecDeque<CqEntry>>,
    injected_errors: AtomicU64,
    swallow_remote: AtomicBool,
}

/// Shared in-memory substrate for the in-process backends
#[derive(Debug)]
pub struct LocalFabric {
    num_ranks: usize,
    /// `senders[src][dst]`
    senders: Vec<Vec<UnboundedSender<Message>>>,
    /// `inboxes[dst]`, indexed by source rank, taken on attach
    inboxes: Mutex<Vec<Option<Vec<UnboundedReceiver<Message>>>>>,
    /// `flags[dst][src]` counts flags posted by `src` to `dst`
    flags: Vec<Vec<AtomicU64>>,
    symmetric: Vec<RwLock<Vec<u8>>>,
    registry: Mutex<HashMap<u64, Arc<Mutex<Vec<u8>>>>>,
    next_key: AtomicU64,
    registration_limit: Option<usize>,
    queues: Vec<CompletionQueues>,
    barrier: Barrier,
}

impl LocalFabric {
    pub fn new(num_ranks: usize) -> Arc<Self> {
        Self::build(num_ranks, None)
    }

    /// Fabric that refuses registrations beyond `limit` live regions
    pub fn with_registration_limit(num_ranks: usize, limit: usize) -> Arc<Self> {
        Self::build(num_ranks, Some(limit))
    }

    fn build(num_ranks: usize, registration_limit: Option<usize>) -> Arc<Self> {
        let mut senders: Vec<Vec<UnboundedSender<Message>>> = (0..num_ranks).map(|_| Vec::new()).collect();
        let mut inboxes: Vec<Vec<UnboundedReceiver<Message>>> = (0..num_ranks).map(|_| Vec::new()).collect();

        // Receivers for dst are pushed in src order, so inboxes[dst][src] lines up.
        for src_senders in senders.iter_mut() {
            for inbox in inboxes.iter_mut() {
                let (tx, rx) = unbounded_channel();
                src_senders.push(tx);
                inbox.push(rx);
            }
        }

        Arc::new(Self {
            num_ranks,
            senders,
            inboxes: Mutex::new(inboxes.into_iter().map(Some).collect()),
            flags: (0..num_ranks)
                .map(|_| (0..num_ranks).map(|_| AtomicU64::new(0)).collect())
                .collect(),
            symmetric: (0..num_ranks).map(|_| RwLock::new(Vec::new())).collect(),
            registry: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            registration_limit,
            queues: (0..num_ranks).map(|_| CompletionQueues::default()).collect(),
            barrier: Barrier::new(num_ranks.max(1)),
        })
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// Claim the port of `rank`
    pub fn attach(self: &Arc<Self>, rank: usize) -> Result<FabricPort> {
        if rank >= self.num_ranks {
            return Err(AppError::internal(format!(
                "rank {} is outside a fabric of {} ranks",
                rank, self.num_ranks
            )));
        }
        let inbox = self.inboxes.lock()[rank]
            .take()
            .ok_or_else(|| AppError::internal(format!("rank {} is already attached to the fabric", rank)))?;

        Ok(FabricPort {
            rank,
            fabric: Arc::clone(self),
            inbox,
            seen_flags: vec![0; self.num_ranks],
            next_post_id: 0,
        })
    }

    /// Make the next `count` transmit-queue polls of `rank` report a transaction error
    pub fn inject_transaction_errors(&self, rank: usize, count: u64) {
        if let Some(queues) = self.queues.get(rank) {
            queues.injected_errors.fetch_add(count, Ordering::SeqCst);
        }
    }

    /// Drop every remote completion destined for `rank`
    pub fn swallow_remote_events(&self, rank: usize) {
        if let Some(queues) = self.queues.get(rank) {
            queues.swallow_remote.store(true, Ordering::SeqCst);
        }
    }

    /// Number of currently registered regions
    pub fn registered_regions(&self) -> usize {
        self.registry.lock().len()
    }
}

/// One rank's attachment to the [`LocalFabric`]
#[derive(Debug)]
pub struct FabricPort {
    rank: usize,
    fabric: Arc<LocalFabric>,
    inbox: Vec<UnboundedReceiver<Message>>,
    /// Flags already consumed from each source
    seen_flags: Vec<u64>,
    next_post_id: u64,
}

impl FabricPort {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.fabric.num_ranks
    }

    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }

    fn check_peer(&self, peer: usize, operation: &str) -> Result<()> {
        if peer >= self.fabric.num_ranks || peer == self.rank {
            return Err(AppError::transport(
                self.rank,
                operation,
                format!("rank {} is not a valid peer", peer),
            ));
        }
        Ok(())
    }

    /// Queue a message for `peer`
    pub fn send(&self, peer: usize, message: Message) -> Result<()> {
        self.check_peer(peer, "send")?;
        self.fabric.senders[self.rank][peer]
            .send(message)
            .map_err(|_| AppError::transport(self.rank, format!("send to rank {}", peer), "peer mailbox is closed"))
    }

    /// Poll the mailbox from `peer` until a message arrives
    pub async fn recv(&mut self, peer: usize, policy: &RetryPolicy) -> Result<Message> {
        let operation = format!("receive from rank {}", peer);
        self.check_peer(peer, &operation)?;

        let mut budget = policy.start();
        loop {
            match self.inbox[peer].try_recv() {
                Ok(message) => return Ok(message),
                Err(TryRecvError::Disconnected) => {
                    return Err(AppError::transport(self.rank, operation, "peer mailbox is closed"))
                }
                Err(TryRecvError::Empty) => budget
                    .wait()
                    .await
                    .map_err(|exhausted| AppError::transport_timeout(self.rank, &operation, exhausted))?,
            }
        }
    }

    /// Post a rendezvous flag to `peer`
    pub fn post_flag(&self, peer: usize) -> Result<()> {
        self.check_peer(peer, "post flag")?;
        self.fabric.flags[peer][self.rank].fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Wait for, and consume, the next flag posted by `peer`
    pub async fn wait_flag(&mut self, peer: usize, policy: &RetryPolicy) -> Result<()> {
        let operation = format!("rendezvous with rank {}", peer);
        self.check_peer(peer, &operation)?;

        let mut budget = policy.start();
        loop {
            let posted = self.fabric.flags[self.rank][peer].load(Ordering::Acquire);
            if posted > self.seen_flags[peer] {
                self.seen_flags[peer] += 1;
                return Ok(());
            }
            budget
                .wait()
                .await
                .map_err(|exhausted| AppError::transport_timeout(self.rank, &operation, exhausted))?;
        }
    }

    /// Wait for every rank, bounded by the policy deadline
    pub async fn barrier(&self, policy: &RetryPolicy) -> Result<()> {
        let started = std::time::Instant::now();
        match policy.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.fabric.barrier.wait())
                .await
                .map(|_| ())
                .map_err(|_| {
                    AppError::transport_timeout(
                        self.rank,
                        "barrier",
                        crate::error::BudgetExhausted {
                            polls: 0,
                            waited: started.elapsed(),
                        },
                    )
                }),
            None => {
                self.fabric.barrier.wait().await;
                Ok(())
            }
        }
    }

    /// Publish `data` as this rank's symmetric region
    pub fn publish_symmetric(&self, data: &[u8]) {
        let mut region = self.fabric.symmetric[self.rank].write();
        region.clear();
        region.extend_from_slice(data);
    }

    pub fn clear_symmetric(&self) {
        self.fabric.symmetric[self.rank].write().clear();
    }

    /// One-sided get of `peer`'s symmetric region into `dest`
    pub fn get_symmetric(&self, peer: usize, dest: &mut [u8]) -> Result<()> {
        let operation = format!("get from rank {}", peer);
        self.check_peer(peer, &operation)?;
        let region = self.fabric.symmetric[peer].read();
        if region.len() != dest.len() {
            return Err(AppError::transport(
                self.rank,
                operation,
                format!("peer region holds {} bytes, expected {}", region.len(), dest.len()),
            ));
        }
        dest.copy_from_slice(&region);
        Ok(())
    }

    /// Register a zeroed region of `size` bytes
    pub fn register(&self, size: usize) -> Result<RegionHandle> {
        let mut registry = self.fabric.registry.lock();
        if let Some(limit) = self.fabric.registration_limit {
            if registry.len() >= limit {
                return Err(AppError::resource(
                    self.rank,
                    format!("memory registration refused, {} of {} regions in use", registry.len(), limit),
                ));
            }
        }
        let key = self.fabric.next_key.fetch_add(1, Ordering::Relaxed);
        registry.insert(key, Arc::new(Mutex::new(vec![0; size])));
        Ok(RegionHandle { rank: self.rank, key })
    }

    pub fn deregister(&self, handle: RegionHandle) -> Result<()> {
        self.fabric
            .registry
            .lock()
            .remove(&handle.key)
            .map(|_| ())
            .ok_or_else(|| AppError::resource(self.rank, format!("region {} is not registered", handle.key)))
    }

    fn region(&self, handle: RegionHandle, operation: &str) -> Result<Arc<Mutex<Vec<u8>>>> {
        self.fabric
            .registry
            .lock()
            .get(&handle.key)
            .cloned()
            .ok_or_else(|| {
                AppError::transport(
                    self.rank,
                    operation,
                    format!("region {} of rank {} is not registered", handle.key, handle.rank),
                )
            })
    }

    /// Write `data` into a remote region and queue both completions; returns the post id
    pub fn put(&mut self, target: RegionHandle, data: &[u8]) -> Result<u64> {
        let operation = format!("put to rank {}", target.rank);
        self.check_peer(target.rank, &operation)?;
        {
            let region = self.region(target, &operation)?;
            let mut region = region.lock();
            if region.len() != data.len() {
                return Err(AppError::transport(
                    self.rank,
                    operation,
                    format!("target region holds {} bytes, put carries {}", region.len(), data.len()),
                ));
            }
            region.copy_from_slice(data);
        }

        let post_id = self.next_post_id;
        self.next_post_id += 1;

        self.fabric.queues[self.rank]
            .tx
            .lock()
            .push_back(CqEntry::Post { post_id });

        let remote = &self.fabric.queues[target.rank];
        if !remote.swallow_remote.load(Ordering::SeqCst) {
            remote.rx.lock().push_back(CqEntry::Remote { from: self.rank });
        }
        Ok(post_id)
    }

    /// Copy a registered region of this rank into `dest`
    pub fn read_region(&self, handle: RegionHandle, dest: &mut [u8]) -> Result<()> {
        let region = self.region(handle, "read region")?;
        let region = region.lock();
        if region.len() != dest.len() {
            return Err(AppError::transport(
                self.rank,
                "read region",
                format!("region holds {} bytes, expected {}", region.len(), dest.len()),
            ));
        }
        dest.copy_from_slice(&region);
        Ok(())
    }

    /// Poll this rank's transmit completion queue once
    pub fn poll_tx(&self) -> CqPoll {
        let queues = &self.fabric.queues[self.rank];
        let injected = queues
            .injected_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return CqPoll::TransactionError("injected transaction error".to_string());
        }
        match queues.tx.lock().pop_front() {
            Some(entry) => CqPoll::Event(entry),
            None => CqPoll::NotDone,
        }
    }

    /// Poll this rank's receive completion queue once
    pub fn poll_rx(&self) -> CqPoll {
        match self.fabric.queues[self.rank].rx.lock().pop_front() {
            Some(entry) => CqPoll::Event(entry),
            None => CqPoll::NotDone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy::bounded(Some(50), Duration::from_millis(500))
    }

    #[test]
    fn test_attach_once() {
        let fabric = LocalFabric::new(2);
        assert!(fabric.attach(0).is_ok());
        assert!(fabric.attach(0).is_err());
        assert!(fabric.attach(2).is_err());
    }

    #[tokio::test]
    async fn test_mailbox_is_fifo_per_pair() {
        let fabric = LocalFabric::new(2);
        let p0 = fabric.attach(0).unwrap();
        let mut p1 = fabric.attach(1).unwrap();

        p0.send(1, Message::Data(vec![1])).unwrap();
        p0.send(1, Message::Samples(vec![2.0])).unwrap();

        assert_eq!(p1.recv(0, &quick_policy()).await.unwrap(), Message::Data(vec![1]));
        assert_eq!(p1.recv(0, &quick_policy()).await.unwrap(), Message::Samples(vec![2.0]));
        assert!(p0.send(0, Message::Data(vec![])).is_err());
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let fabric = LocalFabric::new(2);
        let _p0 = fabric.attach(0).unwrap();
        let mut p1 = fabric.attach(1).unwrap();

        let err = p1.recv(0, &quick_policy()).await.unwrap_err();
        assert!(matches!(err, AppError::TransportTimeout { rank: 1, .. }));
    }

    #[tokio::test]
    async fn test_flags_are_counted() {
        let fabric = LocalFabric::new(2);
        let p0 = fabric.attach(0).unwrap();
        let mut p1 = fabric.attach(1).unwrap();

        p0.post_flag(1).unwrap();
        p0.post_flag(1).unwrap();
        p1.wait_flag(0, &quick_policy()).await.unwrap();
        p1.wait_flag(0, &quick_policy()).await.unwrap();

        // Both posted flags are consumed; a third wait has nothing to see.
        let err = p1.wait_flag(0, &quick_policy()).await.unwrap_err();
        match err {
            AppError::TransportTimeout { operation, .. } => assert_eq!(operation, "rendezvous with rank 0"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_symmetric_get() {
        let fabric = LocalFabric::new(2);
        let p0 = fabric.attach(0).unwrap();
        let p1 = fabric.attach(1).unwrap();

        p0.publish_symmetric(&[7, 8, 9]);
        let mut dest = [0u8; 3];
        p1.get_symmetric(0, &mut dest).unwrap();
        assert_eq!(dest, [7, 8, 9]);

        let mut wrong = [0u8; 2];
        assert!(p1.get_symmetric(0, &mut wrong).is_err());
    }

    #[test]
    fn test_put_queues_both_completions() {
        let fabric = LocalFabric::new(2);
        let mut p0 = fabric.attach(0).unwrap();
        let p1 = fabric.attach(1).unwrap();

        let target = p1.register(4).unwrap();
        let post_id = p0.put(target, &[1, 2, 3, 4]).unwrap();

        assert_eq!(p0.poll_tx(), CqPoll::Event(CqEntry::Post { post_id }));
        assert_eq!(p0.poll_tx(), CqPoll::NotDone);
        assert_eq!(p1.poll_rx(), CqPoll::Event(CqEntry::Remote { from: 0 }));

        let mut dest = [0u8; 4];
        p1.read_region(target, &mut dest).unwrap();
        assert_eq!(dest, [1, 2, 3, 4]);

        p1.deregister(target).unwrap();
        assert!(p1.deregister(target).is_err());
        assert!(p0.put(target, &[0; 4]).is_err());
    }

    #[test]
    fn test_fault_injection() {
        let fabric = LocalFabric::new(2);
        let mut p0 = fabric.attach(0).unwrap();
        let p1 = fabric.attach(1).unwrap();
        let target = p1.register(1).unwrap();

        fabric.inject_transaction_errors(0, 2);
        fabric.swallow_remote_events(1);
        let post_id = p0.put(target, &[5]).unwrap();

        assert!(matches!(p0.poll_tx(), CqPoll::TransactionError(_)));
        assert!(matches!(p0.poll_tx(), CqPoll::TransactionError(_)));
        assert_eq!(p0.poll_tx(), CqPoll::Event(CqEntry::Post { post_id }));
        assert_eq!(p1.poll_rx(), CqPoll::NotDone);
    }

    #[test]
    fn test_registration_limit() {
        let fabric = LocalFabric::with_registration_limit(1, 1);
        let port = fabric.attach(0).unwrap();
        let handle = port.register(8).unwrap();
        let err = port.register(8).unwrap_err();
        assert!(matches!(err, AppError::Resource { rank: 0, .. }));
        assert_eq!(fabric.registered_regions(), 1);

        port.deregister(handle).unwrap();
        assert_eq!(fabric.registered_regions(), 0);
    }

    #[tokio::test]
    async fn test_barrier_times_out_without_peers() {
        let fabric = LocalFabric::new(2);
        let p0 = fabric.attach(0).unwrap();
        let err = p0
            .barrier(&RetryPolicy::bounded(None, Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TransportTimeout { .. }));
    }
}
