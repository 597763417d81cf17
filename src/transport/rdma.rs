//! Remote put with explicit completion-queue polling
//!
//! An exchange posts a put of the local send region into the peer's registered
//! region, then waits for two completions:
//!
//! 1. the local transmit-queue event carrying this post's id
//! 2. a receive-queue event raised by the peer's put into our region
//!
//! Transaction errors on either queue are logged and the queue is polled
//! again. An event that does not match what the exchange waits for is a
//! protocol error. All polling is bounded by the retry policy.

use super::{CqEntry, CqPoll, ExchangeBuffer, FabricPort, Message, RegionHandle, Transport};
use crate::error::{AppError, Result, RetryPolicy};
use crate::logging::{Logger, TransportLogger};
use crate::types::TransportKind;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Tx,
    Rx,
}

impl Queue {
    fn name(self) -> &'static str {
        match self {
            Queue::Tx => "tx",
            Queue::Rx => "rx",
        }
    }
}

/// RDMA backend over the fabric's region registry and completion queues
#[derive(Debug)]
pub struct RdmaTransport {
    port: FabricPort,
    policy: RetryPolicy,
    logger: TransportLogger,
    /// Region of the current partner, bound in `begin_pairing`
    peer_region: Option<RegionHandle>,
    transaction_errors: u64,
}

impl RdmaTransport {
    pub fn new(port: FabricPort, policy: RetryPolicy, logger: &Logger) -> Self {
        Self {
            port,
            policy,
            logger: TransportLogger::new(logger.clone()),
            peer_region: None,
            transaction_errors: 0,
        }
    }

    /// Transaction errors seen and retried so far
    pub fn transaction_errors(&self) -> u64 {
        self.transaction_errors
    }

    fn poll(&self, queue: Queue) -> CqPoll {
        match queue {
            Queue::Tx => self.port.poll_tx(),
            Queue::Rx => self.port.poll_rx(),
        }
    }

    /// Spin on `queue` until an event arrives
    async fn wait_event(&mut self, queue: Queue, peer: usize, operation: String) -> Result<CqEntry> {
        let mut budget = self.policy.start();
        loop {
            match self.poll(queue) {
                CqPoll::Event(entry) => return Ok(entry),
                CqPoll::TransactionError(detail) => {
                    self.transaction_errors += 1;
                    self.logger.log_transaction_error(peer, queue.name(), &detail).await;
                }
                CqPoll::NotDone => {}
            }
            budget
                .wait()
                .await
                .map_err(|exhausted| AppError::transport_timeout(self.port.rank(), &operation, exhausted))?;
        }
    }
}

#[async_trait]
impl Transport for RdmaTransport {
    fn rank(&self) -> usize {
        self.port.rank()
    }

    fn num_ranks(&self) -> usize {
        self.port.num_ranks()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Rdma
    }

    async fn allocate(&mut self, size: usize) -> Result<ExchangeBuffer> {
        let handle = self.port.register(size)?;
        Ok(ExchangeBuffer::new(size).with_handle(handle))
    }

    async fn release(&mut self, buffer: ExchangeBuffer) -> Result<()> {
        match buffer.handle() {
            Some(handle) => self.port.deregister(handle),
            None => Ok(()),
        }
    }

    async fn barrier(&mut self) -> Result<()> {
        self.port.barrier(&self.policy).await
    }

    async fn rendezvous(&mut self, peer: usize) -> Result<()> {
        self.port.post_flag(peer)?;
        self.port.wait_flag(peer, &self.policy).await
    }

    /// Swap region handles with the peer
    async fn begin_pairing(&mut self, buffer: &mut ExchangeBuffer, peer: usize) -> Result<()> {
        let operation = format!("bind to rank {}", peer);
        let local = buffer.handle().ok_or_else(|| {
            AppError::transport(self.port.rank(), operation.clone(), "exchange buffer is not registered")
        })?;

        self.port.send(peer, Message::Handle(local))?;
        match self.port.recv(peer, &self.policy).await? {
            Message::Handle(remote) if remote.rank == peer => {
                self.peer_region = Some(remote);
                Ok(())
            }
            Message::Handle(remote) => Err(AppError::transport(
                self.port.rank(),
                operation,
                format!("rank {} sent a region owned by rank {}", peer, remote.rank),
            )),
            other => Err(AppError::transport(
                self.port.rank(),
                operation,
                format!("expected a handle message, got {}", other.kind()),
            )),
        }
    }

    async fn end_pairing(&mut self, _buffer: &mut ExchangeBuffer, _peer: usize) -> Result<()> {
        self.peer_region = None;
        Ok(())
    }

    async fn exchange(&mut self, buffer: &mut ExchangeBuffer, peer: usize) -> Result<()> {
        let rank = self.port.rank();
        let target = match self.peer_region {
            Some(handle) if handle.rank == peer => handle,
            _ => {
                return Err(AppError::transport(
                    rank,
                    format!("exchange with rank {}", peer),
                    "no region bound for this peer",
                ))
            }
        };
        let local = buffer.handle().ok_or_else(|| {
            AppError::transport(rank, format!("exchange with rank {}", peer), "exchange buffer is not registered")
        })?;

        let post_id = self.port.put(target, buffer.send())?;

        match self
            .wait_event(Queue::Tx, peer, format!("local completion of put to rank {}", peer))
            .await?
        {
            CqEntry::Post { post_id: done } if done == post_id => {}
            other => {
                return Err(AppError::transport(
                    rank,
                    format!("exchange with rank {}", peer),
                    format!("unexpected tx completion {:?} while waiting for post {}", other, post_id),
                ))
            }
        }

        match self
            .wait_event(Queue::Rx, peer, format!("remote completion from rank {}", peer))
            .await?
        {
            CqEntry::Remote { from } if from == peer => {}
            other => {
                return Err(AppError::transport(
                    rank,
                    format!("exchange with rank {}", peer),
                    format!("unexpected rx completion {:?}", other),
                ))
            }
        }

        self.port.read_region(local, buffer.recv_mut())
    }

    async fn exchange_samples(&mut self, samples: &[f64], peer: usize) -> Result<Vec<f64>> {
        self.port.send(peer, Message::Samples(samples.to_vec()))?;
        match self.port.recv(peer, &self.policy).await? {
            Message::Samples(values) => Ok(values),
            other => Err(AppError::transport(
                self.port.rank(),
                format!("exchange samples with rank {}", peer),
                format!("expected a samples message, got {}", other.kind()),
            )),
        }
    }
}
