//! Transport backends for the timed exchange
//!
//! Every backend implements [`Transport`]. The measurement engine only talks
//! to this trait, so the timing kernel is written once for all of them:
//!
//! - [`MessagePassingTransport`]: combined send and receive over the fabric mailboxes
//! - [`SymmetricMemoryTransport`]: one-sided get from the peer's symmetric region
//! - [`RdmaTransport`]: remote put with local and remote completion-queue polling
//! - [`TcpTransport`]: two-sided exchange over TCP sockets, one process per rank
//!
//! The first three run over the in-process [`LocalFabric`].

pub mod fabric;
pub mod rdma;
pub mod symmetric;
pub mod tcp;
pub mod two_sided;

pub use fabric::{CqEntry, CqPoll, FabricPort, LocalFabric, Message};
pub use rdma::RdmaTransport;
pub use symmetric::SymmetricMemoryTransport;
pub use tcp::TcpTransport;
pub use two_sided::MessagePassingTransport;

use crate::error::{AppError, Result, RetryPolicy};
use crate::histogram::valid_sample;
use crate::logging::Logger;
use crate::types::TransportKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Value an invalid sample travels as
pub const INVALID_SAMPLE_WIRE: f64 = -1.0;

/// Registration key of a buffer region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionHandle {
    /// Rank owning the region
    pub rank: usize,
    pub key: u64,
}

/// Equally sized send and receive regions owned by one rank
#[derive(Debug, Clone)]
pub struct ExchangeBuffer {
    send: Vec<u8>,
    recv: Vec<u8>,
    handle: Option<RegionHandle>,
}

impl ExchangeBuffer {
    /// Fresh buffer; the send region carries a recognizable byte pattern
    pub fn new(size: usize) -> Self {
        Self {
            send: (0..size).map(|i| (i % 251) as u8).collect(),
            recv: vec![0; size],
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: RegionHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn len(&self) -> usize {
        self.send.len()
    }

    pub fn is_empty(&self) -> bool {
        self.send.is_empty()
    }

    pub fn send(&self) -> &[u8] {
        &self.send
    }

    pub fn recv(&self) -> &[u8] {
        &self.recv
    }

    pub fn recv_mut(&mut self) -> &mut [u8] {
        &mut self.recv
    }

    pub fn handle(&self) -> Option<RegionHandle> {
        self.handle
    }

    /// Copy a received payload into the receive region
    pub(crate) fn fill_recv(&mut self, rank: usize, operation: &str, payload: &[u8]) -> Result<()> {
        if payload.len() != self.recv.len() {
            return Err(AppError::transport(
                rank,
                operation,
                format!("received {} bytes, expected {}", payload.len(), self.recv.len()),
            ));
        }
        self.recv.copy_from_slice(payload);
        Ok(())
    }
}

/// Capability interface of one rank's communication backend
///
/// All blocking operations are bounded by the backend's [`RetryPolicy`] and
/// fail with [`AppError::TransportTimeout`] rather than hang.
#[async_trait]
pub trait Transport: Send {
    fn rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    fn kind(&self) -> TransportKind;

    /// Whether every stage must start with a global barrier
    fn requires_stage_barrier(&self) -> bool {
        false
    }

    /// Allocate (and register, where the backend needs it) the exchange buffer
    async fn allocate(&mut self, size: usize) -> Result<ExchangeBuffer>;

    /// Release a buffer obtained from [`Transport::allocate`]
    async fn release(&mut self, buffer: ExchangeBuffer) -> Result<()>;

    /// Block until every rank has entered the barrier
    async fn barrier(&mut self) -> Result<()>;

    /// Post a flag to `peer` and wait for the peer's matching flag
    async fn rendezvous(&mut self, peer: usize) -> Result<()>;

    /// One timed bidirectional exchange with `peer`
    async fn exchange(&mut self, buffer: &mut ExchangeBuffer, peer: usize) -> Result<()>;

    /// Reliable swap of a sample array with `peer`
    async fn exchange_samples(&mut self, samples: &[f64], peer: usize) -> Result<Vec<f64>>;

    /// Per-pairing endpoint setup
    async fn begin_pairing(&mut self, _buffer: &mut ExchangeBuffer, _peer: usize) -> Result<()> {
        Ok(())
    }

    /// Per-pairing endpoint teardown
    async fn end_pairing(&mut self, _buffer: &mut ExchangeBuffer, _peer: usize) -> Result<()> {
        Ok(())
    }
}

/// Build an in-process backend of `kind` on a fabric port
pub fn local_transport(
    kind: TransportKind,
    port: FabricPort,
    policy: RetryPolicy,
    logger: &Logger,
) -> Result<Box<dyn Transport>> {
    match kind {
        TransportKind::TwoSided => Ok(Box::new(MessagePassingTransport::new(port, policy))),
        TransportKind::Symmetric => Ok(Box::new(SymmetricMemoryTransport::new(port, policy))),
        TransportKind::Rdma => Ok(Box::new(RdmaTransport::new(port, policy, logger))),
        TransportKind::Tcp => Err(AppError::config(
            "The tcp transport runs one rank per process and cannot use the local fabric",
        )),
    }
}

/// Samples as sent to the peer, invalid entries as [`INVALID_SAMPLE_WIRE`]
pub fn encode_samples(samples: &[Option<f64>]) -> Vec<f64> {
    samples
        .iter()
        .map(|s| s.unwrap_or(INVALID_SAMPLE_WIRE))
        .collect()
}

/// Samples as received; any negative or non-finite value is invalid
pub fn decode_samples(wire: &[f64]) -> Vec<Option<f64>> {
    wire.iter().map(|&v| valid_sample(v)).collect()
}

/// Little-endian byte form of a sample array
pub fn samples_to_bytes(samples: &[f64]) -> Vec<u8> {
    samples.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn samples_from_bytes(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(AppError::parse(format!(
            "sample payload of {} bytes is not a whole number of f64 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect())
}
