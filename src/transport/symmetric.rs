//! One-sided get from the peer's symmetric region

use super::{ExchangeBuffer, FabricPort, Message, Transport};
use crate::error::{AppError, Result, RetryPolicy};
use crate::types::TransportKind;
use async_trait::async_trait;

/// Symmetric-memory backend
///
/// Each rank publishes its send region as a symmetric region; an exchange is a
/// get of the peer's region into the local receive region. Pairs synchronize
/// through flag rendezvous and every stage starts with a global barrier.
#[derive(Debug)]
pub struct SymmetricMemoryTransport {
    port: FabricPort,
    policy: RetryPolicy,
}

impl SymmetricMemoryTransport {
    pub fn new(port: FabricPort, policy: RetryPolicy) -> Self {
        Self { port, policy }
    }
}

#[async_trait]
impl Transport for SymmetricMemoryTransport {
    fn rank(&self) -> usize {
        self.port.rank()
    }

    fn num_ranks(&self) -> usize {
        self.port.num_ranks()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Symmetric
    }

    fn requires_stage_barrier(&self) -> bool {
        true
    }

    async fn allocate(&mut self, size: usize) -> Result<ExchangeBuffer> {
        let buffer = ExchangeBuffer::new(size);
        self.port.publish_symmetric(buffer.send());
        Ok(buffer)
    }

    async fn release(&mut self, _buffer: ExchangeBuffer) -> Result<()> {
        self.port.clear_symmetric();
        Ok(())
    }

    async fn barrier(&mut self) -> Result<()> {
        self.port.barrier(&self.policy).await
    }

    async fn rendezvous(&mut self, peer: usize) -> Result<()> {
        self.port.post_flag(peer)?;
        self.port.wait_flag(peer, &self.policy).await
    }

    async fn exchange(&mut self, buffer: &mut ExchangeBuffer, peer: usize) -> Result<()> {
        self.port.get_symmetric(peer, buffer.recv_mut())
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
