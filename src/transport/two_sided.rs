//! Two-sided message passing over the fabric mailboxes

use super::{ExchangeBuffer, FabricPort, Message, Transport};
use crate::error::{AppError, Result, RetryPolicy};
use crate::types::TransportKind;
use async_trait::async_trait;

/// Combined send and receive of the whole buffer per exchange
#[derive(Debug)]
pub struct MessagePassingTransport {
    port: FabricPort,
    policy: RetryPolicy,
}

impl MessagePassingTransport {
    pub fn new(port: FabricPort, policy: RetryPolicy) -> Self {
        Self { port, policy }
    }

    fn unexpected(&self, operation: String, expected: &str, message: &Message) -> AppError {
        AppError::transport(
            self.port.rank(),
            operation,
            format!("expected a {} message, got {}", expected, message.kind()),
        )
    }
}

#[async_trait]
impl Transport for MessagePassingTransport {
    fn rank(&self) -> usize {
        self.port.rank()
    }

    fn num_ranks(&self) -> usize {
        self.port.num_ranks()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::TwoSided
    }

    async fn allocate(&mut self, size: usize) -> Result<ExchangeBuffer> {
        Ok(ExchangeBuffer::new(size))
    }

    async fn release(&mut self, _buffer: ExchangeBuffer) -> Result<()> {
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
        self.port.send(peer, Message::Data(buffer.send().to_vec()))?;
        let operation = format!("exchange with rank {}", peer);
        match self.port.recv(peer, &self.policy).await? {
            Message::Data(payload) => buffer.fill_recv(self.port.rank(), &operation, &payload),
            other => Err(self.unexpected(operation, "data", &other)),
        }
    }

    async fn exchange_samples(&mut self, samples: &[f64], peer: usize) -> Result<Vec<f64>> {
        self.port.send(peer, Message::Samples(samples.to_vec()))?;
        match self.port.recv(peer, &self.policy).await? {
            Message::Samples(values) => Ok(values),
            other => Err(self.unexpected(format!("exchange samples with rank {}", peer), "samples", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalFabric;
    use std::time::Duration;

    fn pair() -> (MessagePassingTransport, MessagePassingTransport) {
        let fabric = LocalFabric::new(2);
        let policy = RetryPolicy::bounded(None, Duration::from_secs(5));
        (
            MessagePassingTransport::new(fabric.attach(0).unwrap(), policy),
            MessagePassingTransport::new(fabric.attach(1).unwrap(), policy),
        )
    }

    #[tokio::test]
    async fn test_exchange_swaps_buffers() {
        let (mut t0, mut t1) = pair();
        let mut b0 = t0.allocate(16).await.unwrap();
        let mut b1 = t1.allocate(16).await.unwrap();
        let expected = b0.send().to_vec();

        let (r0, r1) = tokio::join!(t0.exchange(&mut b0, 1), t1.exchange(&mut b1, 0));
        r0.unwrap();
        r1.unwrap();
        assert_eq!(b0.recv(), &expected[..]);
        assert_eq!(b1.recv(), &expected[..]);
    }

    #[tokio::test]
    async fn test_rendezvous_and_samples() {
        let (mut t0, mut t1) = pair();
        let (r0, r1) = tokio::join!(t0.rendezvous(1), t1.rendezvous(0));
        r0.unwrap();
        r1.unwrap();

        let (s0, s1) = tokio::join!(t0.exchange_samples(&[1.0, 2.0], 1), t1.exchange_samples(&[3.0, -1.0], 0));
        assert_eq!(s0.unwrap(), vec![3.0, -1.0]);
        assert_eq!(s1.unwrap(), vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_protocol_error() {
        let (mut t0, mut t1) = pair();
        let mut b1 = t1.allocate(4).await.unwrap();

        // Samples arrive where data is expected.
        let (_, r1) = tokio::join!(t0.exchange_samples(&[1.0], 1), t1.exchange(&mut b1, 0));
        assert!(matches!(r1.unwrap_err(), AppError::Transport { rank: 1, .. }));
    }
}
