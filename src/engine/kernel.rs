//! Timed exchange kernel for one pairing

use crate::error::{AppError, Result};
use crate::histogram::{derive_pairwise, valid_sample, PairingSamples};
use crate::models::TestConfig;
use crate::timer::Clock;
use crate::transport::{decode_samples, encode_samples, ExchangeBuffer, Transport};

/// Measure one pairing with `peer`
///
/// Runs the warm-up exchanges, synchronizes the pair, times `num_messages`
/// exchanges, synchronizes again and swaps the one-sided arrays with the peer
/// to derive pairwise latencies. Both ranks of the pairing must call this with
/// the same `TestConfig`.
pub async fn measure_pairing(
    transport: &mut dyn Transport,
    buffer: &mut ExchangeBuffer,
    peer: usize,
    clock: &dyn Clock,
    test: &TestConfig,
) -> Result<PairingSamples> {
    for _ in 0..test.num_warmup {
        let _ = clock.read();
        let _ = clock.read();
        transport.exchange(buffer, peer).await?;
        let _ = clock.read();
    }

    transport.rendezvous(peer).await?;

    let mut timer_overhead = Vec::with_capacity(test.num_messages);
    let mut one_sided = Vec::with_capacity(test.num_messages);
    for _ in 0..test.num_messages {
        let t1 = clock.read();
        let t2 = clock.read();
        transport.exchange(buffer, peer).await?;
        let t3 = clock.read();

        timer_overhead.push(valid_sample(clock.seconds(t1, t2)));
        one_sided.push(valid_sample(clock.seconds(t2, t3)));
    }

    transport.rendezvous(peer).await?;

    let wire = transport.exchange_samples(&encode_samples(&one_sided), peer).await?;
    if wire.len() != one_sided.len() {
        return Err(AppError::measurement(format!(
            "rank {} sent {} samples, rank {} measured {}",
            peer,
            wire.len(),
            transport.rank(),
            one_sided.len()
        )));
    }
    let peer_one_sided = decode_samples(&wire);
    let pairwise = derive_pairwise(&one_sided, &peer_one_sided);

    Ok(PairingSamples {
        timer_overhead,
        one_sided,
        pairwise,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryPolicy;
    use crate::timer::StepClock;
    use crate::transport::{LocalFabric, MessagePassingTransport};
    use std::time::Duration;

    fn test_config(num_messages: usize) -> TestConfig {
        TestConfig {
            num_cycles: 1,
            num_stages: 2,
            num_messages,
            num_warmup: 2,
            message_size: 8,
        }
    }

    #[tokio::test]
    async fn test_measure_pairing_with_step_clock() {
        let fabric = LocalFabric::new(2);
        let policy = RetryPolicy::bounded(None, Duration::from_secs(5));
        let mut t0 = MessagePassingTransport::new(fabric.attach(0).unwrap(), policy);
        let mut t1 = MessagePassingTransport::new(fabric.attach(1).unwrap(), policy);
        let mut b0 = t0.allocate(8).await.unwrap();
        let mut b1 = t1.allocate(8).await.unwrap();

        let c0 = StepClock::new(100);
        let c1 = StepClock::new(300);
        let test = test_config(5);

        let (s0, s1) = tokio::join!(
            measure_pairing(&mut t0, &mut b0, 1, &c0, &test),
            measure_pairing(&mut t1, &mut b1, 0, &c1, &test),
        );
        let s0 = s0.unwrap();
        let s1 = s1.unwrap();

        // Each clock advances one step per read, so every delta is one step.
        assert_eq!(s0.timer_overhead, vec![Some(100.0 / 1e9); 5]);
        assert_eq!(s0.one_sided, vec![Some(100.0 / 1e9); 5]);
        assert_eq!(s1.one_sided, vec![Some(300.0 / 1e9); 5]);
        assert_eq!(s0.pairwise, vec![Some((100.0 / 1e9 + 300.0 / 1e9) / 2.0); 5]);
        assert_eq!(s0.pairwise, s1.pairwise);
    }
}
