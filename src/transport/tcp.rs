//! Two-sided exchange over TCP sockets, one process per rank
//!
//! Ranks form a full mesh: each rank listens on its own address, connects to
//! every lower rank and accepts every higher rank. Both ends of a new
//! connection send a `Hello` frame carrying their rank and node id, so every
//! rank learns the node id of every peer while the mesh is built.
//!
//! Wire format of every frame:
//! - kind: u8
//! - len: u32 (little-endian)
//! - payload: `len` bytes
//!
//! `Hello` payload: rank u32 (little-endian), node id u64 (little-endian).

use super::{samples_from_bytes, samples_to_bytes, ExchangeBuffer, Transport};
use crate::error::{AppError, BackoffPolicy, BudgetExhausted, Result, RetryPolicy};
use crate::histogram::HistogramSet;
use crate::logging::{Logger, TransportLogger};
use crate::models::RankReport;
use crate::topology::RankTopology;
use crate::types::{NodeId, TransportKind};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

/// Largest payload accepted in a single frame
pub const MAX_FRAME_LEN: usize = 1 << 30;

const HEADER_LEN: usize = 5;
const HELLO_LEN: usize = 12;

/// Frame discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 1,
    Samples = 2,
    Flag = 3,
    Barrier = 4,
    Hello = 5,
    Report = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = io::Error;

    fn try_from(value: u8) -> io::Result<Self> {
        match value {
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Samples),
            3 => Ok(FrameKind::Flag),
            4 => Ok(FrameKind::Barrier),
            5 => Ok(FrameKind::Hello),
            6 => Ok(FrameKind::Report),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind {}", other),
            )),
        }
    }
}

/// One message on a rank-to-rank connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Frame without payload, e.g. a flag or barrier token
    pub fn empty(kind: FrameKind) -> Self {
        Self::new(kind, Bytes::new())
    }
}

/// Codec for `[kind][len][payload]` frames
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek at the header without consuming it
        let kind = FrameKind::try_from(src[0])?;
        let len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes (max: {})", len, self.max_frame_len),
            ));
        }

        let total_len = HEADER_LEN + len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { kind, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        let len = frame.payload.len();
        if len > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame payload too large: {} bytes (max: {})", len, self.max_frame_len),
            ));
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u8(frame.kind as u8);
        dst.put_u32_le(len as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Next frame from a framed reader; a closed connection is an error
async fn next_frame<R: AsyncRead + Unpin>(reader: &mut FramedRead<R, FrameCodec>) -> io::Result<Frame> {
    match reader.next().await {
        Some(frame) => frame,
        None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")),
    }
}

/// Framed connection to one peer, split so both directions run at once
#[derive(Debug)]
struct PeerLink {
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl PeerLink {
    fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedRead::new(read_half, FrameCodec::default()),
            writer: FramedWrite::new(write_half, FrameCodec::default()),
        }
    }

    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        self.writer.send(frame).await
    }

    async fn recv(&mut self) -> io::Result<Frame> {
        next_frame(&mut self.reader).await
    }

    /// Send a frame while reading the peer's frame
    async fn swap(&mut self, frame: Frame) -> io::Result<Frame> {
        let Self { reader, writer } = self;
        let (_, received) = tokio::try_join!(writer.send(frame), next_frame(reader))?;
        Ok(received)
    }
}

/// Run socket I/O under an optional deadline
async fn within<T, F>(rank: usize, deadline: Option<Duration>, operation: &str, future: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let started = Instant::now();
    let result = match deadline {
        Some(deadline) => tokio::time::timeout(deadline, future).await.map_err(|_| {
            AppError::transport_timeout(
                rank,
                operation,
                BudgetExhausted {
                    polls: 0,
                    waited: started.elapsed(),
                },
            )
        })?,
        None => future.await,
    };
    result.map_err(|e| AppError::transport(rank, operation, e.to_string()))
}

fn expect_kind(rank: usize, operation: &str, kind: FrameKind, frame: Frame) -> Result<Bytes> {
    if frame.kind == kind {
        Ok(frame.payload)
    } else {
        Err(AppError::transport(
            rank,
            operation,
            format!("expected a {:?} frame, got {:?}", kind, frame.kind),
        ))
    }
}

fn hello_payload(rank: usize, node_id: NodeId) -> Bytes {
    let mut payload = BytesMut::with_capacity(HELLO_LEN);
    payload.put_u32_le(rank as u32);
    payload.put_u64_le(node_id);
    payload.freeze()
}

fn parse_hello(mut payload: &[u8]) -> Option<(usize, NodeId)> {
    if payload.len() != HELLO_LEN {
        return None;
    }
    let rank = payload.get_u32_le() as usize;
    let node_id = payload.get_u64_le();
    Some((rank, node_id))
}

fn check_hello(rank: usize, operation: &str, frame: Frame) -> Result<(usize, NodeId)> {
    let payload = expect_kind(rank, operation, FrameKind::Hello, frame)?;
    parse_hello(&payload).ok_or_else(|| AppError::transport(rank, operation, "malformed hello frame"))
}

/// Per-rank results shipped to rank 0
#[derive(Debug, Serialize, Deserialize)]
struct RankResult {
    rank: usize,
    pairings_measured: usize,
    pairings_skipped: usize,
    dropped_samples: u64,
    histograms: HistogramSet,
}

impl From<RankResult> for RankReport {
    fn from(result: RankResult) -> Self {
        RankReport {
            rank: result.rank,
            pairings_measured: result.pairings_measured,
            pairings_skipped: result.pairings_skipped,
            dropped_samples: result.dropped_samples,
            histograms: result.histograms,
        }
    }
}

/// TCP mesh backend
#[derive(Debug)]
pub struct TcpTransport {
    rank: usize,
    node_ids: Vec<NodeId>,
    links: Vec<Option<PeerLink>>,
    policy: RetryPolicy,
    logger: TransportLogger,
}

impl TcpTransport {
    /// Bind this rank's address from `peers` and build the mesh
    pub async fn connect(
        rank: usize,
        peers: &[String],
        node_id: NodeId,
        policy: RetryPolicy,
        backoff: &BackoffPolicy,
        logger: &Logger,
    ) -> Result<Self> {
        let address = peers
            .get(rank)
            .ok_or_else(|| AppError::config(format!("Rank {} is out of range for {} peers", rank, peers.len())))?;
        let listener = TcpListener::bind(address.as_str())
            .await
            .map_err(|e| AppError::transport(rank, format!("bind {}", address), e.to_string()))?;
        Self::establish(rank, listener, peers, node_id, policy, backoff, logger).await
    }

    /// Build the mesh on an already bound listener
    pub async fn establish(
        rank: usize,
        listener: TcpListener,
        peers: &[String],
        node_id: NodeId,
        policy: RetryPolicy,
        backoff: &BackoffPolicy,
        logger: &Logger,
    ) -> Result<Self> {
        let num_ranks = peers.len();
        let deadline = policy.deadline;
        let mut transport = Self {
            rank,
            node_ids: vec![0; num_ranks],
            links: (0..num_ranks).map(|_| None).collect(),
            policy,
            logger: TransportLogger::new(logger.clone()),
        };
        transport.node_ids[rank] = node_id;
        let hello = hello_payload(rank, node_id);

        for (peer, target) in peers.iter().enumerate().take(rank) {
            let result = backoff.retry(|_| TcpStream::connect(target.as_str())).await;
            let stream = match result {
                Ok(stream) => {
                    transport.logger.log_connection(peer, target, true, None).await;
                    stream
                }
                Err(e) => {
                    transport
                        .logger
                        .log_connection(peer, target, false, Some(&e.to_string()))
                        .await;
                    return Err(AppError::transport(rank, format!("connect to rank {}", peer), e.to_string()));
                }
            };
            stream.set_nodelay(true)?;
            let mut link = PeerLink::new(stream);

            let operation = format!("handshake with rank {}", peer);
            let reply = within(rank, deadline, &operation, async {
                link.send(Frame::new(FrameKind::Hello, hello.clone())).await?;
                link.recv().await
            })
            .await?;
            let (peer_rank, peer_node) = check_hello(rank, &operation, reply)?;
            if peer_rank != peer {
                return Err(AppError::transport(
                    rank,
                    operation,
                    format!("{} answered as rank {}", target, peer_rank),
                ));
            }
            transport.node_ids[peer] = peer_node;
            transport.links[peer] = Some(link);
        }

        for _ in rank + 1..num_ranks {
            let operation = "accept";
            let (stream, remote) = within(rank, deadline, operation, listener.accept()).await?;
            stream.set_nodelay(true)?;
            let mut link = PeerLink::new(stream);

            let frame = within(rank, deadline, operation, link.recv()).await?;
            let (peer, peer_node) = check_hello(rank, operation, frame)?;
            if peer <= rank || peer >= num_ranks || transport.links[peer].is_some() {
                return Err(AppError::transport(
                    rank,
                    operation,
                    format!("{} introduced itself as unexpected rank {}", remote, peer),
                ));
            }
            within(
                rank,
                deadline,
                operation,
                link.send(Frame::new(FrameKind::Hello, hello.clone())),
            )
            .await?;
            transport.logger.log_connection(peer, &remote.to_string(), true, None).await;
            transport.node_ids[peer] = peer_node;
            transport.links[peer] = Some(link);
        }

        Ok(transport)
    }

    /// Node id of every rank, learned during the handshake
    pub fn topology(&self) -> Result<RankTopology> {
        RankTopology::from_node_ids(self.node_ids.clone())
    }

    fn link(&mut self, peer: usize, operation: &str) -> Result<&mut PeerLink> {
        let rank = self.rank;
        self.links
            .get_mut(peer)
            .and_then(Option::as_mut)
            .ok_or_else(|| AppError::transport(rank, operation, format!("no connection to rank {}", peer)))
    }

    /// Send one frame to `peer` and read its frame of the same kind
    async fn swap(&mut self, peer: usize, kind: FrameKind, payload: Bytes, operation: String) -> Result<Bytes> {
        let (rank, deadline) = (self.rank, self.policy.deadline);
        let link = self.link(peer, &operation)?;
        let frame = within(rank, deadline, &operation, link.swap(Frame::new(kind, payload))).await?;
        expect_kind(rank, &operation, kind, frame)
    }

    async fn send_to(&mut self, peer: usize, frame: Frame, operation: &str) -> Result<()> {
        let (rank, deadline) = (self.rank, self.policy.deadline);
        let link = self.link(peer, operation)?;
        within(rank, deadline, operation, link.send(frame)).await
    }

    async fn recv_from(&mut self, peer: usize, kind: FrameKind, operation: &str) -> Result<Bytes> {
        let (rank, deadline) = (self.rank, self.policy.deadline);
        let link = self.link(peer, operation)?;
        let frame = within(rank, deadline, operation, link.recv()).await?;
        expect_kind(rank, operation, kind, frame)
    }

    /// Collect every rank's report at rank 0; other ranks get `None`
    pub async fn gather_reports(&mut self, local: RankReport) -> Result<Option<Vec<RankReport>>> {
        if self.rank != 0 {
            let result = RankResult {
                rank: local.rank,
                pairings_measured: local.pairings_measured,
                pairings_skipped: local.pairings_skipped,
                dropped_samples: local.dropped_samples,
                histograms: local.histograms,
            };
            let payload = serde_json::to_vec(&result)?;
            self.send_to(0, Frame::new(FrameKind::Report, payload), "send report to rank 0")
                .await?;
            return Ok(None);
        }

        let mut reports = vec![local];
        for peer in 1..self.node_ids.len() {
            let operation = format!("gather report from rank {}", peer);
            let payload = self.recv_from(peer, FrameKind::Report, &operation).await?;
            let result: RankResult = serde_json::from_slice(&payload)?;
            if result.rank != peer {
                return Err(AppError::transport(
                    0,
                    operation,
                    format!("report is labelled rank {}", result.rank),
                ));
            }
            result
                .histograms
                .validate()
                .map_err(|e| e.with_prefix(&format!("report from rank {}", peer)))?;
            reports.push(result.into());
        }
        Ok(Some(reports))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.node_ids.len()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn allocate(&mut self, size: usize) -> Result<ExchangeBuffer> {
        Ok(ExchangeBuffer::new(size))
    }

    async fn release(&mut self, _buffer: ExchangeBuffer) -> Result<()> {
        Ok(())
    }

    /// Gather at rank 0, then release from rank 0
    async fn barrier(&mut self) -> Result<()> {
        let num_ranks = self.node_ids.len();
        if self.rank == 0 {
            for peer in 1..num_ranks {
                self.recv_from(peer, FrameKind::Barrier, &format!("barrier with rank {}", peer))
                    .await?;
            }
            for peer in 1..num_ranks {
                self.send_to(
                    peer,
                    Frame::empty(FrameKind::Barrier),
                    &format!("barrier with rank {}", peer),
                )
                .await?;
            }
        } else {
            self.send_to(0, Frame::empty(FrameKind::Barrier), "barrier with rank 0")
                .await?;
            self.recv_from(0, FrameKind::Barrier, "barrier with rank 0").await?;
        }
        Ok(())
    }

    async fn rendezvous(&mut self, peer: usize) -> Result<()> {
        self.swap(peer, FrameKind::Flag, Bytes::new(), format!("rendezvous with rank {}", peer))
            .await
            .map(|_| ())
    }

    async fn exchange(&mut self, buffer: &mut ExchangeBuffer, peer: usize) -> Result<()> {
        let operation = format!("exchange with rank {}", peer);
        let payload = self
            .swap(
                peer,
                FrameKind::Data,
                Bytes::copy_from_slice(buffer.send()),
                operation.clone(),
            )
            .await?;
        buffer.fill_recv(self.rank, &operation, &payload)
    }

    async fn exchange_samples(&mut self, samples: &[f64], peer: usize) -> Result<Vec<f64>> {
        let payload = self
            .swap(
                peer,
                FrameKind::Samples,
                Bytes::from(samples_to_bytes(samples)),
                format!("exchange samples with rank {}", peer),
            )
            .await?;
        samples_from_bytes(&payload)
    }
}
