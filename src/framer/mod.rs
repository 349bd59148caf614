//! Frame boundary recovery for MPEG transport streams
//!
//! An ingest body arrives as an unframed byte stream chopped up arbitrarily
//! by the network. The stream is made of fixed-size packets that each start
//! with a sync byte, so the framer accumulates bytes and, on every flush
//! tick, votes on where packets start:
//!
//! - every sync byte at position `p` votes for offset `p % unit`
//! - the offset with the most votes wins, ties going to the one voted for
//!   earliest in the buffer
//! - bytes from that offset up to the last whole packet are emitted
//! - the partial packet at the end is carried into the next window
//!
//! A window with no sync byte at all emits nothing and waits for more data.

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, warn};

/// MPEG-TS packet size in bytes
pub const TS_PACKET_SIZE: usize = 188;

/// MPEG-TS sync byte
pub const TS_SYNC_BYTE: u8 = 0x47;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(5);

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1_024_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramerConfig {
    /// Size of one packet
    pub unit: usize,

    /// First byte of every packet
    pub sync: u8,

    /// How often accumulated bytes are flushed as a frame
    pub flush_interval: Duration,

    /// A window larger than this with no sync byte is thrown away
    pub max_frame_bytes: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            unit: TS_PACKET_SIZE,
            sync: TS_SYNC_BYTE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Byte accumulator for one ingest connection
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    unit: usize,
    sync: u8,
    max_bytes: usize,
    discarded: u64,
}

impl FrameBuffer {
    pub fn new(config: &FramerConfig) -> Self {
        Self {
            buf: BytesMut::new(),
            unit: config.unit.max(1),
            sync: config.sync,
            max_bytes: config.max_frame_bytes.max(config.unit),
            discarded: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes thrown away so far (junk before the first packet, oversized
    /// windows without a sync byte, trailing partial packets)
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);

        if self.buf.len() > self.max_bytes && !self.buf.contains(&self.sync) {
            warn!(bytes = self.buf.len(), "No sync byte in oversized window, discarding");
            self.discard(self.buf.len());
        }
    }

    /// Most likely packet start offset, if any sync byte is present
    ///
    /// Each sync byte votes for its position modulo the packet size. On a
    /// tie the offset whose first vote appears earliest in the buffer wins,
    /// so a stray sync byte inside a payload cannot beat the packet start
    /// that precedes it.
    pub fn estimate_offset(&self) -> Option<usize> {
        let mut votes = vec![0usize; self.unit];
        let mut first = vec![usize::MAX; self.unit];
        for (pos, byte) in self.buf.iter().enumerate() {
            if *byte == self.sync {
                let offset = pos % self.unit;
                votes[offset] += 1;
                first[offset] = first[offset].min(pos);
            }
        }

        (0..self.unit)
            .filter(|&offset| votes[offset] > 0)
            .max_by(|&a, &b| votes[a].cmp(&votes[b]).then(first[b].cmp(&first[a])))
    }

    /// Take every whole packet from the estimated offset onward
    pub fn flush(&mut self) -> Option<Bytes> {
        let offset = self.estimate_offset()?;
        let units = (self.buf.len() - offset) / self.unit;
        if units == 0 {
            return None;
        }

        if offset > 0 {
            debug!(offset, "Skipping bytes before first packet");
            self.discard(offset);
        }

        Some(self.buf.split_to(units * self.unit).freeze())
    }

    /// Final flush at end of stream; a trailing partial packet is dropped
    pub fn finish(&mut self) -> Option<Bytes> {
        let frame = self.flush();
        if !self.buf.is_empty() {
            debug!(bytes = self.buf.len(), "Dropping partial packet at end of stream");
            self.discard(self.buf.len());
        }
        frame
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.discarded += n as u64;
    }
}

struct Framer<S> {
    body: Pin<Box<S>>,
    buffer: FrameBuffer,
    ticker: Interval,
    done: bool,
}

/// Turn a byte stream into a stream of packet-aligned frames
///
/// The buffer is owned by the returned stream, so appends and flushes never
/// interleave. Frames are flushed on every tick of `flush_interval` and once
/// more when the body ends or fails.
pub fn frames<S, E>(body: S, config: FramerConfig) -> impl Stream<Item = Bytes> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let mut ticker = interval(config.flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let framer = Framer {
        body: Box::pin(body),
        buffer: FrameBuffer::new(&config),
        ticker,
        done: false,
    };

    stream::unfold(framer, |mut framer| async move {
        loop {
            if framer.done {
                return None;
            }

            tokio::select! {
                chunk = framer.body.next() => match chunk {
                    Some(Ok(bytes)) => framer.buffer.append(&bytes),
                    Some(Err(e)) => {
                        warn!(error = %e, "Ingest body failed");
                        framer.done = true;
                        if let Some(frame) = framer.buffer.finish() {
                            return Some((frame, framer));
                        }
                    }
                    None => {
                        framer.done = true;
                        if let Some(frame) = framer.buffer.finish() {
                            return Some((frame, framer));
                        }
                    }
                },
                _ = framer.ticker.tick() => {
                    if let Some(frame) = framer.buffer.flush() {
                        return Some((frame, framer));
                    }
                }
            }
        }
    })
}
