use crate::config::ProfileParams;
use std::fmt;
use std::time::Instant;

/// Fixed size of the engine's segment header. The adapter treats segments as opaque beyond
///  this: the only field it ever reads is the session identifier at offset 0.
pub const SEGMENT_HEADER_LEN: usize = 24;

/// Identifier of one logical reliable channel, stable for the channel's lifetime. Both peers
///  of a session stamp it into every segment, which is what allows demultiplexing datagrams
///  arriving on a shared socket before any protocol state exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extracts the session identifier from a raw datagram, without feeding it to any engine.
///
/// Returns `None` if the buffer cannot hold a full segment header - a shorter datagram can
///  not be a valid segment, and reading an identifier from it would be garbage.
pub fn extract_session_id(datagram: &[u8]) -> Option<SessionId> {
    if datagram.len() < SEGMENT_HEADER_LEN {
        return None;
    }
    let raw = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    Some(SessionId(raw))
}

/// Result of handing one produced segment to a [`SegmentSink`].
///
/// Would-block on the wire is absorbed by the sink (the engine keeps its retransmission copy
///  either way), so the only thing the engine learns is whether the transport is still usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    Sent,
    Fault,
}

/// Receiver for the segments an engine produces while one of its operations runs.
///
/// This is a per-call capability rather than a stored callback: every engine operation that
///  may emit wire data takes a fresh `&mut dyn SegmentSink`, so the engine never holds a
///  back-reference into adapter state.
pub trait SegmentSink {
    fn emit_segment(&mut self, segment: &[u8]) -> SegmentOutcome;
}

/// The external ARQ protocol engine, one instance per session.
///
/// The engine owns window sizing, retransmission timing, congestion control and segment
///  encoding; the adapter only schedules it and moves bytes. Contract notes:
///
/// * `input` takes one raw datagram exactly as received from the wire; `send` takes one
///   application payload. Both may emit segments (acks, data) into the sink and both fail
///   only on outright rejection - that is a protocol fault, terminal for the session.
/// * `recv` copies the next fully reassembled unit into `buf` and returns its length, or
///   `None` if no unit is currently decodable.
/// * `update` performs a maintenance pass for the given instant; `check` reports the next
///   instant at which maintenance is required and never returns an instant in the past.
/// * `flush` forces out whatever `update` left pending, without advancing protocol time.
/// * `waiting_send_count` is the number of units handed to `send` that the peer has not yet
///   acknowledged - the quantity the adapter's backpressure thresholds are compared against.
///
/// Releasing the engine is `Drop`.
pub trait ArqEngine {
    fn configure(&mut self, params: &ProfileParams);

    fn set_window(&mut self, send_units: u32, recv_units: u32);

    fn input(&mut self, datagram: &[u8], out: &mut dyn SegmentSink) -> anyhow::Result<()>;

    fn send(&mut self, payload: &[u8], out: &mut dyn SegmentSink) -> anyhow::Result<()>;

    fn recv(&mut self, buf: &mut [u8]) -> Option<usize>;

    fn update(&mut self, now: Instant, out: &mut dyn SegmentSink);

    fn check(&self, now: Instant) -> Instant;

    fn flush(&mut self, out: &mut dyn SegmentSink);

    fn waiting_send_count(&self) -> usize;

    fn peek_next_size(&self) -> Option<usize>;
}
