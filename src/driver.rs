use bitflags::bitflags;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Instant;
#[cfg(test)]
use mockall::automock;

bitflags! {
    /// Readiness interests that can be registered with the host event loop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

/// Non-blocking I/O result, shared by raw connections and upgraded channels.
///
/// `WouldBlock` is a regular value here, not an error: it means "retry on the next readiness
///  cycle". `Eof` is the peer's orderly shutdown. `Err` is terminal.
#[derive(Debug)]
pub enum IoOutcome {
    Done(usize),
    WouldBlock,
    Eof,
    Err(std::io::Error),
}

/// One buffer in a send chain.
///
/// Only in-memory buffers can travel through an ARQ channel; `FileRegion` exists because the
///  generic chain abstraction of the host can stage disk-backed regions for sendfile-style
///  transports, and handing one to this adapter is a fatal misuse.
#[derive(Debug, Clone)]
pub enum SendBuf {
    Memory(Bytes),
    FileRegion { offset: u64, len: usize },
}

/// The four-operation stream contract of a connection.
///
/// Raw datagram connections implement this over the socket; an upgraded [`crate::Channel`]
///  implements the very same trait on top of the engine, which is what makes the upgrade
///  invisible to the application layer.
#[cfg_attr(test, automock)]
pub trait Transport {
    fn send(&mut self, buf: &[u8]) -> IoOutcome;

    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome;

    /// Consumes buffers from the front of `chain`, up to `limit` bytes (0 = unlimited),
    ///  stopping at the first would-block or error. Consumed data is removed from the chain
    ///  in place; whatever remains is the unconsumed remainder.
    fn send_batch(&mut self, chain: &mut VecDeque<SendBuf>, limit: usize) -> IoOutcome;

    fn recv_batch(&mut self, bufs: &mut VecDeque<Bytes>) -> IoOutcome;
}

/// Registration surface of the host event loop, scoped to one connection handle.
///
/// NB: `register` is allowed to dispatch pending readiness *synchronously*, before it
///  returns. The adapter defends against that with a scoped guard (see [`crate::binder`]);
///  implementations do not need to defer anything.
#[cfg_attr(test, automock)]
pub trait EventDriver {
    fn register(&mut self, interest: Interest) -> anyhow::Result<()>;

    fn deregister(&mut self, interest: Interest) -> anyhow::Result<()>;

    fn is_registered(&self, interest: Interest) -> bool;
}

/// Monotonic clock, abstracted so tests can drive protocol time explicitly.
pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
