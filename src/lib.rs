//! Adapter layer that upgrades a raw datagram connection into a reliable, ordered,
//!  flow-controlled byte-stream channel inside a readiness-driven event loop.
//!
//! ## Design goals
//!
//! * All loss recovery, retransmission, ordering and congestion control is delegated to an
//!   external ARQ engine, consumed through the [`engine::ArqEngine`] trait. This crate never
//!   looks inside a segment beyond the fixed-offset session identifier.
//! * Application code keeps using the same four-operation stream contract
//!   ([`driver::Transport`]) as for a raw connection - the upgrade is transparent. Instead of
//!   patching function pointers on the connection, the binder wraps the raw transport
//!   capability inside a [`channel::Channel`] implementing the same trait.
//! * One process-wide [`scheduler::TimerScheduler`] multiplexes the periodic maintenance of
//!   all active sessions over a single host timer hook - there are no per-session OS timers.
//!   The scheduler's ordered index and the engine's internally computed next-service time are
//!   kept strictly in sync: every engine-state change is followed by a resync.
//! * Everything runs on the one event-loop thread, cooperatively. "Waiting" is a recorded
//!   flag, never a parked thread; would-block is a value, never an error.
//! * Protocol readiness is simulated on top of the poll/flush-driven engine by the handler
//!   bridge: after a drain or a tick, the upper layer's callbacks are re-invoked with the
//!   readiness flag forced for the duration of the call.
//!
//! ## Reentrancy
//!
//! Event-registration primitives of some hosts dispatch pending readiness synchronously,
//!  from inside the `register` call. Since the output path may already be running inside a
//!  send or flush on the dispatch stack, such a nested dispatch would re-enter the session's
//!  handlers mid-update. Registration therefore happens under a scoped guard; dispatch
//!  entry points consult the guard and defer to normal readiness cycling.

pub mod binder;
mod bridge;
pub mod channel;
pub mod config;
pub mod driver;
pub mod engine;
pub mod scheduler;
mod session;

#[cfg(test)]
pub mod test_util;

pub use binder::bind;
pub use channel::Channel;
pub use config::{ArqProfile, ChannelConfig, ProfileParams};
pub use driver::{Clock, EventDriver, Interest, IoOutcome, SendBuf, SystemClock, Transport};
pub use engine::{extract_session_id, ArqEngine, SegmentOutcome, SegmentSink, SessionId};
pub use scheduler::TimerScheduler;
