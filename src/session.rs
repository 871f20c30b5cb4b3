use crate::binder::Binder;
use crate::config::ChannelConfig;
use crate::driver::IoOutcome;
use crate::engine::{ArqEngine, SessionId};
use std::io;
use std::time::Instant;
use tracing::{debug, error, trace};

/// Lifecycle of a session. `Errored` and `Closed` are terminal: once entered they are never
///  left, and no further sends are admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Liveness {
    Active,
    Errored,
    Closed,
}

/// Outcome of the session-level send path, before it is translated into the stream contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionSend {
    Accepted,
    WouldBlock,
    Fatal,
}

/// Per-channel adapter state binding one ARQ engine instance to one raw connection.
///
/// A session lives behind `Rc<RefCell<..>>`, shared between the public channel handle and
///  the timer scheduler's index entry. All access happens on the event-loop thread; the
///  engine and the binder are separate fields precisely so engine operations can borrow the
///  binder as their segment sink while the session is already mutably borrowed.
pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) config: ChannelConfig,
    pub(crate) engine: Box<dyn ArqEngine>,
    pub(crate) binder: Binder,

    pub(crate) liveness: Liveness,
    /// Set after `recv` reported would-block to the upper layer; cleared only by the bridge.
    pub(crate) read_waiting: bool,
    /// Set after `send` reported would-block to the upper layer; cleared only by the bridge.
    pub(crate) write_waiting: bool,

    /// Readiness flags the bridge forces for the duration of a handler call.
    pub(crate) ready_read: bool,
    pub(crate) ready_write: bool,

    pub(crate) read_handler: Option<Box<dyn FnMut()>>,
    pub(crate) write_handler: Option<Box<dyn FnMut()>>,

    /// A fatal condition was latched but its one-shot propagation to the write handler has
    ///  not happened yet.
    pub(crate) fault_pending: bool,

    /// Key of this session's entry in the timer scheduler's ordered index. `Some` for the
    ///  whole lifetime, `None` only transiently while the scheduler services the entry, and
    ///  permanently after destruction.
    pub(crate) timer_deadline: Option<Instant>,

    pub(crate) recv_buf: Vec<u8>,
    pub(crate) destroyed: bool,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        config: ChannelConfig,
        engine: Box<dyn ArqEngine>,
        binder: Binder,
    ) -> Session {
        let recv_buf = vec![0u8; config.recv_buf_len];
        Session {
            id,
            config,
            engine,
            binder,
            liveness: Liveness::Active,
            read_waiting: false,
            write_waiting: false,
            ready_read: false,
            ready_write: true,
            read_handler: None,
            write_handler: None,
            fault_pending: false,
            timer_deadline: None,
            recv_buf,
            destroyed: false,
        }
    }

    /// Enqueues one payload with the engine, honoring the admission ceiling, and eagerly
    ///  flushes so the segment hits the wire in the same call rather than at the next tick.
    pub(crate) fn send(&mut self, payload: &[u8], now: Instant) -> SessionSend {
        if self.liveness != Liveness::Active {
            debug!("session {}: send on {:?} session refused", self.id, self.liveness);
            return SessionSend::Fatal;
        }

        // while the writer is latched as waiting, admission stays refused until the bridge
        //  releases it at the hysteresis floor
        let outstanding = self.engine.waiting_send_count();
        if self.write_waiting || outstanding > self.config.admission_ceiling {
            trace!(
                "session {}: send refused, {} unacknowledged units (ceiling {})",
                self.id,
                outstanding,
                self.config.admission_ceiling
            );
            self.write_waiting = true;
            self.ready_write = false;
            return SessionSend::WouldBlock;
        }

        if let Err(e) = self.engine.send(payload, &mut self.binder) {
            error!("session {}: engine rejected payload: {}", self.id, e);
            self.mark_errored();
            return SessionSend::Fatal;
        }

        self.engine.update(now, &mut self.binder);
        self.engine.flush(&mut self.binder);
        self.absorb_binder_fault();

        SessionSend::Accepted
    }

    pub(crate) fn recv(&mut self, buf: &mut [u8]) -> IoOutcome {
        match self.liveness {
            Liveness::Closed => return IoOutcome::Eof,
            Liveness::Errored => {
                return IoOutcome::Err(io::Error::new(
                    io::ErrorKind::Other,
                    "session is in an error state",
                ))
            }
            Liveness::Active => {}
        }

        match self.engine.recv(buf) {
            Some(n) => {
                self.ready_read = self.engine.peek_next_size().is_some();
                IoOutcome::Done(n)
            }
            None => {
                self.read_waiting = true;
                self.ready_read = false;
                IoOutcome::WouldBlock
            }
        }
    }

    /// One scheduled maintenance pass.
    pub(crate) fn tick(&mut self, now: Instant) {
        self.engine.update(now, &mut self.binder);
        self.absorb_binder_fault();
    }

    /// Forced flush, used by the scheduler when a serviced entry's deadline refuses to
    ///  advance, and by the write-readiness path.
    pub(crate) fn flush(&mut self) {
        self.engine.flush(&mut self.binder);
        self.absorb_binder_fault();
    }

    pub(crate) fn mark_errored(&mut self) {
        // one-shot: only the first transition arms the fault propagation
        if self.liveness == Liveness::Active {
            self.liveness = Liveness::Errored;
            self.fault_pending = true;
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        if self.liveness == Liveness::Active {
            self.liveness = Liveness::Closed;
        }
    }

    /// Folds a transport fault latched by the output path into the lifecycle state.
    pub(crate) fn absorb_binder_fault(&mut self) {
        if self.binder.take_fault() {
            self.mark_errored();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::Binder;
    use crate::config::ArqProfile;
    use crate::driver::{MockEventDriver, MockTransport};
    use crate::test_util::FakeEngine;
    use std::cell::Cell;
    use std::rc::Rc;

    fn test_session(engine: FakeEngine) -> Session {
        let mut raw = MockTransport::new();
        raw.expect_send().returning(|buf| IoOutcome::Done(buf.len()));
        let mut driver = MockEventDriver::new();
        driver.expect_is_registered().return_const(true);

        let binder = Binder::new(Box::new(raw), Box::new(driver), Rc::new(Cell::new(false)));
        let mut config = ChannelConfig::new(ArqProfile::Normal);
        config.admission_ceiling = 4;
        config.release_floor = 1;
        Session::new(SessionId(7), config, Box::new(engine), binder)
    }

    #[test]
    fn test_send_accepts_and_flushes_eagerly() {
        let engine = FakeEngine::new();
        let knobs = engine.clone();
        let mut session = test_session(engine);

        let now = Instant::now();
        assert_eq!(session.send(b"hello", now), SessionSend::Accepted);
        assert_eq!(knobs.sent.borrow().as_slice(), &[b"hello".to_vec()]);
        assert_eq!(knobs.updates.get(), 1);
        assert_eq!(knobs.flushes.get(), 1);
        assert!(!session.write_waiting);
    }

    #[test]
    fn test_send_above_ceiling_would_block_and_latches() {
        let engine = FakeEngine::new();
        let knobs = engine.clone();
        let mut session = test_session(engine);

        knobs.outstanding.set(5); // ceiling is 4
        assert_eq!(session.send(b"x", Instant::now()), SessionSend::WouldBlock);
        assert!(session.write_waiting);
        assert!(!session.ready_write);
        // nothing was handed to the engine
        assert!(knobs.sent.borrow().is_empty());
    }

    #[test]
    fn test_send_at_ceiling_is_still_accepted() {
        let engine = FakeEngine::new();
        let knobs = engine.clone();
        let mut session = test_session(engine);

        knobs.outstanding.set(4);
        assert_eq!(session.send(b"x", Instant::now()), SessionSend::Accepted);
    }

    #[test]
    fn test_send_rejected_by_engine_is_fatal() {
        let engine = FakeEngine::new();
        let knobs = engine.clone();
        let mut session = test_session(engine);

        knobs.reject_send.set(true);
        assert_eq!(session.send(b"x", Instant::now()), SessionSend::Fatal);
        assert_eq!(session.liveness, Liveness::Errored);
        assert!(session.fault_pending);
    }

    #[test]
    fn test_send_after_close_is_rejected() {
        let engine = FakeEngine::new();
        let mut session = test_session(engine);

        session.mark_closed();
        assert_eq!(session.send(b"x", Instant::now()), SessionSend::Fatal);
        // close is not an error: the liveness state must not change
        assert_eq!(session.liveness, Liveness::Closed);
    }

    #[test]
    fn test_recv_returns_units_then_would_block() {
        let engine = FakeEngine::new();
        let knobs = engine.clone();
        let mut session = test_session(engine);

        knobs.recv_units.borrow_mut().push_back(vec![1, 2, 3]);

        let mut buf = [0u8; 16];
        assert!(matches!(session.recv(&mut buf), IoOutcome::Done(3)));
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert!(!session.read_waiting);

        assert!(matches!(session.recv(&mut buf), IoOutcome::WouldBlock));
        assert!(session.read_waiting);
        assert!(!session.ready_read);
    }

    #[test]
    fn test_recv_after_close_reports_eof_indefinitely() {
        let engine = FakeEngine::new();
        let knobs = engine.clone();
        let mut session = test_session(engine);

        session.mark_closed();
        knobs.recv_units.borrow_mut().push_back(vec![9]);

        let mut buf = [0u8; 16];
        for _ in 0..3 {
            assert!(matches!(session.recv(&mut buf), IoOutcome::Eof));
        }
        assert_eq!(session.liveness, Liveness::Closed);
    }

    #[test]
    fn test_terminal_states_are_monotonic() {
        let engine = FakeEngine::new();
        let mut session = test_session(engine);

        session.mark_errored();
        assert_eq!(session.liveness, Liveness::Errored);
        session.mark_closed();
        assert_eq!(session.liveness, Liveness::Errored);
    }
}
