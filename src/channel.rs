use crate::binder::{self, Drain};
use crate::bridge;
use crate::driver::{Clock, Interest, IoOutcome, SendBuf, Transport};
use crate::engine::SessionId;
use crate::scheduler::TimerScheduler;
use crate::session::{Liveness, Session, SessionSend};
use bytes::{Buf, Bytes};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use tracing::{error, trace, warn};

/// The ARQ-transport capability of one upgraded connection.
///
/// A `Channel` implements the same [`Transport`] contract as the raw connection it wraps,
///  so the application layer is unaware of the upgrade. Clones are cheap handles onto the
///  same session; all of them become inert once [`Channel::destroy`] has run.
///
/// `on_readable` / `on_writable` are the entry points the host event loop dispatches
///  readiness into - the equivalents of the read/write event handlers of a native
///  connection.
#[derive(Clone)]
pub struct Channel {
    session: Rc<RefCell<Session>>,
    scheduler: Rc<RefCell<TimerScheduler>>,
    clock: Rc<dyn Clock>,
    guard: Rc<Cell<bool>>,
}

impl Channel {
    pub(crate) fn new(
        session: Rc<RefCell<Session>>,
        scheduler: Rc<RefCell<TimerScheduler>>,
        clock: Rc<dyn Clock>,
        guard: Rc<Cell<bool>>,
    ) -> Channel {
        Channel {
            session,
            scheduler,
            clock,
            guard,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.borrow().id
    }

    /// Protocol-level read readiness, the flag the bridge forces during handler calls.
    pub fn readable(&self) -> bool {
        self.session.borrow().ready_read
    }

    pub fn writable(&self) -> bool {
        self.session.borrow().ready_write
    }

    pub fn set_read_handler(&self, handler: impl FnMut() + 'static) {
        self.session.borrow_mut().read_handler = Some(Box::new(handler));
    }

    pub fn set_write_handler(&self, handler: impl FnMut() + 'static) {
        self.session.borrow_mut().write_handler = Some(Box::new(handler));
    }

    /// Read-readiness dispatch from the host loop: drains the raw layer into the engine,
    ///  then lets the bridge surface whatever became available.
    pub fn on_readable(&self) {
        if self.guard.get() {
            trace!("readiness dispatched during registration, deferring to the next cycle");
            return;
        }

        let became_terminal = {
            let mut s = self.session.borrow_mut();
            if s.destroyed {
                return;
            }
            let before = s.liveness;

            let drain = {
                let Session {
                    engine,
                    binder,
                    recv_buf,
                    ..
                } = &mut *s;
                binder::drain_input(&mut **engine, binder, recv_buf)
            };
            match drain {
                Drain::Idle => {}
                Drain::Closed => s.mark_closed(),
                Drain::Errored => s.mark_errored(),
            }
            s.absorb_binder_fault();

            before == Liveness::Active && s.liveness != Liveness::Active
        };

        self.resync();
        bridge::dispatch_fault(&self.session);
        bridge::dispatch_read(&self.session, became_terminal);
        // acknowledgments arriving on the read path can release a blocked writer
        bridge::dispatch_write(&self.session);
    }

    /// Write-readiness dispatch from the host loop: the raw layer has room again, so the
    ///  write interest is dropped and the engine's pending segments flushed.
    pub fn on_writable(&self) {
        if self.guard.get() {
            trace!("readiness dispatched during registration, deferring to the next cycle");
            return;
        }

        {
            let mut s = self.session.borrow_mut();
            if s.destroyed {
                return;
            }

            let mut deregister_failed = false;
            if s.binder.is_registered(Interest::WRITABLE) {
                if let Err(e) = s.binder.deregister_guarded(Interest::WRITABLE) {
                    error!("session {}: dropping write interest failed: {}", s.id, e);
                    s.mark_errored();
                    deregister_failed = true;
                }
            }
            if !deregister_failed {
                s.flush();
            }
        }

        self.resync();
        bridge::dispatch_fault(&self.session);
        bridge::dispatch_write(&self.session);
    }

    /// Ends the session: removes the timer entry and drops the registered handlers, exactly
    ///  once. Pending read/write waits are cancelled without invoking their callbacks; the
    ///  engine is released together with the session when the last handle goes away.
    pub fn destroy(&self) {
        if self.session.borrow().destroyed {
            warn!("session {} destroyed more than once", self.session.borrow().id);
            return;
        }

        self.scheduler.borrow_mut().remove(&self.session);

        let mut s = self.session.borrow_mut();
        s.destroyed = true;
        s.read_handler = None;
        s.write_handler = None;
        trace!("session {} destroyed", s.id);
    }

    fn resync(&self) {
        let now = self.clock.now();
        self.scheduler.borrow_mut().resync(&self.session, now);
    }
}

impl Transport for Channel {
    fn send(&mut self, buf: &[u8]) -> IoOutcome {
        let now = self.clock.now();
        let result = self.session.borrow_mut().send(buf, now);
        match result {
            SessionSend::Accepted => {
                self.resync();
                bridge::dispatch_fault(&self.session);
                IoOutcome::Done(buf.len())
            }
            SessionSend::WouldBlock => IoOutcome::WouldBlock,
            SessionSend::Fatal => {
                bridge::dispatch_fault(&self.session);
                IoOutcome::Err(io::Error::new(
                    io::ErrorKind::Other,
                    "payload rejected by the session",
                ))
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome {
        self.session.borrow_mut().recv(buf)
    }

    fn send_batch(&mut self, chain: &mut VecDeque<SendBuf>, limit: usize) -> IoOutcome {
        let mut consumed = 0usize;

        loop {
            if limit > 0 && consumed >= limit {
                break;
            }

            let slice = match chain.front() {
                None => break,
                Some(SendBuf::FileRegion { .. }) => {
                    error!("disk-backed buffer handed to an ARQ channel");
                    self.session.borrow_mut().mark_errored();
                    bridge::dispatch_fault(&self.session);
                    return IoOutcome::Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "disk-backed buffers cannot travel through an ARQ channel",
                    ));
                }
                Some(SendBuf::Memory(bytes)) if bytes.is_empty() => {
                    chain.pop_front();
                    continue;
                }
                Some(SendBuf::Memory(bytes)) => {
                    let len = if limit == 0 {
                        bytes.len()
                    } else {
                        bytes.len().min(limit - consumed)
                    };
                    bytes.slice(..len)
                }
            };

            match self.send(&slice) {
                IoOutcome::Done(n) => {
                    consumed += n;
                    let emptied = match chain.front_mut() {
                        Some(SendBuf::Memory(bytes)) => {
                            bytes.advance(n);
                            bytes.is_empty()
                        }
                        _ => false,
                    };
                    if emptied {
                        chain.pop_front();
                    }
                }
                IoOutcome::WouldBlock => {
                    return if consumed > 0 {
                        IoOutcome::Done(consumed)
                    } else {
                        IoOutcome::WouldBlock
                    };
                }
                other => return other,
            }
        }

        IoOutcome::Done(consumed)
    }

    fn recv_batch(&mut self, _bufs: &mut VecDeque<Bytes>) -> IoOutcome {
        IoOutcome::Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "batch receive is not supported on an ARQ channel - use recv",
        ))
    }
}
