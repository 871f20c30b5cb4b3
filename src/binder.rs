use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::driver::{Clock, EventDriver, Interest, IoOutcome, Transport};
use crate::engine::{ArqEngine, SegmentOutcome, SegmentSink, SessionId};
use crate::scheduler::TimerScheduler;
use crate::session::Session;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, error, info, trace};

/// The wrapped raw-transport capability of one session, together with everything the output
///  path needs: the event-registration handle, the scoped reentrancy guard and the fault
///  latch that carries a transport error out of an engine callback.
///
/// The binder is handed to the engine as its [`SegmentSink`] whenever an engine operation
///  runs, so every segment the engine produces goes out through the saved raw `send`.
pub(crate) struct Binder {
    raw: Box<dyn Transport>,
    driver: Box<dyn EventDriver>,
    guard: Rc<Cell<bool>>,
    fault: bool,
}

impl Binder {
    pub(crate) fn new(
        raw: Box<dyn Transport>,
        driver: Box<dyn EventDriver>,
        guard: Rc<Cell<bool>>,
    ) -> Binder {
        Binder {
            raw,
            driver,
            guard,
            fault: false,
        }
    }

    pub(crate) fn raw_recv(&mut self, buf: &mut [u8]) -> IoOutcome {
        self.raw.recv(buf)
    }

    /// Takes the latched transport fault, clearing it. Callers fold the result into the
    ///  session's lifecycle state after every engine call.
    pub(crate) fn take_fault(&mut self) -> bool {
        std::mem::take(&mut self.fault)
    }

    pub(crate) fn is_registered(&self, interest: Interest) -> bool {
        self.driver.is_registered(interest)
    }

    /// Registration with the reentrancy guard held: if the host dispatches pending readiness
    ///  synchronously from inside `register`, the channel's entry points see the guard and
    ///  defer to the next readiness cycle instead of re-entering the session mid-update.
    pub(crate) fn register_guarded(&mut self, interest: Interest) -> anyhow::Result<()> {
        self.guard.set(true);
        let result = self.driver.register(interest);
        self.guard.set(false);
        result
    }

    pub(crate) fn deregister_guarded(&mut self, interest: Interest) -> anyhow::Result<()> {
        self.guard.set(true);
        let result = self.driver.deregister(interest);
        self.guard.set(false);
        result
    }
}

impl SegmentSink for Binder {
    fn emit_segment(&mut self, segment: &[u8]) -> SegmentOutcome {
        match self.raw.send(segment) {
            IoOutcome::Done(n) if n == segment.len() => SegmentOutcome::Sent,
            IoOutcome::Done(n) => {
                // the datagram layer is expected to be atomic per segment
                error!("short write of outgoing segment ({} of {} bytes)", n, segment.len());
                self.fault = true;
                SegmentOutcome::Fault
            }
            IoOutcome::WouldBlock => {
                if !self.driver.is_registered(Interest::WRITABLE) {
                    trace!("raw transport blocked, registering for write readiness");
                    if let Err(e) = self.register_guarded(Interest::WRITABLE) {
                        error!("registering write readiness failed: {}", e);
                        self.fault = true;
                        return SegmentOutcome::Fault;
                    }
                }
                // the engine retains its retransmission copy, nothing is lost
                SegmentOutcome::Sent
            }
            IoOutcome::Eof => {
                error!("raw transport reported eof while sending a segment");
                self.fault = true;
                SegmentOutcome::Fault
            }
            IoOutcome::Err(e) => {
                error!("raw transport error while sending a segment: {}", e);
                self.fault = true;
                SegmentOutcome::Fault
            }
        }
    }
}

/// Outcome of one input-path drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drain {
    /// Raw layer reported would-block, all received datagrams were fed to the engine.
    Idle,
    /// Peer shut down in an orderly fashion.
    Closed,
    /// Raw transport error or the engine rejected a datagram.
    Errored,
}

/// Drains the raw layer, feeding every datagram to the engine, until would-block, eof or
///  error. The caller resynchronizes the timer entry once afterwards.
pub(crate) fn drain_input(
    engine: &mut dyn ArqEngine,
    binder: &mut Binder,
    buf: &mut [u8],
) -> Drain {
    loop {
        match binder.raw_recv(buf) {
            IoOutcome::Done(n) if n > 0 => {
                if let Err(e) = engine.input(&buf[..n], binder) {
                    error!("engine rejected incoming datagram: {}", e);
                    return Drain::Errored;
                }
            }
            IoOutcome::Done(_) | IoOutcome::Eof => {
                info!("connection was closed by the peer");
                return Drain::Closed;
            }
            IoOutcome::WouldBlock => {
                return Drain::Idle;
            }
            IoOutcome::Err(e) => {
                info!("raw transport error while draining: {}", e);
                return Drain::Errored;
            }
        }
    }
}

/// Upgrades a raw datagram connection into a reliable channel.
///
/// Allocates the engine through `make_engine`, configures profile and windows, registers
///  read readiness if not already active, inserts the session's timer entry and, if the host
///  buffered bytes on the raw connection before the upgrade, feeds them to the engine -
///  leaving the channel read-ready if they already contain a decodable unit.
///
/// On any failure nothing is published: partially acquired state is released and the raw
///  connection stays un-upgraded.
pub fn bind(
    raw: Box<dyn Transport>,
    driver: Box<dyn EventDriver>,
    clock: Rc<dyn Clock>,
    scheduler: &Rc<RefCell<TimerScheduler>>,
    session_id: SessionId,
    config: ChannelConfig,
    make_engine: impl FnOnce(SessionId) -> anyhow::Result<Box<dyn ArqEngine>>,
    prebuffered: &[u8],
) -> anyhow::Result<Channel> {
    config.validate()?;

    let mut engine = make_engine(session_id)?;
    engine.configure(&config.profile.params());
    engine.set_window(config.send_window, config.recv_window);

    let guard = Rc::new(Cell::new(false));
    let mut binder = Binder::new(raw, driver, guard.clone());

    let read_registered_here = if binder.is_registered(Interest::READABLE) {
        false
    } else {
        binder.register_guarded(Interest::READABLE)?;
        true
    };

    let rollback = |binder: &mut Binder| {
        // feeding prebuffered bytes may have registered write interest via the output path
        if binder.is_registered(Interest::WRITABLE) {
            if let Err(e) = binder.deregister_guarded(Interest::WRITABLE) {
                debug!("rolling back write registration failed: {}", e);
            }
        }
        if read_registered_here {
            if let Err(e) = binder.deregister_guarded(Interest::READABLE) {
                debug!("rolling back read registration failed: {}", e);
            }
        }
    };

    let mut session = Session::new(session_id, config, engine, binder);

    if !prebuffered.is_empty() {
        if let Err(e) = session
            .engine
            .input(prebuffered, &mut session.binder)
        {
            rollback(&mut session.binder);
            anyhow::bail!("engine rejected pre-buffered bytes: {}", e);
        }
        if session.binder.take_fault() {
            rollback(&mut session.binder);
            anyhow::bail!("transport fault while feeding pre-buffered bytes");
        }
        if session.engine.peek_next_size().is_some() {
            session.ready_read = true;
        }
    }

    let now = clock.now();
    let session = Rc::new(RefCell::new(session));
    scheduler.borrow_mut().add(&session, now);

    debug!("upgraded raw connection to ARQ channel, session {}", session_id);

    Ok(Channel::new(session, scheduler.clone(), clock, guard))
}
