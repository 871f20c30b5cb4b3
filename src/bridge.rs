//! Propagation of protocol-level readiness changes to the upper layer.
//!
//! The engine is poll/flush-driven and knows nothing about readiness, so after every
//!  input-path drain, write-path flush or scheduled tick the bridge decides whether the
//!  upper layer's callbacks must be re-invoked. Handlers are taken out of the session for
//!  the duration of the call: they run with no session borrow held, so a handler is free to
//!  use the channel like any other caller.

use crate::session::{Liveness, Session};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// Invokes the read handler if a decoded unit is available or the session just turned
///  terminal. New data is surfaced promptly whether or not the upper layer was recorded as
///  read-waiting; the readiness flag is forced true for the duration of the call and
///  restored afterwards.
pub(crate) fn dispatch_read(session: &Rc<RefCell<Session>>, became_terminal: bool) {
    let (mut handler, prior_ready) = {
        let mut s = session.borrow_mut();
        if s.destroyed {
            return;
        }
        let unit_ready = s.engine.peek_next_size().is_some();
        if !unit_ready && !became_terminal {
            return;
        }

        s.read_waiting = false;
        let handler = match s.read_handler.take() {
            Some(handler) => handler,
            None => return,
        };

        let prior = s.ready_read;
        s.ready_read = true;
        (handler, prior)
    };

    trace!("re-invoking upper read handler");
    handler();

    let mut s = session.borrow_mut();
    if !s.destroyed {
        s.ready_read = prior_ready;
        if s.read_handler.is_none() {
            s.read_handler = Some(handler);
        }
    }
}

/// Releases a blocked writer: if the upper layer is write-waiting and the outstanding count
///  has dropped to the release floor (or the session is no longer active), the latch is
///  cleared and the write handler invoked with writability forced for the call.
pub(crate) fn dispatch_write(session: &Rc<RefCell<Session>>) {
    let (mut handler, prior_ready) = {
        let mut s = session.borrow_mut();
        if s.destroyed || !s.write_waiting {
            return;
        }

        let released = s.engine.waiting_send_count() <= s.config.release_floor
            || s.liveness != Liveness::Active;
        if !released {
            return;
        }

        s.write_waiting = false;
        let handler = match s.write_handler.take() {
            Some(handler) => handler,
            None => return,
        };

        let prior = s.ready_write;
        s.ready_write = true;
        (handler, prior)
    };

    trace!("re-invoking upper write handler after release");
    handler();

    let mut s = session.borrow_mut();
    if !s.destroyed {
        s.ready_write = prior_ready;
        if s.write_handler.is_none() {
            s.write_handler = Some(handler);
        }
    }
}

/// One-shot propagation of a fatal condition: the write handler runs immediately, without
///  the force/restore dance - this is direct fault notification, not a readiness event.
pub(crate) fn dispatch_fault(session: &Rc<RefCell<Session>>) {
    let mut handler = {
        let mut s = session.borrow_mut();
        if s.destroyed || !s.fault_pending {
            return;
        }
        s.fault_pending = false;
        s.write_waiting = false;

        match s.write_handler.take() {
            Some(handler) => handler,
            None => return,
        }
    };

    trace!("propagating fatal session condition to the upper write handler");
    handler();

    let mut s = session.borrow_mut();
    if !s.destroyed && s.write_handler.is_none() {
        s.write_handler = Some(handler);
    }
}
