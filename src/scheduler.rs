use crate::bridge;
use crate::engine::SessionId;
use crate::session::{Liveness, Session};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Floor for rescheduling an entry whose deadline refuses to advance even after a forced
///  flush. Keeps a misbehaving engine from turning the timer hook into a busy loop.
const MIN_TICK: Duration = Duration::from_millis(1);

/// The process-wide maintenance scheduler: one ordered index over the next-service deadlines
///  of all live sessions, multiplexed onto the host's single timer hook.
///
/// Owned by the event-loop driver (behind `Rc<RefCell<..>>`, accessed only on the loop
///  thread), created at loop start and torn down at shutdown. The index key is the absolute
///  deadline most recently computed by the session's engine; [`TimerScheduler::resync`] is
///  what keeps that strictly true after every engine-state change.
pub struct TimerScheduler {
    index: BTreeMap<(Instant, SessionId), Rc<RefCell<Session>>>,
}

impl TimerScheduler {
    pub fn new() -> TimerScheduler {
        TimerScheduler {
            index: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Inserts the entry for a freshly bound session. O(log N).
    pub(crate) fn add(&mut self, session: &Rc<RefCell<Session>>, now: Instant) {
        let mut s = session.borrow_mut();
        debug_assert!(s.timer_deadline.is_none());

        let deadline = s.engine.check(now).max(now);
        s.timer_deadline = Some(deadline);
        let key = (deadline, s.id);
        drop(s);

        self.index.insert(key, session.clone());
    }

    /// Erases the session's entry. O(log N); a no-op if the entry is already gone.
    pub(crate) fn remove(&mut self, session: &Rc<RefCell<Session>>) {
        let mut s = session.borrow_mut();
        if let Some(deadline) = s.timer_deadline.take() {
            let key = (deadline, s.id);
            drop(s);
            self.index.remove(&key);
        }
    }

    /// Recomputes the session's required next-service time from the engine and, if it
    ///  changed, removes and reinserts the entry. Never updates a key in place - that would
    ///  corrupt the ordering of the index.
    pub(crate) fn resync(&mut self, session: &Rc<RefCell<Session>>, now: Instant) {
        let mut s = session.borrow_mut();
        if s.destroyed {
            return;
        }

        let next = s.engine.check(now).max(now);
        if s.timer_deadline == Some(next) {
            return;
        }

        let old_key = s.timer_deadline.map(|deadline| (deadline, s.id));
        s.timer_deadline = Some(next);
        let new_key = (next, s.id);
        drop(s);

        if let Some(old_key) = old_key {
            self.index.remove(&old_key);
        }
        self.index.insert(new_key, session.clone());
    }

    /// Reinserts the entry at an explicit deadline, overriding what the engine reported.
    fn defer(&mut self, session: &Rc<RefCell<Session>>, deadline: Instant) {
        let mut s = session.borrow_mut();
        let old_key = s.timer_deadline.map(|d| (d, s.id));
        s.timer_deadline = Some(deadline);
        let new_key = (deadline, s.id);
        drop(s);

        if let Some(old_key) = old_key {
            self.index.remove(&old_key);
        }
        self.index.insert(new_key, session.clone());
    }

    /// Services every due entry and reports how long the host may sleep: `Some(delta)` until
    ///  the earliest remaining deadline, `None` if no sessions are bound at all.
    ///
    /// This is the single hook the host's timer-deadline computation calls once per loop
    ///  iteration. For each due entry the session is ticked and resynchronized; if the
    ///  deadline still equals `now` afterwards, a flush is forced and the entry
    ///  resynchronized again, so a key that does not advance on its own cannot pin the loop.
    ///  Engine faults surfacing during a tick are latched on the session and propagated
    ///  through the handler bridge, never returned from here.
    pub fn run_due(scheduler: &Rc<RefCell<TimerScheduler>>, now: Instant) -> Option<Duration> {
        loop {
            let session = {
                let mut sched = scheduler.borrow_mut();
                let key = match sched.index.first_key_value() {
                    None => return None,
                    Some((&key, _)) => key,
                };
                if key.0 > now {
                    return Some(key.0 - now);
                }
                match sched.index.remove(&key) {
                    Some(session) => {
                        session.borrow_mut().timer_deadline = None;
                        session
                    }
                    None => continue,
                }
            };

            let before = session.borrow().liveness;
            session.borrow_mut().tick(now);
            scheduler.borrow_mut().resync(&session, now);

            if session.borrow().timer_deadline == Some(now) {
                trace!("session deadline did not advance after tick, forcing flush");
                session.borrow_mut().flush();
                scheduler.borrow_mut().resync(&session, now);

                if session.borrow().timer_deadline == Some(now) {
                    scheduler.borrow_mut().defer(&session, now + MIN_TICK);
                }
            }

            let became_terminal =
                before == Liveness::Active && session.borrow().liveness != Liveness::Active;

            bridge::dispatch_fault(&session);
            bridge::dispatch_read(&session, became_terminal);
            bridge::dispatch_write(&session);
        }
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        TimerScheduler::new()
    }
}
