//! Scripted collaborators for tests: a fake ARQ engine whose knobs stay accessible after the
//!  engine was moved into a session, and a manually advanced clock.

use crate::config::ProfileParams;
use crate::driver::Clock;
use crate::engine::{ArqEngine, SegmentSink};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Fake engine. All state is behind `Rc`, so cloning yields a handle sharing the knobs with
///  the instance that was boxed into the session under test.
///
/// Behavior conventions: every input datagram decodes into exactly one receivable unit;
///  every sent payload adds one outstanding unacknowledged unit. Tests that need
///  acknowledgments simply lower `outstanding` themselves.
#[derive(Clone)]
pub struct FakeEngine {
    pub params: Rc<RefCell<Option<ProfileParams>>>,
    pub window: Rc<Cell<(u32, u32)>>,
    pub inputs: Rc<RefCell<Vec<Vec<u8>>>>,
    pub sent: Rc<RefCell<Vec<Vec<u8>>>>,
    pub recv_units: Rc<RefCell<VecDeque<Vec<u8>>>>,
    pub outstanding: Rc<Cell<usize>>,
    /// Segments emitted into the sink by the next update/flush, one at a time.
    pub pending_output: Rc<RefCell<VecDeque<Vec<u8>>>>,
    /// When set, `input` answers every datagram with one ack segment into the sink.
    pub ack_on_input: Rc<Cell<bool>>,
    pub reject_input: Rc<Cell<bool>>,
    pub reject_send: Rc<Cell<bool>>,
    /// Overrides `check`; when `None`, `check` reports `now + interval`.
    pub next_deadline: Rc<Cell<Option<Instant>>>,
    pub interval: Rc<Cell<Duration>>,
    pub updates: Rc<Cell<usize>>,
    pub flushes: Rc<Cell<usize>>,
}

impl FakeEngine {
    pub fn new() -> FakeEngine {
        FakeEngine {
            params: Rc::new(RefCell::new(None)),
            window: Rc::new(Cell::new((0, 0))),
            inputs: Rc::new(RefCell::new(Vec::new())),
            sent: Rc::new(RefCell::new(Vec::new())),
            recv_units: Rc::new(RefCell::new(VecDeque::new())),
            outstanding: Rc::new(Cell::new(0)),
            pending_output: Rc::new(RefCell::new(VecDeque::new())),
            ack_on_input: Rc::new(Cell::new(false)),
            reject_input: Rc::new(Cell::new(false)),
            reject_send: Rc::new(Cell::new(false)),
            next_deadline: Rc::new(Cell::new(None)),
            interval: Rc::new(Cell::new(Duration::from_millis(40))),
            updates: Rc::new(Cell::new(0)),
            flushes: Rc::new(Cell::new(0)),
        }
    }

    fn emit_pending(&self, out: &mut dyn SegmentSink) {
        while let Some(segment) = self.pending_output.borrow_mut().pop_front() {
            out.emit_segment(&segment);
        }
    }
}

impl ArqEngine for FakeEngine {
    fn configure(&mut self, params: &ProfileParams) {
        *self.params.borrow_mut() = Some(*params);
    }

    fn set_window(&mut self, send_units: u32, recv_units: u32) {
        self.window.set((send_units, recv_units));
    }

    fn input(&mut self, datagram: &[u8], out: &mut dyn SegmentSink) -> anyhow::Result<()> {
        if self.ack_on_input.get() {
            out.emit_segment(&[0u8; 4]);
        }
        if self.reject_input.get() {
            anyhow::bail!("scripted input rejection");
        }
        self.inputs.borrow_mut().push(datagram.to_vec());
        self.recv_units.borrow_mut().push_back(datagram.to_vec());
        Ok(())
    }

    fn send(&mut self, payload: &[u8], out: &mut dyn SegmentSink) -> anyhow::Result<()> {
        if self.reject_send.get() {
            anyhow::bail!("scripted send rejection");
        }
        self.sent.borrow_mut().push(payload.to_vec());
        self.outstanding.set(self.outstanding.get() + 1);
        self.emit_pending(out);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        let unit = self.recv_units.borrow_mut().pop_front()?;
        let n = unit.len().min(buf.len());
        buf[..n].copy_from_slice(&unit[..n]);
        Some(n)
    }

    fn update(&mut self, _now: Instant, out: &mut dyn SegmentSink) {
        self.updates.set(self.updates.get() + 1);
        self.emit_pending(out);
    }

    fn check(&self, now: Instant) -> Instant {
        self.next_deadline.get().unwrap_or(now + self.interval.get())
    }

    fn flush(&mut self, out: &mut dyn SegmentSink) {
        self.flushes.set(self.flushes.get() + 1);
        self.emit_pending(out);
    }

    fn waiting_send_count(&self) -> usize {
        self.outstanding.get()
    }

    fn peek_next_size(&self) -> Option<usize> {
        self.recv_units.borrow().front().map(|unit| unit.len())
    }
}

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}
