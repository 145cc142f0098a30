//! The asynchronous handle representing an in-flight frame.
//!
//! A frame moves `Pending -> Rendering -> FrameOpsRunning -> Finished`, with
//! an orthogonal `Cancelled` terminal state reachable from any non-finished
//! state. Callers block on [`FrameFuture::wait`] for a milestone; the
//! compositor drives the transitions from its worker threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ember_fb::{CancelReason, Error, Result, SyncEvent};

/// Lifecycle state of a render task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Task created, no tiles submitted yet.
    Pending,
    /// At least one tile submitted, compositor awaiting the rest.
    Rendering,
    /// All tiles received, operator chain executing.
    FrameOpsRunning,
    /// Terminal; buffer contents stable and mappable.
    Finished,
    /// Terminal; buffer contents undefined.
    Cancelled(CancelReason),
}

struct State {
    stage: Stage,
    world_rendered: bool,
    frame_finished: bool,
    task_finished: bool,
    duration: Option<f32>,
}

/// Shared future for one frame. Cloned via `Arc` between the caller, the
/// compositor and the render workers.
pub struct FrameFuture {
    state: Mutex<State>,
    cond: Condvar,
    /// Fast-path flag workers poll between tiles without taking the lock.
    cancelled: AtomicBool,
    started: Instant,
    expected_cells: usize,
    received_cells: AtomicUsize,
}

impl FrameFuture {
    pub fn new(expected_cells: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                stage: Stage::Pending,
                world_rendered: false,
                frame_finished: false,
                task_finished: false,
                duration: None,
            }),
            cond: Condvar::new(),
            cancelled: AtomicBool::new(false),
            started: Instant::now(),
            expected_cells,
            received_cells: AtomicUsize::new(0),
        })
    }

    pub fn stage(&self) -> Stage {
        self.state.lock().unwrap().stage
    }

    /// Fraction of expected tile cells received at least once, in `[0, 1]`.
    /// Monotonically non-decreasing while rendering.
    pub fn progress(&self) -> f32 {
        if self.expected_cells == 0 {
            return 1.0;
        }
        let received = self.received_cells.load(Ordering::Acquire);
        (received as f32 / self.expected_cells as f32).min(1.0)
    }

    /// Wall-clock seconds of the finished frame, once finished.
    pub fn duration(&self) -> Option<f32> {
        self.state.lock().unwrap().duration
    }

    /// Request abort. Blocked waiters return immediately; workers stop
    /// submitting; in-flight tile computations finish and are dropped.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::User);
    }

    pub fn cancel_with(&self, reason: CancelReason) {
        let mut state = self.state.lock().unwrap();
        if matches!(state.stage, Stage::Finished | Stage::Cancelled(_)) {
            return;
        }
        state.stage = Stage::Cancelled(reason);
        self.cancelled.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The cancellation error, if the frame was cancelled.
    pub fn error(&self) -> Option<Error> {
        match self.state.lock().unwrap().stage {
            Stage::Cancelled(reason) => Some(Error::Cancelled { reason }),
            _ => None,
        }
    }

    /// Non-blocking milestone query.
    pub fn is_ready(&self, event: SyncEvent) -> bool {
        let state = self.state.lock().unwrap();
        reached(&state, event)
    }

    /// Block until the milestone is reached or the task is cancelled.
    pub fn wait(&self, event: SyncEvent) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if reached(&state, event) {
                return Ok(());
            }
            if let Stage::Cancelled(reason) = state.stage {
                return Err(Error::Cancelled { reason });
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Like [`wait`](Self::wait) with a bound; `Ok(false)` means the bound
    /// expired with the milestone still outstanding.
    pub fn wait_timeout(&self, event: SyncEvent, bound: Duration) -> Result<bool> {
        let deadline = Instant::now() + bound;
        let mut state = self.state.lock().unwrap();
        loop {
            if reached(&state, event) {
                return Ok(true);
            }
            if let Stage::Cancelled(reason) = state.stage {
                return Err(Error::Cancelled { reason });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (next, timeout) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
            if timeout.timed_out() && !reached(&state, event) {
                if let Stage::Cancelled(reason) = state.stage {
                    return Err(Error::Cancelled { reason });
                }
                return Ok(false);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Transitions driven by the compositor

    /// Record one cell received for the first time this frame.
    pub(crate) fn note_cell_received(&self) {
        self.received_cells.fetch_add(1, Ordering::AcqRel);
    }

    /// First tile arrived; the task is now rendering.
    pub(crate) fn mark_rendering(&self) {
        let mut state = self.state.lock().unwrap();
        if state.stage == Stage::Pending {
            state.stage = Stage::Rendering;
        }
    }

    /// Completion barrier reached: every expected cell observed at least
    /// once. The operator chain runs next.
    pub(crate) fn mark_world_rendered(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if matches!(state.stage, Stage::Cancelled(_)) {
            return false;
        }
        state.world_rendered = true;
        state.stage = Stage::FrameOpsRunning;
        self.cond.notify_all();
        true
    }

    /// Operator chain done; the buffer is presentable.
    pub(crate) fn mark_frame_finished(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(state.stage, Stage::Cancelled(_)) {
            return;
        }
        state.frame_finished = true;
        state.stage = Stage::Finished;
        self.cond.notify_all();
    }

    /// Final bookkeeping done.
    pub(crate) fn mark_task_finished(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(state.stage, Stage::Cancelled(_)) {
            return;
        }
        state.task_finished = true;
        state.duration = Some(self.started.elapsed().as_secs_f32());
        self.cond.notify_all();
    }
}

fn reached(state: &State, event: SyncEvent) -> bool {
    match event {
        SyncEvent::WorldRendered => state.world_rendered,
        SyncEvent::FrameFinished => state.frame_finished,
        SyncEvent::TaskFinished => state.task_finished,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_initial_state_is_pending() {
        let future = FrameFuture::new(4);
        assert_eq!(future.stage(), Stage::Pending);
        assert!(!future.is_ready(SyncEvent::FrameFinished));
        assert_eq!(future.progress(), 0.0);
    }

    #[test]
    fn test_milestones_in_order() {
        let future = FrameFuture::new(1);
        future.mark_rendering();
        assert_eq!(future.stage(), Stage::Rendering);

        assert!(future.mark_world_rendered());
        assert!(future.is_ready(SyncEvent::WorldRendered));
        assert!(!future.is_ready(SyncEvent::FrameFinished));
        assert_eq!(future.stage(), Stage::FrameOpsRunning);

        future.mark_frame_finished();
        future.mark_task_finished();
        assert!(future.is_ready(SyncEvent::TaskFinished));
        assert_eq!(future.stage(), Stage::Finished);
        assert!(future.duration().is_some());
    }

    #[test]
    fn test_cancel_unblocks_waiter() {
        let future = FrameFuture::new(4);
        future.mark_rendering();

        let waiter = {
            let future = future.clone();
            thread::spawn(move || future.wait(SyncEvent::TaskFinished))
        };
        thread::sleep(Duration::from_millis(20));
        future.cancel();

        let result = waiter.join().unwrap();
        assert_eq!(
            result,
            Err(Error::Cancelled {
                reason: CancelReason::User
            })
        );
        assert!(future.is_cancelled());
    }

    #[test]
    fn test_timeout_reason_is_distinguished() {
        let future = FrameFuture::new(4);
        future.cancel_with(CancelReason::Timeout);
        assert_eq!(
            future.error(),
            Some(Error::Cancelled {
                reason: CancelReason::Timeout
            })
        );
    }

    #[test]
    fn test_cancel_after_finish_is_a_no_op() {
        let future = FrameFuture::new(0);
        future.mark_world_rendered();
        future.mark_frame_finished();
        future.mark_task_finished();
        future.cancel();
        assert_eq!(future.stage(), Stage::Finished);
        assert!(future.wait(SyncEvent::TaskFinished).is_ok());
    }

    #[test]
    fn test_wait_timeout_expires_without_milestone() {
        let future = FrameFuture::new(4);
        let reached = future
            .wait_timeout(SyncEvent::FrameFinished, Duration::from_millis(30))
            .unwrap();
        assert!(!reached);
    }
}
