//! Ready-set scheduling.
//!
//! A task waits until every input has settled (or one input failed) and is
//! then ready. Ready tasks are handed out lowest submission id first, subject
//! to the advisory memory budget: a weighted task is dispatched when it fits
//! next to the weighted tasks already running, or when none is running.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::engine::task::{Task, TaskId};

/// What a worker should do next.
#[derive(Debug)]
pub enum Next {
    Run(Task),
    /// Cancel every open scope with this label.
    Cancel(String),
    /// Nothing runs, nothing is ready and these tasks still wait: their
    /// inputs can never settle.
    Stalled(Vec<Task>),
    Finished,
}

struct Waiting {
    task: Task,
    missing: usize,
}

#[derive(Default)]
struct State {
    next_id: usize,
    waiting: HashMap<TaskId, Waiting>,
    ready: BTreeMap<TaskId, Task>,
    running: HashMap<TaskId, u64>,
    running_weight: u64,
    cancels: Vec<String>,
    finished: bool,
}

pub struct Scheduler {
    state: Mutex<State>,
    wake: Condvar,
    budget_mb: u64,
}

impl Scheduler {
    pub fn new(budget_mb: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            budget_mb,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a task and return its id. The task waits for one
    /// [`Scheduler::input_settled`] call per input.
    pub fn submit(&self, mut task: Task) -> TaskId {
        let mut state = self.lock();
        let id = TaskId(state.next_id);
        state.next_id += 1;
        task.id = id;
        debug!(task = %id, label = %task.label, inputs = task.inputs.len(), "submitted");
        if task.inputs.is_empty() {
            state.ready.insert(id, task);
            drop(state);
            self.wake.notify_one();
        } else {
            let missing = task.inputs.len();
            state.waiting.insert(id, Waiting { task, missing });
        }
        id
    }

    /// One input of `id` settled. A failed input makes the task ready at
    /// once so the failure propagates without waiting for the rest.
    pub fn input_settled(&self, id: TaskId, failed: bool) {
        let mut state = self.lock();
        let Some(waiting) = state.waiting.get_mut(&id) else {
            return;
        };
        waiting.missing = waiting.missing.saturating_sub(1);
        if waiting.missing > 0 && !failed {
            return;
        }
        if let Some(waiting) = state.waiting.remove(&id) {
            state.ready.insert(id, waiting.task);
            drop(state);
            self.wake.notify_one();
        }
    }

    /// Ask a worker to cancel the scopes labelled `label`.
    pub fn request_cancel(&self, label: impl Into<String>) {
        self.lock().cancels.push(label.into());
        self.wake.notify_one();
    }

    /// Block until there is work, a cancellation, a stall or the end of the
    /// run.
    pub fn next(&self) -> Next {
        let mut state = self.lock();
        loop {
            if state.finished {
                return Next::Finished;
            }
            if !state.cancels.is_empty() {
                return Next::Cancel(state.cancels.remove(0));
            }
            let budget = self.budget_mb;
            let running_weight = state.running_weight;
            let pick = state
                .ready
                .values()
                .find(|task| {
                    task.weight_mb == 0
                        || running_weight == 0
                        || running_weight.saturating_add(task.weight_mb) <= budget
                })
                .map(|task| task.id);
            if let Some(id) = pick
                && let Some(task) = state.ready.remove(&id)
            {
                state.running.insert(id, task.weight_mb);
                state.running_weight = state.running_weight.saturating_add(task.weight_mb);
                return Next::Run(task);
            }
            if state.running.is_empty() && state.ready.is_empty() {
                if state.waiting.is_empty() {
                    return Next::Finished;
                }
                let mut stalled: Vec<Task> =
                    state.waiting.drain().map(|(_, waiting)| waiting.task).collect();
                stalled.sort_by_key(|task| task.id);
                warn!(count = stalled.len(), "no runnable task left; failing waiters");
                return Next::Stalled(stalled);
            }
            state = self
                .wake
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// A task handed out by [`Scheduler::next`] is done.
    pub fn complete(&self, id: TaskId) {
        let mut state = self.lock();
        if let Some(weight) = state.running.remove(&id) {
            state.running_weight = state.running_weight.saturating_sub(weight);
        }
        drop(state);
        self.wake.notify_all();
    }

    /// Remove queued tasks matching `predicate`; running tasks are untouched.
    pub fn cancel_where(&self, predicate: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let waiting: Vec<TaskId> = state
            .waiting
            .iter()
            .filter(|(_, waiting)| predicate(&waiting.task))
            .map(|(id, _)| *id)
            .collect();
        let ready: Vec<TaskId> = state
            .ready
            .values()
            .filter(|task| predicate(task))
            .map(|task| task.id)
            .collect();
        let mut removed: Vec<Task> = waiting
            .into_iter()
            .filter_map(|id| state.waiting.remove(&id).map(|w| w.task))
            .collect();
        removed.extend(ready.into_iter().filter_map(|id| state.ready.remove(&id)));
        removed.sort_by_key(|task| task.id);
        drop(guard);
        self.wake.notify_all();
        removed
    }

    /// End the run; every blocked worker returns [`Next::Finished`].
    pub fn finish(&self) {
        self.lock().finished = true;
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::{Operand, VarId};
    use crate::engine::scope::Scope;
    use crate::engine::task::TaskKind;

    fn task(label: &str, inputs: &[usize], weight_mb: u64) -> Task {
        let mut task = Task::new(label, Scope::root(), TaskKind::Trace {
            args: vec![Operand::Var(VarId(0))],
        })
        .with_inputs(inputs.iter().map(|i| VarId(*i)));
        task.weight_mb = weight_mb;
        task
    }

    fn run(next: Next) -> Task {
        match next {
            Next::Run(task) => task,
            other => panic!("expected a runnable task, got {other:?}"),
        }
    }

    #[test]
    fn ready_tasks_dispatch_in_submission_order() {
        let scheduler = Scheduler::new(1024);
        let late = scheduler.submit(task("late", &[1], 0));
        let early = scheduler.submit(task("early", &[], 0));
        scheduler.input_settled(late, false);
        assert_eq!(run(scheduler.next()).id, late);
        assert_eq!(run(scheduler.next()).id, early);
    }

    #[test]
    fn task_waits_for_every_input_unless_one_fails() {
        let scheduler = Scheduler::new(1024);
        let both = scheduler.submit(task("both", &[1, 2], 0));
        let failing = scheduler.submit(task("failing", &[3, 4], 0));
        scheduler.input_settled(both, false);
        scheduler.input_settled(failing, true);
        assert_eq!(run(scheduler.next()).id, failing);
        scheduler.input_settled(both, false);
        assert_eq!(run(scheduler.next()).id, both);
    }

    #[test]
    fn heavy_tasks_respect_the_budget() {
        let scheduler = Scheduler::new(4096);
        let first = scheduler.submit(task("goby-1", &[], 3072));
        let second = scheduler.submit(task("goby-2", &[], 3072));
        let light = scheduler.submit(task("trace", &[], 0));
        assert_eq!(run(scheduler.next()).id, first);
        // The second heavy task does not fit next to the first.
        assert_eq!(run(scheduler.next()).id, light);
        scheduler.complete(first);
        assert_eq!(run(scheduler.next()).id, second);
    }

    #[test]
    fn oversized_task_runs_alone() {
        let scheduler = Scheduler::new(1024);
        let big = scheduler.submit(task("big", &[], 8192));
        assert_eq!(run(scheduler.next()).id, big);
    }

    #[test]
    fn cancel_keeps_tasks_the_predicate_skips() {
        let scheduler = Scheduler::new(1024);
        let keep = scheduler.submit(task("keep", &[], 0));
        let drop_waiting = scheduler.submit(task("drop-waiting", &[1], 0));
        let drop_ready = scheduler.submit(task("drop-ready", &[], 0));
        let removed = scheduler.cancel_where(|task| task.label.starts_with("drop"));
        let ids: Vec<TaskId> = removed.iter().map(|task| task.id).collect();
        assert_eq!(ids, vec![drop_waiting, drop_ready]);
        assert_eq!(run(scheduler.next()).id, keep);
    }

    #[test]
    fn huge_weights_do_not_overflow_the_running_total() {
        let scheduler = Scheduler::new(1024);
        let first = scheduler.submit(task("huge", &[], u64::MAX));
        let second = scheduler.submit(task("also-huge", &[], u64::MAX));
        let light = scheduler.submit(task("light", &[], 0));
        assert_eq!(run(scheduler.next()).id, first);
        assert_eq!(run(scheduler.next()).id, light);
        scheduler.complete(first);
        assert_eq!(run(scheduler.next()).id, second);
    }

    #[test]
    fn cancel_requests_come_before_ready_work() {
        let scheduler = Scheduler::new(1024);
        let ready = scheduler.submit(task("ready", &[], 0));
        scheduler.request_cancel("sample[1]");
        match scheduler.next() {
            Next::Cancel(label) => assert_eq!(label, "sample[1]"),
            other => panic!("expected a cancellation, got {other:?}"),
        }
        assert_eq!(run(scheduler.next()).id, ready);
    }

    #[test]
    fn waiting_without_running_work_is_a_stall() {
        let scheduler = Scheduler::new(1024);
        let orphan = scheduler.submit(task("orphan", &[7], 0));
        match scheduler.next() {
            Next::Stalled(tasks) => assert_eq!(tasks[0].id, orphan),
            other => panic!("expected a stall, got {other:?}"),
        }
    }

    #[test]
    fn cancel_removes_queued_tasks_and_finish_wakes_workers() {
        let scheduler = Scheduler::new(1024);
        scheduler.submit(task("a", &[1], 0));
        scheduler.submit(task("b", &[], 0));
        let removed = scheduler.cancel_where(|_| true);
        assert_eq!(removed.len(), 2);
        assert!(removed[0].id < removed[1].id);
        scheduler.finish();
        assert!(matches!(scheduler.next(), Next::Finished));
    }
}
