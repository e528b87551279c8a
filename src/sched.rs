//! Cooperative randomized scheduler: N benchmarks on up to `jobs` worker
//! threads, with round-based suspension so siblings share the CPU instead
//! of one benchmark monopolizing a core for seconds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossterm::style::Stylize;

use crate::analyze::{analyze_benchmark, BenchAnalysis};
use crate::bench::{BenchData, BenchParams};
use crate::progress::{reporter_loop, Progress};
use crate::rng::with_thread_rng;
use crate::runner::{run_bench, RunOutcome, RunPlan};

/// One schedulable benchmark. The data and analysis slots are only ever
/// touched by the worker currently holding the task's `taken` bit.
pub struct Task {
    pub params: BenchParams,
    pub data: Mutex<BenchData>,
    pub analysis: Mutex<Option<BenchAnalysis>>,
}

impl Task {
    pub fn new(params: BenchParams) -> std::io::Result<Self> {
        let data = BenchData::new(params.meas.len(), params.has_custom())?;
        Ok(Task {
            params,
            data: Mutex::new(data),
            analysis: Mutex::new(None),
        })
    }
}

struct QueueState {
    taken: Vec<bool>,
    finished: Vec<bool>,
    remaining: usize,
}

/// Mutex-guarded task queue. Scans start at a random index so concurrent
/// workers spread over the tasks instead of piling onto the lowest one.
pub struct TaskQueue {
    pub tasks: Vec<Task>,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new(tasks: Vec<Task>) -> Self {
        let n = tasks.len();
        TaskQueue {
            tasks,
            state: Mutex::new(QueueState {
                taken: vec![false; n],
                finished: vec![false; n],
                remaining: n,
            }),
        }
    }

    /// Claims the first free unfinished task scanning from a random start;
    /// `None` once everything is finished or claimed elsewhere.
    pub fn get_task(&self) -> Option<usize> {
        let n = self.tasks.len();
        let start = with_thread_rng(|rng| rng.below(n));
        let mut state = self.state.lock().unwrap();
        if state.remaining == 0 {
            return None;
        }
        for off in 0..n {
            let idx = (start + off) % n;
            if !state.taken[idx] && !state.finished[idx] {
                state.taken[idx] = true;
                return Some(idx);
            }
        }
        None
    }

    /// Returns a suspended task to the queue.
    pub fn yield_task(&self, idx: usize) {
        let mut state = self.state.lock().unwrap();
        state.taken[idx] = false;
    }

    pub fn finish(&self, idx: usize) {
        let mut state = self.state.lock().unwrap();
        state.taken[idx] = false;
        state.finished[idx] = true;
        state.remaining -= 1;
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().unwrap().remaining
    }

    /// Consumes the queue after the session ended.
    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    /// Suspending only pays off while more tasks remain than workers;
    /// otherwise every unfinished task already has a worker.
    pub fn should_i_suspend(&self, worker_count: usize) -> bool {
        worker_count < self.remaining()
    }

    #[cfg(test)]
    fn is_taken(&self, idx: usize) -> bool {
        self.state.lock().unwrap().taken[idx]
    }
}

/// Immutable session context shared by all workers.
pub struct Session<'a> {
    pub queue: &'a TaskQueue,
    pub plan: RunPlan,
    pub nresamp: usize,
    pub worker_count: usize,
    pub progress: Option<&'a Progress>,
    pub colored: bool,
}

/// Runs the whole queue on `worker_count` threads (plus the reporter when a
/// progress bar is attached). Returns an error if any benchmark failed;
/// siblings still run to completion.
pub fn run_session(session: &Session) -> anyhow::Result<()> {
    let failed = AtomicBool::new(false);
    let stop_reporter = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let reporter = session.progress.map(|progress| {
            let stop = &stop_reporter;
            scope.spawn(move || {
                let mut err = std::io::stderr();
                reporter_loop(progress, stop, &mut err);
            })
        });

        let mut workers = Vec::with_capacity(session.worker_count);
        for worker_id in 0..session.worker_count {
            let failed = &failed;
            workers.push(scope.spawn(move || worker_loop(session, worker_id, failed)));
        }
        for worker in workers {
            let _ = worker.join();
        }

        stop_reporter.store(true, Ordering::Release);
        if let Some(handle) = reporter {
            let _ = handle.join();
        }
    });

    anyhow::ensure!(!failed.load(Ordering::Acquire), "benchmark session failed");
    Ok(())
}

fn worker_loop(session: &Session, worker_id: usize, failed: &AtomicBool) {
    let queue = session.queue;
    while let Some(idx) = queue.get_task() {
        let task = &queue.tasks[idx];
        let record = session.progress.map(|p| &p.records[idx]);
        if let Some(r) = record {
            r.mark_started(worker_id);
        }

        let mut data = task.data.lock().unwrap();
        // Once suspension is declined the task owns this worker until it
        // completes; re-checking the queue would only add lock traffic.
        let mut run_to_completion = false;
        let mut should_suspend = || {
            if run_to_completion {
                false
            } else if queue.should_i_suspend(session.worker_count) {
                true
            } else {
                run_to_completion = true;
                false
            }
        };

        let outcome = run_bench(
            &task.params,
            &mut data,
            &session.plan,
            record,
            &mut should_suspend,
        )
        .and_then(|outcome| {
            if outcome == RunOutcome::Finished {
                let analysis = analyze_benchmark(&task.params, &data, session.nresamp)?;
                *task.analysis.lock().unwrap() = Some(analysis);
            }
            Ok(outcome)
        });
        drop(data);

        match outcome {
            Ok(RunOutcome::Finished) => {
                queue.finish(idx);
                if let Some(r) = record {
                    r.mark_finished();
                }
            }
            Ok(RunOutcome::Suspended) => {
                queue.yield_task(idx);
            }
            Err(err) => {
                report_worker_error(session, worker_id, record.map(|_| idx), &err);
                queue.finish(idx);
                failed.store(true, Ordering::Release);
                // The worker exits; peers keep running their benchmarks.
                return;
            }
        }
    }
}

/// With the bar on, error text lands in the worker's output anchor and is
/// drawn into the benchmark's row; otherwise it goes straight to stderr.
fn report_worker_error(
    session: &Session,
    worker_id: usize,
    bench_idx: Option<usize>,
    err: &anyhow::Error,
) {
    match (session.progress, bench_idx) {
        (Some(progress), Some(idx)) => {
            progress.set_anchor(worker_id, format!("error: {err:#}"));
            progress.records[idx].mark_aborted();
        }
        _ => {
            if session.colored {
                eprintln!("{} {err:#}", "error:".red().bold());
            } else {
                eprintln!("error: {err:#}");
            }
        }
    }
}
