//! Benchmark runner: warm-up, the exact-runs and adaptive loops, round
//! suspension and progress publication.

use crate::bench::{BenchData, BenchParams};
use crate::policy::{RunState, StopPolicy};
use crate::progress::ProgressRecord;
use crate::rng::clock;
use crate::sampler;

/// How one `run_bench` call ended. A suspended benchmark goes back to the
/// queue and resumes (possibly on another worker) where it left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    Suspended,
}

/// The three loop policies of a session plus the PMC switch; immutable for
/// the whole run.
#[derive(Debug, Clone, Copy)]
pub struct RunPlan {
    pub bench: StopPolicy,
    pub warmup: StopPolicy,
    pub round: StopPolicy,
    pub pmc: bool,
}

/// Executes `params` until its policy is satisfied or the round expires.
///
/// `should_suspend` is consulted once the round predicate fires; the
/// scheduler answers false when there is no other task worth switching to,
/// in which case this benchmark runs to completion here.
pub fn run_bench(
    params: &BenchParams,
    data: &mut BenchData,
    plan: &RunPlan,
    progress: Option<&ProgressRecord>,
    should_suspend: &mut dyn FnMut() -> bool,
) -> anyhow::Result<RunOutcome> {
    if !data.warmup_done {
        warmup(params, data, plan.warmup)?;
        data.warmup_done = true;
    }

    let outcome = if plan.bench.exact_runs > 0 {
        run_exact(params, data, plan, progress, should_suspend)?
    } else {
        run_adaptive(params, data, plan, progress, should_suspend)?
    };

    if outcome == RunOutcome::Finished {
        sampler::run_custom_measurements(params, data)?;
    }
    Ok(outcome)
}

/// Warm-up loop: same predicate machinery, results discarded, output forced
/// to /dev/null.
fn warmup(params: &BenchParams, data: &mut BenchData, policy: StopPolicy) -> anyhow::Result<()> {
    if !policy.enabled() {
        return Ok(());
    }
    let mut state = RunState::new(clock(), policy, 0, 0.0);
    loop {
        sampler::collect_sample(params, data, true, false)?;
        if state.should_finish(clock()) {
            return Ok(());
        }
    }
}

fn run_exact(
    params: &BenchParams,
    data: &mut BenchData,
    plan: &RunPlan,
    progress: Option<&ProgressRecord>,
    should_suspend: &mut dyn FnMut() -> bool,
) -> anyhow::Result<RunOutcome> {
    let start = clock();
    let total = plan.bench.exact_runs;
    let mut round = RunState::new(start, plan.round, 0, 0.0);

    while (data.run_count as i32) < total {
        sampler::collect_sample(params, data, false, plan.pmc)?;
        let now = clock();
        publish_exact(progress, data, total, now - start);
        if (data.run_count as i32) < total && round.should_finish(now) && should_suspend() {
            data.time_run += now - start;
            return Ok(RunOutcome::Suspended);
        }
    }
    data.time_run += clock() - start;
    Ok(RunOutcome::Finished)
}

fn run_adaptive(
    params: &BenchParams,
    data: &mut BenchData,
    plan: &RunPlan,
    progress: Option<&ProgressRecord>,
    should_suspend: &mut dyn FnMut() -> bool,
) -> anyhow::Result<RunOutcome> {
    let start = clock();
    let mut state = RunState::new(start, plan.bench, data.run_count as i32, data.time_run);
    let mut round = RunState::new(start, plan.round, 0, 0.0);

    // Batch size grows by 5% per outer iteration so long benchmarks check
    // the predicates less and less often.
    let mut niter = 1usize;
    let mut niter_accum = 1.0f64;
    let mut finish = false;

    loop {
        for _ in 0..niter {
            sampler::collect_sample(params, data, false, plan.pmc)?;
            let now = clock();
            finish = state.should_finish(now);
            publish_adaptive(progress, data, plan.bench.time_limit, start, now);
            if !finish && round.should_finish(now) && should_suspend() {
                data.time_run += now - start;
                return Ok(RunOutcome::Suspended);
            }
        }
        if finish {
            break;
        }
        while niter_accum.floor() as usize == niter {
            niter_accum *= 1.05;
        }
        niter = niter_accum.floor() as usize;
    }
    data.time_run += clock() - start;
    Ok(RunOutcome::Finished)
}

fn publish_exact(progress: Option<&ProgressRecord>, data: &BenchData, total: i32, elapsed: f64) {
    if let Some(record) = progress {
        let percent = data.run_count as f64 / total as f64 * 100.0;
        record.publish(percent, data.run_count as f64, data.time_run + elapsed);
    }
}

fn publish_adaptive(
    progress: Option<&ProgressRecord>,
    data: &BenchData,
    time_limit: f64,
    start: f64,
    now: f64,
) {
    if let Some(record) = progress {
        let elapsed = data.time_run + (now - start);
        let percent = if time_limit > 0.0 {
            (elapsed / time_limit * 100.0).min(100.0)
        } else {
            0.0
        };
        record.publish(percent, elapsed, elapsed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bench::{InputPolicy, OutputPolicy};
    use crate::meas::default_meas_list;
    use crate::process::ExecSpec;

    fn params(cmd: &str) -> BenchParams {
        BenchParams {
            name: String::from(cmd),
            exec: ExecSpec::Shell {
                shell: vec![String::from("/bin/sh")],
                cmd: String::from(cmd),
            },
            prepare: None,
            input: InputPolicy::Null,
            output: OutputPolicy::Null,
            meas: default_meas_list(),
            ignore_failure: false,
            shell: vec![String::from("/bin/sh")],
        }
    }

    fn no_rounds() -> StopPolicy {
        StopPolicy {
            time_limit: -1.0,
            min_runs: i32::MAX,
            max_runs: 0,
            exact_runs: 0,
        }
    }

    #[test]
    fn exact_runs_collects_exactly_that_many() {
        let p = params("true");
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        let plan = RunPlan {
            bench: StopPolicy::exact(7),
            warmup: StopPolicy::disabled(),
            round: no_rounds(),
            pmc: false,
        };
        let outcome = run_bench(&p, &mut data, &plan, None, &mut || false).unwrap();
        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(data.run_count, 7);
        assert_eq!(data.exit_codes.len(), 7);
    }

    #[test]
    fn adaptive_respects_min_and_max_runs() {
        let p = params("true");
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        let plan = RunPlan {
            bench: StopPolicy {
                time_limit: 0.0001,
                min_runs: 3,
                max_runs: 50,
                exact_runs: 0,
            },
            warmup: StopPolicy::disabled(),
            round: no_rounds(),
            pmc: false,
        };
        run_bench(&p, &mut data, &plan, None, &mut || false).unwrap();
        assert!(data.run_count >= 3);
        assert!(data.run_count <= 50);
    }

    #[test]
    fn round_yield_suspends_and_resumes() {
        let p = params("true");
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        let plan = RunPlan {
            bench: StopPolicy::exact(6),
            warmup: StopPolicy::disabled(),
            // Round fires after every 2 runs.
            round: StopPolicy::exact(2),
            pmc: false,
        };
        let outcome = run_bench(&p, &mut data, &plan, None, &mut || true).unwrap();
        assert_eq!(outcome, RunOutcome::Suspended);
        assert_eq!(data.run_count, 2);
        assert!(data.warmup_done);

        // Second and third rounds complete the benchmark.
        let outcome = run_bench(&p, &mut data, &plan, None, &mut || true).unwrap();
        assert_eq!(outcome, RunOutcome::Suspended);
        let outcome = run_bench(&p, &mut data, &plan, None, &mut || true).unwrap();
        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(data.run_count, 6);
    }

    #[test]
    fn declined_suspension_runs_to_completion() {
        let p = params("true");
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        let plan = RunPlan {
            bench: StopPolicy::exact(5),
            warmup: StopPolicy::disabled(),
            round: StopPolicy::exact(1),
            pmc: false,
        };
        // Scheduler says there is nothing to switch to.
        let outcome = run_bench(&p, &mut data, &plan, None, &mut || false).unwrap();
        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(data.run_count, 5);
    }

    #[test]
    fn warmup_runs_once_across_resumptions() {
        let p = params("true");
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        let plan = RunPlan {
            bench: StopPolicy::exact(4),
            warmup: StopPolicy::exact(2),
            round: StopPolicy::exact(2),
            pmc: false,
        };
        run_bench(&p, &mut data, &plan, None, &mut || true).unwrap();
        assert!(data.warmup_done);
        // Warm-up samples were discarded.
        assert_eq!(data.run_count, 2);
        run_bench(&p, &mut data, &plan, None, &mut || true).unwrap();
        assert_eq!(data.run_count, 4);
    }

    #[test]
    fn failing_bench_propagates_error() {
        let p = params("exit 3");
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        let plan = RunPlan {
            bench: StopPolicy::exact(2),
            warmup: StopPolicy::disabled(),
            round: no_rounds(),
            pmc: false,
        };
        let err = run_bench(&p, &mut data, &plan, None, &mut || false).unwrap_err();
        assert!(err.to_string().contains("code 3"));
    }
}
