//! This file provides application flow.

use std::io::Write;

use crossterm::style::Stylize;

use crate::analyze::{analyze_benchmark, analyze_meas, BenchAnalysis, MeasAnalysis, SessionView};
use crate::bench::{BenchData, BenchParams};
use crate::config::{self, Config, Mode, SessionSetup};
use crate::export;
use crate::perf_cnt;
use crate::progress::{Progress, ProgressMode};
use crate::report::{warning, Report};
use crate::runner::RunPlan;
use crate::sched::{self, Session, Task, TaskQueue};

/// The application is started and terminated.
pub fn run() -> proc_exit::ExitResult {
    let cli = crate::cli_args::parse();
    let mut colored = atty::is(atty::Stream::Stderr);
    match execute(&cli, &mut colored) {
        Ok(()) => Ok(()),
        Err(err) => {
            if colored {
                eprintln!("{} {err:#}", "error:".red().bold());
            } else {
                eprintln!("error: {err:#}");
            }
            Err(proc_exit::Exit::new(proc_exit::Code::FAILURE))
        }
    }
}

fn execute(cli: &crate::cli_args::CliArgs, colored: &mut bool) -> anyhow::Result<()> {
    let setup = config::build(cli)?;
    *colored = setup.config.colored;
    match setup.config.mode.clone() {
        Mode::Load(dir) => run_load(&setup.config, &dir),
        Mode::Run => run_benchmarks(setup),
    }
}

fn run_benchmarks(setup: SessionSetup) -> anyhow::Result<()> {
    let SessionSetup {
        config,
        benches,
        var,
        groups,
    } = setup;

    let pmc = config.pmc_requested();
    let pmc_available = perf_cnt::init_perf();
    if pmc {
        anyhow::ensure!(
            pmc_available,
            "performance counters are unavailable on this system; \
             remove the cycles/instructions/branches measurements"
        );
    } else if !pmc_available {
        warning(
            config.colored,
            "performance counters are unavailable; the cycles, instructions \
             and branch measurements would be refused",
        );
    }

    let mut tasks = Vec::with_capacity(benches.len());
    for params in &benches {
        tasks.push(Task::new(params.clone())?);
    }
    let queue = TaskQueue::new(tasks);

    let plan = RunPlan {
        bench: config.bench_policy,
        warmup: config.warmup_policy,
        round: config.round_policy,
        pmc,
    };
    let progress = if config.progress_bar {
        let mode = if config.bench_policy.exact_runs > 0 {
            ProgressMode::ExactRuns(config.bench_policy.exact_runs as u64)
        } else {
            ProgressMode::TimeLimit(config.bench_policy.time_limit)
        };
        let names = benches.iter().map(|b| b.name.clone()).collect();
        Some(Progress::new(names, mode, config.jobs, config.colored))
    } else {
        None
    };

    let session = Session {
        queue: &queue,
        plan,
        nresamp: config.nresamp,
        worker_count: config.jobs,
        progress: progress.as_ref(),
        colored: config.colored,
    };
    sched::run_session(&session)?;

    let (params, data, analyses) = collect_results(queue)?;
    let view = SessionView {
        params: &params,
        data: &data,
        analyses: &analyses,
        var: var.as_ref(),
        groups: &groups,
    };
    let bundles = compute_bundles(&config, &view);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    Report {
        view: &view,
        bundles: &bundles,
        colored: config.colored,
    }
    .print(&mut out)?;
    out.flush()?;

    if let Some(path) = &config.json {
        export::write_json(path, &config, &params, &data)?;
    }
    if config.csv {
        export::prepare_out_dir(&config.out_dir)?;
        export::write_csv_artifacts(
            &config.out_dir,
            &params,
            &data,
            &analyses,
            var.as_ref(),
            &groups,
        )?;
    }
    Ok(())
}

fn run_load(config: &Config, dir: &std::path::Path) -> anyhow::Result<()> {
    let (params, data) = export::load_dir(dir)?;
    let mut analyses = Vec::with_capacity(params.len());
    for (p, d) in params.iter().zip(&data) {
        analyses.push(analyze_benchmark(p, d, config.nresamp)?);
    }

    let view = SessionView {
        params: &params,
        data: &data,
        analyses: &analyses,
        var: None,
        groups: &[],
    };
    let bundles = compute_bundles(config, &view);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    Report {
        view: &view,
        bundles: &bundles,
        colored: config.colored,
    }
    .print(&mut out)?;
    out.flush()?;

    if let Some(path) = &config.json {
        export::write_json(path, config, &params, &data)?;
    }
    if config.csv {
        warning(config.colored, "--csv is ignored in load mode");
    }
    Ok(())
}

/// One analysis bundle per primary measurement (secondaries only annotate
/// their primary and get no comparison of their own).
fn compute_bundles(config: &Config, view: &SessionView) -> Vec<MeasAnalysis> {
    view.params[0]
        .meas
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.is_secondary())
        .map(|(idx, _)| analyze_meas(view, idx, config.baseline, config.sort, config.nresamp))
        .collect()
}

fn collect_results(
    queue: TaskQueue,
) -> anyhow::Result<(Vec<BenchParams>, Vec<BenchData>, Vec<BenchAnalysis>)> {
    let mut params = Vec::new();
    let mut data = Vec::new();
    let mut analyses = Vec::new();
    for task in queue.into_tasks() {
        let bench_data = task
            .data
            .into_inner()
            .map_err(|_| anyhow::anyhow!("benchmark state poisoned"))?;
        let analysis = task
            .analysis
            .into_inner()
            .map_err(|_| anyhow::anyhow!("benchmark state poisoned"))?
            .ok_or_else(|| anyhow::anyhow!("benchmark `{}` was not analyzed", task.params.name))?;
        params.push(task.params);
        data.push(bench_data);
        analyses.push(analysis);
    }
    Ok((params, data, analyses))
}

