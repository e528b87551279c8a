//! Session configuration: one immutable record built from the CLI and
//! shared read-only by every worker, plus the benchmark list derived from
//! the commands and the (optional) parameter variable.

use std::path::PathBuf;

use crate::analyze::SortMode;
use crate::bench::{BenchGroup, BenchParams, BenchVar, InputPolicy, OutputPolicy};
use crate::cli_args::{parse_duration, parse_scan, parse_scanl, CliArgs};
use crate::meas::{default_meas_list, MeasKind, MeasSpec, Units};
use crate::policy::StopPolicy;
use crate::process::ExecSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Run,
    /// Re-analyze the CSV artifacts of a previous invocation.
    Load(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub bench_policy: StopPolicy,
    pub warmup_policy: StopPolicy,
    pub round_policy: StopPolicy,
    pub nresamp: usize,
    pub jobs: usize,
    pub meas: Vec<MeasSpec>,
    pub baseline: Option<usize>,
    pub sort: SortMode,
    pub colored: bool,
    pub progress_bar: bool,
    pub json: Option<PathBuf>,
    pub csv: bool,
    pub out_dir: PathBuf,
}

impl Config {
    pub fn pmc_requested(&self) -> bool {
        self.meas.iter().any(|m| m.kind.is_pmc())
    }
}

/// Everything the application needs to run one session.
#[derive(Debug)]
pub struct SessionSetup {
    pub config: Config,
    pub benches: Vec<BenchParams>,
    pub var: Option<BenchVar>,
    pub groups: Vec<BenchGroup>,
}

pub fn build(cli: &CliArgs) -> anyhow::Result<SessionSetup> {
    let (mode, commands) = split_mode(cli)?;

    let bench_policy = bench_policy(cli)?;
    let warmup_policy = warmup_policy(cli)?;
    let round_policy = round_policy(cli)?;
    let meas = meas_list(cli)?;
    let var = variable(cli)?;

    let shell = shell_tokens(cli);
    let base_input = base_input(cli)?;
    let output = match cli.output.as_str() {
        "null" => OutputPolicy::Null,
        "inherit" => OutputPolicy::Inherit,
        other => anyhow::bail!("invalid --output `{other}`, expected null or inherit"),
    };

    let (mut benches, groups) = expand_benches(
        cli,
        &commands,
        var.as_ref(),
        &meas,
        &shell,
        &base_input,
        output,
    )?;
    apply_renames(cli, &mut benches)?;

    if mode == Mode::Run {
        anyhow::ensure!(!benches.is_empty(), "no commands to benchmark");
    }

    let baseline = baseline(cli, &benches)?;
    let sort = SortMode::parse(&cli.sort)
        .ok_or_else(|| anyhow::anyhow!("invalid --sort `{}`", cli.sort))?;
    let colored = tristate(&cli.color, "--color", || atty::is(atty::Stream::Stdout))?;
    let progress_bar = tristate(&cli.progress_bar, "--progress-bar", || {
        atty::is(atty::Stream::Stderr) && atty::is(atty::Stream::Stdout)
    })?;

    let (jobs, clamped) = resolve_jobs(cli.jobs, benches.len())?;
    if clamped {
        crate::report::warning(
            colored,
            &format!(
                "--jobs {} exceeds the number of benchmarks; running {jobs} workers",
                cli.jobs.unwrap_or(jobs)
            ),
        );
    }
    anyhow::ensure!(cli.nrs > 0, "--nrs must be at least 1");

    Ok(SessionSetup {
        config: Config {
            mode,
            bench_policy,
            warmup_policy,
            round_policy,
            nresamp: cli.nrs,
            jobs,
            meas,
            baseline,
            sort,
            colored,
            progress_bar,
            json: cli.json.clone(),
            csv: cli.csv,
            out_dir: cli.out_dir.clone(),
        },
        benches,
        var,
        groups,
    })
}

fn split_mode(cli: &CliArgs) -> anyhow::Result<(Mode, Vec<String>)> {
    match cli.commands.split_first() {
        Some((first, rest)) if first == "load" => {
            anyhow::ensure!(
                rest.len() <= 1,
                "`load` takes at most one directory argument"
            );
            let dir = rest
                .first()
                .map(PathBuf::from)
                .unwrap_or_else(|| cli.out_dir.clone());
            Ok((Mode::Load(dir), Vec::new()))
        }
        _ => Ok((Mode::Run, cli.commands.clone())),
    }
}

fn bench_policy(cli: &CliArgs) -> anyhow::Result<StopPolicy> {
    let mut policy = StopPolicy {
        time_limit: 5.0,
        min_runs: 0,
        max_runs: 0,
        exact_runs: 0,
    };
    if let Some(t) = &cli.time_limit {
        policy.time_limit = parse_duration(t)?;
    }
    if let Some(runs) = cli.runs {
        anyhow::ensure!(runs > 0, "--runs must be positive");
        policy.exact_runs = runs;
    }
    if let Some(min) = cli.min_runs {
        anyhow::ensure!(min > 0, "--min-runs must be positive");
        policy.min_runs = min;
    }
    if let Some(max) = cli.max_runs {
        anyhow::ensure!(max > 0, "--max-runs must be positive");
        policy.max_runs = max;
    }
    if policy.min_runs > 0 && policy.max_runs > 0 {
        anyhow::ensure!(
            policy.min_runs <= policy.max_runs,
            "--min-runs exceeds --max-runs"
        );
    }
    Ok(policy)
}

fn warmup_policy(cli: &CliArgs) -> anyhow::Result<StopPolicy> {
    let mut policy = StopPolicy {
        time_limit: 0.1,
        min_runs: 0,
        max_runs: 0,
        exact_runs: 0,
    };
    if let Some(t) = &cli.warmup {
        policy.time_limit = parse_duration(t)?;
    }
    if let Some(runs) = cli.warmup_runs {
        anyhow::ensure!(runs > 0, "--warmup-runs must be positive");
        policy.exact_runs = runs;
    }
    if let Some(min) = cli.min_warmup_runs {
        policy.min_runs = min;
    }
    if let Some(max) = cli.max_warmup_runs {
        policy.max_runs = max;
    }
    if cli.no_warmup {
        // The "off" sentinel: a negative time limit disables the loop.
        policy = StopPolicy {
            time_limit: -1.0,
            min_runs: 0,
            max_runs: 0,
            exact_runs: 0,
        };
    }
    Ok(policy)
}

fn round_policy(cli: &CliArgs) -> anyhow::Result<StopPolicy> {
    let mut policy = StopPolicy {
        time_limit: 5.0,
        min_runs: 0,
        max_runs: 0,
        exact_runs: 0,
    };
    if let Some(t) = &cli.round_time {
        policy.time_limit = parse_duration(t)?;
    }
    if let Some(runs) = cli.round_runs {
        anyhow::ensure!(runs > 0, "--round-runs must be positive");
        policy.exact_runs = runs;
    }
    if let Some(min) = cli.min_round_runs {
        policy.min_runs = min;
    }
    if let Some(max) = cli.max_round_runs {
        policy.max_runs = max;
    }
    if cli.no_rounds {
        // min_runs = i32::MAX keeps the round predicate from ever firing.
        policy.min_runs = i32::MAX;
    }
    Ok(policy)
}

fn meas_list(cli: &CliArgs) -> anyhow::Result<Vec<MeasSpec>> {
    let mut list = if cli.no_default_meas {
        Vec::new()
    } else {
        default_meas_list()
    };

    if let Some(tokens) = &cli.meas {
        for token in tokens.split(',') {
            let token = token.trim();
            let kind = MeasKind::from_token(token)
                .ok_or_else(|| anyhow::anyhow!("unknown measurement `{token}`"))?;
            if list.iter().any(|m| m.kind == kind) {
                continue;
            }
            list.push(MeasSpec::builtin(kind));
        }
    }

    for name in &cli.custom {
        list.push(MeasSpec::custom(name, Units::None, "cat"));
    }
    for pair in cli.custom_t.chunks(2) {
        list.push(MeasSpec::custom(&pair[0], Units::None, &pair[1]));
    }
    for triple in cli.custom_x.chunks(3) {
        list.push(MeasSpec::custom(
            &triple[0],
            Units::parse(&triple[1]),
            &triple[2],
        ));
    }

    let customs: Vec<&str> = list
        .iter()
        .filter(|m| m.is_custom())
        .map(|m| m.name.as_str())
        .collect();
    for (i, a) in customs.iter().enumerate() {
        anyhow::ensure!(
            !customs[..i].contains(a),
            "duplicate custom measurement `{a}`"
        );
    }

    anyhow::ensure!(!list.is_empty(), "no measurements configured");
    Ok(list)
}

fn variable(cli: &CliArgs) -> anyhow::Result<Option<BenchVar>> {
    let mut vars = Vec::new();
    if let Some(spec) = &cli.scan {
        vars.push(parse_scan(spec)?);
    }
    if let Some(spec) = &cli.scanl {
        vars.push(parse_scanl(spec)?);
    }
    if let Some(dir) = &cli.inputd {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)
            .map_err(|err| anyhow::anyhow!("could not read input directory {dir}: {err}"))?
        {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        anyhow::ensure!(!names.is_empty(), "input directory {dir} has no files");
        vars.push(BenchVar {
            name: String::from("input"),
            values: names,
        });
    }
    anyhow::ensure!(
        vars.len() <= 1,
        "only one benchmark variable is allowed per session"
    );
    Ok(vars.into_iter().next())
}

fn shell_tokens(cli: &CliArgs) -> Vec<String> {
    cli.shell.split_whitespace().map(String::from).collect()
}

fn base_input(cli: &CliArgs) -> anyhow::Result<InputPolicy> {
    let mut policies = Vec::new();
    if cli.no_input {
        policies.push(InputPolicy::Null);
    }
    if let Some(file) = &cli.input {
        policies.push(InputPolicy::File(PathBuf::from(file)));
    }
    if let Some(text) = &cli.inputs {
        policies.push(InputPolicy::String(text.clone()));
    }
    anyhow::ensure!(
        policies.len() <= 1,
        "--no-input, --input and --inputs are mutually exclusive"
    );
    Ok(policies.into_iter().next().unwrap_or(InputPolicy::Null))
}

#[allow(clippy::too_many_arguments)]
fn expand_benches(
    cli: &CliArgs,
    commands: &[String],
    var: Option<&BenchVar>,
    meas: &[MeasSpec],
    shell: &[String],
    base_input: &InputPolicy,
    output: OutputPolicy,
) -> anyhow::Result<(Vec<BenchParams>, Vec<BenchGroup>)> {
    let mut benches = Vec::new();
    let mut groups = Vec::new();

    for template in commands {
        let template = match &cli.common_args {
            Some(args) => format!("{template} {args}"),
            None => template.clone(),
        };

        match var {
            None => {
                benches.push(make_params(cli, &template, meas, shell, base_input.clone(), output)?);
            }
            Some(var) => {
                let pattern = format!("{{{}}}", var.name);
                let mut idxs = Vec::with_capacity(var.values.len());
                for value in &var.values {
                    let cmd = template.replace(&pattern, value);
                    let input = if cli.inputd.is_some() {
                        InputPolicy::File(PathBuf::from(cli.inputd.as_ref().unwrap()).join(value))
                    } else {
                        base_input.clone()
                    };
                    let mut params = make_params(cli, &cmd, meas, shell, input, output)?;
                    params.name = format!("{cmd} ({}={value})", var.name);
                    idxs.push(benches.len());
                    benches.push(params);
                }
                groups.push(BenchGroup {
                    name: template.clone(),
                    bench_idxs: idxs,
                });
            }
        }
    }
    Ok((benches, groups))
}

fn make_params(
    cli: &CliArgs,
    cmd: &str,
    meas: &[MeasSpec],
    shell: &[String],
    input: InputPolicy,
    output: OutputPolicy,
) -> anyhow::Result<BenchParams> {
    let exec = if cli.no_shell {
        let argv: Vec<String> = cmd.split_whitespace().map(String::from).collect();
        anyhow::ensure!(!argv.is_empty(), "empty command");
        ExecSpec::Direct { argv }
    } else {
        ExecSpec::Shell {
            shell: shell.to_vec(),
            cmd: String::from(cmd),
        }
    };
    Ok(BenchParams {
        name: String::from(cmd),
        exec,
        prepare: cli.prepare.clone(),
        input,
        output,
        meas: meas.to_vec(),
        ignore_failure: cli.ignore_failure,
        shell: shell.to_vec(),
    })
}

fn apply_renames(cli: &CliArgs, benches: &mut [BenchParams]) -> anyhow::Result<()> {
    for pair in cli.rename.chunks(2) {
        let idx: usize = pair[0]
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid --rename index `{}`", pair[0]))?;
        anyhow::ensure!(
            (1..=benches.len()).contains(&idx),
            "--rename index {idx} is out of range"
        );
        benches[idx - 1].name = pair[1].clone();
    }
    for pair in cli.renamen.chunks(2) {
        let bench = benches
            .iter_mut()
            .find(|b| b.name == pair[0])
            .ok_or_else(|| anyhow::anyhow!("no benchmark named `{}` to rename", pair[0]))?;
        bench.name = pair[1].clone();
    }
    if let Some(csv) = &cli.rename_all {
        let names: Vec<&str> = csv.split(',').collect();
        anyhow::ensure!(
            names.len() == benches.len(),
            "--rename-all lists {} names for {} benchmarks",
            names.len(),
            benches.len()
        );
        for (bench, name) in benches.iter_mut().zip(names) {
            bench.name = String::from(name);
        }
    }
    Ok(())
}

fn baseline(cli: &CliArgs, benches: &[BenchParams]) -> anyhow::Result<Option<usize>> {
    anyhow::ensure!(
        cli.baseline.is_none() || cli.baseline_name.is_none(),
        "--baseline and --baseline-name are mutually exclusive"
    );
    if let Some(n) = cli.baseline {
        anyhow::ensure!(
            (1..=benches.len()).contains(&n),
            "--baseline {n} is out of range (1..={})",
            benches.len()
        );
        return Ok(Some(n - 1));
    }
    if let Some(name) = &cli.baseline_name {
        let idx = benches
            .iter()
            .position(|b| &b.name == name)
            .ok_or_else(|| anyhow::anyhow!("no benchmark named `{name}`"))?;
        return Ok(Some(idx));
    }
    Ok(None)
}

/// Worker count and whether the request had to be clamped to the number of
/// benchmarks.
fn resolve_jobs(requested: Option<usize>, bench_count: usize) -> anyhow::Result<(usize, bool)> {
    match requested {
        None => Ok((1, false)),
        Some(0) => anyhow::bail!("--jobs must be at least 1"),
        Some(n) => {
            let jobs = n.min(bench_count.max(1));
            Ok((jobs, jobs < n))
        }
    }
}

fn tristate(value: &str, flag: &str, auto: impl Fn() -> bool) -> anyhow::Result<bool> {
    match value {
        "auto" => Ok(auto()),
        "always" => Ok(true),
        "never" => Ok(false),
        other => anyhow::bail!("invalid {flag} `{other}`, expected auto, never or always"),
    }
}
