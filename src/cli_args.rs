pub fn parse() -> CliArgs {
    CliArgs::parse()
}

use clap::Parser;

/// Command Line Arguments
#[derive(Debug, Parser)]
#[command(author, version, about = "Command-line benchmarking tool.", long_about = None)]
pub struct CliArgs {
    /// The commands to benchmark, one per argument. `{var}` is replaced by
    /// the scan variable's current value. A leading `load` re-analyzes the
    /// artifacts of a previous run instead of executing anything.
    #[arg(value_name = "COMMAND")]
    pub commands: Vec<String>,

    /// Time limit of one benchmark, e.g. 5s, 500ms.
    #[arg(short = 'T', long, value_name = "TIME")]
    pub time_limit: Option<String>,

    /// Perform exactly NUM runs for each command, ignoring the time limit.
    #[arg(short = 'R', long, value_name = "NUM")]
    pub runs: Option<i32>,

    /// Perform at least NUM runs regardless of the time limit.
    #[arg(long, value_name = "NUM")]
    pub min_runs: Option<i32>,

    /// Perform at most NUM runs regardless of the time limit.
    #[arg(long, value_name = "NUM")]
    pub max_runs: Option<i32>,

    /// Warm-up time before measuring, e.g. 1s (default 100ms).
    #[arg(short = 'W', long, value_name = "TIME")]
    pub warmup: Option<String>,

    /// Perform exactly NUM warm-up runs.
    #[arg(long, value_name = "NUM")]
    pub warmup_runs: Option<i32>,

    /// Perform at least NUM warm-up runs.
    #[arg(long, value_name = "NUM")]
    pub min_warmup_runs: Option<i32>,

    /// Perform at most NUM warm-up runs.
    #[arg(long, value_name = "NUM")]
    pub max_warmup_runs: Option<i32>,

    /// Disable warm-up.
    #[arg(long)]
    pub no_warmup: bool,

    /// Maximum time one benchmark may run before yielding to its siblings
    /// (default 5s).
    #[arg(long, value_name = "TIME")]
    pub round_time: Option<String>,

    /// Yield after exactly NUM runs per round.
    #[arg(long, value_name = "NUM")]
    pub round_runs: Option<i32>,

    /// Perform at least NUM runs per round.
    #[arg(long, value_name = "NUM")]
    pub min_round_runs: Option<i32>,

    /// Perform at most NUM runs per round.
    #[arg(long, value_name = "NUM")]
    pub max_round_runs: Option<i32>,

    /// Disable round-based interleaving.
    #[arg(long)]
    pub no_rounds: bool,

    /// Execute CMD through the shell before each timing run.
    #[arg(short = 'P', long, value_name = "CMD")]
    pub prepare: Option<String>,

    /// Number of bootstrap resamples.
    #[arg(long, value_name = "NUM", default_value_t = 10000)]
    pub nrs: usize,

    /// Arguments appended to every benchmarked command.
    #[arg(long, value_name = "ARGS")]
    pub common_args: Option<String>,

    /// Shell used to execute commands, prepare commands and custom
    /// measurement extractors.
    #[arg(short = 'S', long, value_name = "CMD", default_value = "/bin/sh")]
    pub shell: String,

    /// Execute commands directly, without a shell.
    #[arg(short = 'N')]
    pub no_shell: bool,

    /// Where a command's output goes: null or inherit.
    #[arg(long, value_name = "KIND", default_value = "null")]
    pub output: String,

    /// Read stdin from /dev/null (the default).
    #[arg(long)]
    pub no_input: bool,

    /// Read stdin from FILE.
    #[arg(long, value_name = "FILE")]
    pub input: Option<String>,

    /// Feed STRING to stdin.
    #[arg(long, value_name = "STRING")]
    pub inputs: Option<String>,

    /// Benchmark once per file in DIR, feeding the file to stdin. The file
    /// name becomes the value of the `input` variable.
    #[arg(long, value_name = "DIR")]
    pub inputd: Option<String>,

    /// Add a custom measurement parsing the first number of stdout.
    #[arg(long, value_name = "NAME", action = clap::ArgAction::Append)]
    pub custom: Vec<String>,

    /// Add a custom measurement extracted by CMD from stdout.
    #[arg(long = "custom-t", num_args = 2, value_names = ["NAME", "CMD"], action = clap::ArgAction::Append)]
    pub custom_t: Vec<String>,

    /// Add a custom measurement with explicit units.
    #[arg(long = "custom-x", num_args = 3, value_names = ["NAME", "UNITS", "CMD"], action = clap::ArgAction::Append)]
    pub custom_x: Vec<String>,

    /// Benchmark over a numeric range: VAR/LO/HI[/STEP].
    #[arg(long, value_name = "SPEC")]
    pub scan: Option<String>,

    /// Benchmark over a list of literal values: VAR/V[,V...].
    #[arg(long, value_name = "SPEC")]
    pub scanl: Option<String>,

    /// Number of worker threads (default: sequential).
    #[arg(short = 'j', long, value_name = "NUM")]
    pub jobs: Option<usize>,

    /// Use benchmark NUM (1-based) as the comparison baseline.
    #[arg(long, value_name = "NUM")]
    pub baseline: Option<usize>,

    /// Use the benchmark with this name as the comparison baseline.
    #[arg(long, value_name = "NAME")]
    pub baseline_name: Option<String>,

    /// Color output: auto, never or always.
    #[arg(long, value_name = "WHEN", default_value = "auto")]
    pub color: String,

    /// Progress bar: auto, never or always.
    #[arg(long = "progress-bar", value_name = "WHEN", default_value = "auto")]
    pub progress_bar: String,

    /// Report ordering: default, raw, by-speed, baseline-raw or
    /// baseline-by-speed.
    #[arg(long, value_name = "MODE", default_value = "default")]
    pub sort: String,

    /// Comma-separated list of measurements to collect: wall, stime,
    /// utime, maxrss, minflt, majflt, nvcsw, nivcsw, cycles, instructions,
    /// branches, branch-misses.
    #[arg(long, value_name = "LIST")]
    pub meas: Option<String>,

    /// Do not collect the default wall-clock measurement set.
    #[arg(long)]
    pub no_default_meas: bool,

    /// Rename benchmark NUM (1-based) to NAME.
    #[arg(long, num_args = 2, value_names = ["NUM", "NAME"], action = clap::ArgAction::Append)]
    pub rename: Vec<String>,

    /// Rename the benchmark called OLD to NEW.
    #[arg(long, num_args = 2, value_names = ["OLD", "NEW"], action = clap::ArgAction::Append)]
    pub renamen: Vec<String>,

    /// Rename all benchmarks with a comma-separated list of names.
    #[arg(long = "rename-all", value_name = "CSV")]
    pub rename_all: Option<String>,

    /// Ignore non-zero exit codes of the benchmarked commands.
    #[arg(short = 'i', long)]
    pub ignore_failure: bool,

    /// Export results as JSON to FILE.
    #[arg(long, value_name = "FILE")]
    pub json: Option<std::path::PathBuf>,

    /// Write CSV artifacts into the output directory.
    #[arg(long)]
    pub csv: bool,

    /// Output directory for artifacts.
    #[arg(short = 'o', long = "out-dir", value_name = "DIR", default_value = ".csbench")]
    pub out_dir: std::path::PathBuf,
}

/// Duration: bare seconds or a number with an s/ms/us/ns suffix. Negative
/// values are rejected.
pub fn parse_duration(s: &str) -> anyhow::Result<f64> {
    let s = s.trim();
    let (number, scale) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1e-3)
    } else if let Some(rest) = s.strip_suffix("us") {
        (rest, 1e-6)
    } else if let Some(rest) = s.strip_suffix("ns") {
        (rest, 1e-9)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1.0)
    } else {
        (s, 1.0)
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration `{s}`"))?;
    anyhow::ensure!(value >= 0.0, "duration `{s}` is negative");
    Ok(value * scale)
}

/// `VAR/LO/HI[/STEP]` numeric range, inclusive on both ends.
pub fn parse_scan(spec: &str) -> anyhow::Result<crate::bench::BenchVar> {
    let parts: Vec<&str> = spec.split('/').collect();
    anyhow::ensure!(
        parts.len() == 3 || parts.len() == 4,
        "invalid scan `{spec}`, expected VAR/LO/HI[/STEP]"
    );
    let name = parts[0];
    anyhow::ensure!(!name.is_empty(), "scan `{spec}` has an empty variable name");
    let lo: f64 = parts[1]
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid scan bound `{}`", parts[1]))?;
    let hi: f64 = parts[2]
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid scan bound `{}`", parts[2]))?;
    let step: f64 = match parts.get(3) {
        Some(s) => s
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid scan step `{s}`"))?,
        None => 1.0,
    };
    anyhow::ensure!(step > 0.0, "scan step must be positive");
    anyhow::ensure!(hi >= lo, "scan range `{spec}` is empty");

    let mut values = Vec::new();
    let mut v = lo;
    while v <= hi + step * 1e-9 {
        values.push(format_scan_value(v));
        anyhow::ensure!(values.len() <= 10_000, "scan `{spec}` produces too many values");
        v += step;
    }
    Ok(crate::bench::BenchVar {
        name: String::from(name),
        values,
    })
}

fn format_scan_value(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// `VAR/V[,V...]` literal value list.
pub fn parse_scanl(spec: &str) -> anyhow::Result<crate::bench::BenchVar> {
    let (name, rest) = spec
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("invalid scan list `{spec}`, expected VAR/V[,V...]"))?;
    anyhow::ensure!(!name.is_empty(), "scan list `{spec}` has an empty variable name");
    let values: Vec<String> = rest.split(',').map(String::from).collect();
    anyhow::ensure!(
        values.iter().all(|v| !v.is_empty()),
        "scan list `{spec}` contains an empty value"
    );
    Ok(crate::bench::BenchVar {
        name: String::from(name),
        values,
    })
}
