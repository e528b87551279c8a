//! Result artifacts: JSON export, the CSV file family, and the `load`
//! reader that re-ingests raw CSVs for offline analysis.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::analyze::BenchAnalysis;
use crate::bench::{BenchData, BenchGroup, BenchParams, BenchVar, InputPolicy, OutputPolicy};
use crate::config::Config;
use crate::meas::{MeasKind, MeasSpec, Units};
use crate::process::ExecSpec;

#[derive(Serialize)]
struct JsonSettings {
    time_limit: f64,
    runs: i32,
    min_runs: i32,
    max_runs: i32,
    warmup_time: f64,
    nresamp: usize,
}

#[derive(Serialize)]
struct JsonMeas<'a> {
    name: &'a str,
    units: &'a str,
    cmd: &'a str,
    val: &'a [f64],
}

#[derive(Serialize)]
struct JsonBench<'a> {
    prepare: &'a str,
    command: &'a str,
    run_count: usize,
    exit_codes: &'a [i32],
    meas: Vec<JsonMeas<'a>>,
}

#[derive(Serialize)]
struct JsonExport<'a> {
    settings: JsonSettings,
    benches: Vec<JsonBench<'a>>,
}

pub fn write_json(
    path: &Path,
    config: &Config,
    params: &[BenchParams],
    data: &[BenchData],
) -> anyhow::Result<()> {
    let settings = JsonSettings {
        time_limit: config.bench_policy.time_limit,
        runs: config.bench_policy.exact_runs,
        min_runs: config.bench_policy.min_runs,
        max_runs: config.bench_policy.max_runs,
        warmup_time: config.warmup_policy.time_limit,
        nresamp: config.nresamp,
    };
    let benches = params
        .iter()
        .zip(data)
        .map(|(p, d)| JsonBench {
            prepare: p.prepare.as_deref().unwrap_or(""),
            command: &p.name,
            run_count: d.run_count,
            exit_codes: &d.exit_codes,
            meas: p
                .meas
                .iter()
                .enumerate()
                .map(|(i, spec)| JsonMeas {
                    name: &spec.name,
                    units: spec.units.label(),
                    cmd: spec.cmd.as_deref().unwrap_or(""),
                    val: &d.meas[i],
                })
                .collect(),
        })
        .collect();
    let export = JsonExport { settings, benches };

    let file = File::create(path)
        .with_context(|| format!("could not create JSON export {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &export)
        .with_context(|| format!("could not write JSON export {}", path.display()))?;
    Ok(())
}

/// Recursively cleans and recreates the artifact directory.
pub fn prepare_out_dir(dir: &Path) -> anyhow::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("could not clean output directory {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("could not create output directory {}", dir.display()))?;
    Ok(())
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        String::from(s)
    }
}

/// Writes the whole CSV family into `dir` (already prepared):
/// `bench_raw_N.csv`, `benches_raw_M.csv`, `benches_stats_M.csv` and, when
/// groups exist, `group_raw_G_M.csv` plus the `groups_M.csv` pivot.
pub fn write_csv_artifacts(
    dir: &Path,
    params: &[BenchParams],
    data: &[BenchData],
    analyses: &[BenchAnalysis],
    var: Option<&BenchVar>,
    groups: &[BenchGroup],
) -> anyhow::Result<()> {
    let meas = &params[0].meas;

    for (n, (p, d)) in params.iter().zip(data).enumerate() {
        let mut w = artifact(dir, &format!("bench_raw_{n}.csv"))?;
        let header: Vec<String> = p.meas.iter().map(|m| csv_field(&m.name)).collect();
        writeln!(w, "{}", header.join(","))?;
        for run in 0..d.run_count {
            let row: Vec<String> = (0..p.meas.len())
                .map(|m| format!("{}", d.meas[m][run]))
                .collect();
            writeln!(w, "{}", row.join(","))?;
        }
    }

    for m in 0..meas.len() {
        let mut w = artifact(dir, &format!("benches_raw_{m}.csv"))?;
        for (p, d) in params.iter().zip(data) {
            let mut row = vec![csv_field(&p.name)];
            row.extend(d.meas[m].iter().map(|v| format!("{v}")));
            writeln!(w, "{}", row.join(","))?;
        }

        let mut w = artifact(dir, &format!("benches_stats_{m}.csv"))?;
        writeln!(
            w,
            "cmd,mean_low,mean,mean_high,st_dev_low,st_dev,st_dev_high,min,max,median,q1,q3,p1,p5,p95,p99,outl"
        )?;
        for (p, a) in params.iter().zip(analyses) {
            let d = &a.distrs[m];
            writeln!(
                w,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                csv_field(&p.name),
                d.mean.lower,
                d.mean.point,
                d.mean.upper,
                d.st_dev.lower,
                d.st_dev.point,
                d.st_dev.upper,
                d.min,
                d.max,
                d.median,
                d.q1,
                d.q3,
                d.p1,
                d.p5,
                d.p95,
                d.p99,
                d.outliers.var_fraction,
            )?;
        }
    }

    if let Some(var) = var {
        for (g, group) in groups.iter().enumerate() {
            for m in 0..meas.len() {
                let mut w = artifact(dir, &format!("group_raw_{g}_{m}.csv"))?;
                for (value, &bench) in var.values.iter().zip(&group.bench_idxs) {
                    let mut row = vec![csv_field(&format!("{}={}", var.name, value))];
                    row.extend(data[bench].meas[m].iter().map(|v| format!("{v}")));
                    writeln!(w, "{}", row.join(","))?;
                }
            }
        }

        for m in 0..meas.len() {
            let mut w = artifact(dir, &format!("groups_{m}.csv"))?;
            let mut header = vec![csv_field(&var.name)];
            header.extend(groups.iter().map(|g| csv_field(&g.name)));
            writeln!(w, "{}", header.join(","))?;
            for (pos, value) in var.values.iter().enumerate() {
                let mut row = vec![csv_field(value)];
                for group in groups {
                    let bench = group.bench_idxs[pos];
                    row.push(format!("{}", analyses[bench].distrs[m].mean.point));
                }
                writeln!(w, "{}", row.join(","))?;
            }
        }
    }
    Ok(())
}

fn artifact(dir: &Path, name: &str) -> anyhow::Result<BufWriter<File>> {
    let path = dir.join(name);
    let file = File::create(&path)
        .with_context(|| format!("could not create artifact {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Re-reads the raw artifacts of a previous invocation: samples from
/// `bench_raw_N.csv`, display names from the first column of
/// `benches_raw_0.csv`. Nothing else is persisted.
pub fn load_dir(dir: &Path) -> anyhow::Result<(Vec<BenchParams>, Vec<BenchData>)> {
    let names = load_names(dir)?;

    let mut params = Vec::new();
    let mut data = Vec::new();
    for n in 0.. {
        let path = dir.join(format!("bench_raw_{n}.csv"));
        if !path.exists() {
            break;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let mut lines = text.lines();
        let header = lines
            .next()
            .ok_or_else(|| anyhow::anyhow!("{} is empty", path.display()))?;
        let meas: Vec<MeasSpec> = split_csv(header)
            .into_iter()
            .map(|name| meas_from_name(&name))
            .collect();
        anyhow::ensure!(!meas.is_empty(), "{} has no measurements", path.display());

        let mut bench = BenchData::new(meas.len(), false)?;
        for (lineno, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_csv(line);
            anyhow::ensure!(
                fields.len() == meas.len(),
                "{}:{} has {} fields for {} measurements",
                path.display(),
                lineno + 2,
                fields.len(),
                meas.len()
            );
            let mut values = Vec::with_capacity(fields.len());
            for (idx, field) in fields.iter().enumerate() {
                let v: f64 = field
                    .parse()
                    .map_err(|_| anyhow::anyhow!("{}: bad value `{field}`", path.display()))?;
                values.push((idx, v));
            }
            bench.push_run(0, &values, None);
        }
        anyhow::ensure!(bench.run_count > 0, "{} has no runs", path.display());

        let name = names
            .get(n)
            .cloned()
            .unwrap_or_else(|| format!("bench {}", n + 1));
        params.push(BenchParams {
            name: name.clone(),
            exec: ExecSpec::Shell {
                shell: vec![String::from("/bin/sh")],
                cmd: name,
            },
            prepare: None,
            input: InputPolicy::Null,
            output: OutputPolicy::Null,
            meas,
            ignore_failure: true,
            shell: vec![String::from("/bin/sh")],
        });
        data.push(bench);
    }
    anyhow::ensure!(
        !params.is_empty(),
        "{} holds no bench_raw_N.csv artifacts",
        dir.display()
    );
    for p in &params[1..] {
        anyhow::ensure!(
            p.meas.len() == params[0].meas.len()
                && p.meas
                    .iter()
                    .zip(&params[0].meas)
                    .all(|(a, b)| a.name == b.name),
            "benchmarks in {} disagree on their measurements",
            dir.display()
        );
    }
    Ok((params, data))
}

fn load_names(dir: &Path) -> anyhow::Result<Vec<String>> {
    let path = dir.join("benches_raw_0.csv");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("could not read {}", path.display()))?;
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| split_csv(l).into_iter().next().unwrap_or_default())
        .collect())
}

fn meas_from_name(name: &str) -> MeasSpec {
    match MeasKind::from_token(name) {
        Some(kind) => MeasSpec::builtin(kind),
        None => MeasSpec {
            kind: MeasKind::Custom,
            name: String::from(name),
            units: Units::None,
            cmd: None,
            primary: None,
        },
    }
}

/// Minimal CSV field splitter for the files this module writes: quoted
/// fields with doubled quotes, no embedded newlines.
fn split_csv(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => {
                fields.push(std::mem::take(&mut field));
            }
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}
