//! Sample collector: one measured benchmark iteration, and the deferred
//! custom-measurement extraction pass.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;

use anyhow::Context;
use once_cell::sync::OnceCell;

use crate::bench::{BenchData, BenchParams, InputPolicy, OutputPolicy};
use crate::meas::MeasKind;
use crate::perf_cnt::PerfGroup;
use crate::process::{self, StdioPolicy};
use crate::rng::clock;

/// Runs the prepare command if one is configured. A non-zero exit aborts
/// the benchmark.
pub fn run_prepare(params: &BenchParams) -> anyhow::Result<()> {
    if let Some(prepare) = &params.prepare {
        let ok = process::shell_execute(
            &params.shell,
            prepare,
            StdioPolicy::Null,
            StdioPolicy::Null,
            StdioPolicy::Null,
        )?;
        anyhow::ensure!(ok, "prepare command `{prepare}` exited with non-zero status");
    }
    Ok(())
}

/// Executes one iteration of `params` and, unless this is a warm-up run,
/// appends the collected scalars to `data`.
pub fn collect_sample(
    params: &BenchParams,
    data: &mut BenchData,
    is_warmup: bool,
    pmc_enabled: bool,
) -> anyhow::Result<()> {
    run_prepare(params)?;

    // Stdin is reopened per run: prepare commands may rewrite input files.
    let stdin_file = open_stdin(params)?;
    let stdin = match &stdin_file {
        Some(f) => StdioPolicy::Fd(f.as_raw_fd()),
        None => StdioPolicy::Null,
    };

    let capture = !is_warmup && params.has_custom();
    let (stdout, stderr) = if is_warmup {
        (StdioPolicy::Null, StdioPolicy::Null)
    } else if capture {
        let file = data.stdout_file.as_ref().unwrap();
        (StdioPolicy::Fd(file.as_raw_fd()), StdioPolicy::Null)
    } else {
        match params.output {
            OutputPolicy::Null => (StdioPolicy::Null, StdioPolicy::Null),
            OutputPolicy::Inherit => (StdioPolicy::Inherit, StdioPolicy::Inherit),
        }
    };

    let gate = pmc_enabled && !is_warmup;
    let t0 = clock();
    let pid = process::launch(&params.exec, stdin, stdout, stderr, gate)?;

    let mut perf = None;
    if gate {
        // Arm before releasing the child so the counters cover its whole
        // lifetime. Arming failure must not leave the gated child behind.
        match PerfGroup::attach(pid).and_then(|group| {
            group.enable()?;
            Ok(group)
        }) {
            Ok(group) => perf = Some(group),
            Err(err) => {
                process::kill(pid);
                let _ = process::wait(pid);
                return Err(err).context("could not arm performance counters");
            }
        }
        process::release_gate(pid);
    }

    let (exit_code, usage) = process::wait(pid)?;
    let t1 = clock();

    if !params.ignore_failure && exit_code != 0 {
        anyhow::bail!(
            "command `{}` exited with code {exit_code} (use --ignore-failure to keep going)",
            params.exec.display()
        );
    }
    if is_warmup {
        return Ok(());
    }

    let counts = match perf.as_mut() {
        Some(group) => Some(group.collect().context("could not read performance counters")?),
        None => None,
    };

    let mut values = Vec::with_capacity(params.meas.len());
    for (idx, spec) in params.meas.iter().enumerate() {
        let val = match spec.kind {
            MeasKind::Wall => t1 - t0,
            MeasKind::UTime => timeval_s(usage.ru_utime),
            MeasKind::STime => timeval_s(usage.ru_stime),
            // ru_maxrss is reported in kilobytes.
            MeasKind::MaxRss => usage.ru_maxrss as f64 * 1024.0,
            MeasKind::MinFlt => usage.ru_minflt as f64,
            MeasKind::MajFlt => usage.ru_majflt as f64,
            MeasKind::NvCsw => usage.ru_nvcsw as f64,
            MeasKind::NiVCsw => usage.ru_nivcsw as f64,
            MeasKind::Cycles => counts.map_or(0.0, |c| c.cycles as f64),
            MeasKind::Instructions => counts.map_or(0.0, |c| c.instructions as f64),
            MeasKind::Branches => counts.map_or(0.0, |c| c.branches as f64),
            MeasKind::BranchMisses => counts.map_or(0.0, |c| c.branch_misses as f64),
            MeasKind::Custom => continue,
        };
        values.push((idx, val));
    }

    let stdout_end = if capture {
        // The child's dup2'd descriptor shares the file description, so
        // the capture file's length is the end offset of this run.
        let file = data.stdout_file.as_mut().unwrap();
        Some(file.seek(SeekFrom::End(0))?)
    } else {
        None
    };

    data.push_run(exit_code, &values, stdout_end);
    Ok(())
}

fn timeval_s(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1e6
}

fn open_stdin(params: &BenchParams) -> anyhow::Result<Option<File>> {
    match &params.input {
        InputPolicy::Null => Ok(None),
        InputPolicy::File(path) => {
            let file = File::open(path)
                .with_context(|| format!("could not open input file {}", path.display()))?;
            Ok(Some(file))
        }
        InputPolicy::String(text) => {
            let mut file = tempfile::tempfile().context("could not create input tempfile")?;
            file.write_all(text.as_bytes())?;
            file.seek(SeekFrom::Start(0))?;
            Ok(Some(file))
        }
    }
}

/// The deferred extraction pass: slices the shared capture file into one
/// stdin per run, pipes each slice through every custom extractor, and
/// parses the first real number of the extractor's stdout.
pub fn run_custom_measurements(params: &BenchParams, data: &mut BenchData) -> anyhow::Result<()> {
    if !params.has_custom() {
        return Ok(());
    }
    let custom: Vec<usize> = params
        .meas
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_custom())
        .map(|(i, _)| i)
        .collect();

    let mut input = tempfile::tempfile().context("could not create extractor input tempfile")?;
    let mut output = tempfile::tempfile().context("could not create extractor output tempfile")?;
    let mut slice = Vec::new();

    for run in 0..data.run_count {
        let (start, end) = data.stdout_slice(run);
        slice.resize((end - start) as usize, 0);
        data.stdout_file
            .as_ref()
            .unwrap()
            .read_exact_at(&mut slice, start)
            .context("could not read captured stdout")?;

        input.set_len(0)?;
        input.write_all_at(&slice, 0)?;

        for &idx in &custom {
            let spec = &params.meas[idx];
            let cmd = spec.cmd.as_deref().unwrap();

            input.seek(SeekFrom::Start(0))?;
            output.set_len(0)?;
            output.seek(SeekFrom::Start(0))?;
            let pid = process::launch(
                &crate::process::ExecSpec::Shell {
                    shell: params.shell.clone(),
                    cmd: String::from(cmd),
                },
                StdioPolicy::Fd(input.as_raw_fd()),
                StdioPolicy::Fd(output.as_raw_fd()),
                StdioPolicy::Null,
                false,
            )?;
            let (code, _) = process::wait(pid)?;
            anyhow::ensure!(
                code == 0,
                "custom measurement `{}` extractor `{cmd}` exited with code {code}",
                spec.name
            );

            let mut text = String::new();
            output.seek(SeekFrom::Start(0))?;
            output.read_to_string(&mut text).with_context(|| {
                format!("custom measurement `{}` produced non-UTF-8 output", spec.name)
            })?;
            let val = parse_first_number(&text).with_context(|| {
                format!(
                    "custom measurement `{}` produced no parseable number for run {}",
                    spec.name,
                    run + 1
                )
            })?;
            data.meas[idx].push(val);
        }
    }
    Ok(())
}

/// First real number in `text`, parsed independently of the process locale
/// (decimal point only).
pub fn parse_first_number(text: &str) -> anyhow::Result<f64> {
    static NUMBER_RE: OnceCell<regex::Regex> = OnceCell::new();
    let re = NUMBER_RE.get_or_init(|| {
        regex::Regex::new(r"[-+]?(?:[0-9]+\.?[0-9]*|\.[0-9]+)(?:[eE][-+]?[0-9]+)?").unwrap()
    });
    let m = re
        .find(text)
        .ok_or_else(|| anyhow::anyhow!("output contains no number"))?;
    m.as_str()
        .parse::<f64>()
        .map_err(|err| anyhow::anyhow!("could not parse `{}`: {err}", m.as_str()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bench::{BenchGroup, BenchVar};
    use crate::meas::{default_meas_list, MeasSpec, Units};
    use crate::process::ExecSpec;

    fn params(cmd: &str, meas: Vec<MeasSpec>) -> BenchParams {
        BenchParams {
            name: String::from(cmd),
            exec: ExecSpec::Shell {
                shell: vec![String::from("/bin/sh")],
                cmd: String::from(cmd),
            },
            prepare: None,
            input: InputPolicy::Null,
            output: OutputPolicy::Null,
            meas,
            ignore_failure: false,
            shell: vec![String::from("/bin/sh")],
        }
    }

    #[test]
    fn parse_first_number_variants() {
        assert_eq!(parse_first_number("42").unwrap(), 42.0);
        assert_eq!(parse_first_number("  3.5 things").unwrap(), 3.5);
        assert_eq!(parse_first_number("t=1e-3s").unwrap(), 1e-3);
        assert_eq!(parse_first_number("result: -7.25").unwrap(), -7.25);
        assert!(parse_first_number("no digits here").is_err());
        assert!(parse_first_number("").is_err());
    }

    #[test]
    fn sample_fills_every_column() {
        let p = params("true", default_meas_list());
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        collect_sample(&p, &mut data, false, false).unwrap();
        collect_sample(&p, &mut data, false, false).unwrap();
        assert_eq!(data.run_count, 2);
        assert_eq!(data.exit_codes, vec![0, 0]);
        for column in &data.meas {
            assert_eq!(column.len(), 2);
        }
        assert!(data.meas[0].iter().all(|&wall| wall > 0.0));
    }

    #[test]
    fn warmup_discards_samples() {
        let p = params("true", default_meas_list());
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        collect_sample(&p, &mut data, true, false).unwrap();
        assert_eq!(data.run_count, 0);
        assert!(data.exit_codes.is_empty());
    }

    #[test]
    fn failing_command_aborts_without_ignore_failure() {
        let p = params("false", default_meas_list());
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        let err = collect_sample(&p, &mut data, false, false).unwrap_err();
        assert!(err.to_string().contains("exited with code 1"));
    }

    #[test]
    fn failing_command_is_recorded_with_ignore_failure() {
        let mut p = params("false", default_meas_list());
        p.ignore_failure = true;
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        collect_sample(&p, &mut data, false, false).unwrap();
        assert_eq!(data.exit_codes, vec![1]);
    }

    #[test]
    fn inline_input_reaches_the_child() {
        let mut meas = default_meas_list();
        meas.push(MeasSpec::custom("len", Units::None, "wc -c"));
        let mut p = params("cat", meas);
        p.input = InputPolicy::String(String::from("hello stdin"));
        let mut data = BenchData::new(p.meas.len(), true).unwrap();
        collect_sample(&p, &mut data, false, false).unwrap();
        run_custom_measurements(&p, &mut data).unwrap();
        assert_eq!(data.meas[3], vec![11.0]);
    }

    #[test]
    fn capture_offsets_delimit_runs() {
        let mut meas = default_meas_list();
        meas.push(MeasSpec::custom("v", Units::None, "cat"));
        let p = params("printf '17.5\\n'", meas);
        let mut data = BenchData::new(p.meas.len(), true).unwrap();
        collect_sample(&p, &mut data, false, false).unwrap();
        collect_sample(&p, &mut data, false, false).unwrap();
        collect_sample(&p, &mut data, false, false).unwrap();
        assert_eq!(data.stdout_offsets, vec![5, 10, 15]);
        run_custom_measurements(&p, &mut data).unwrap();
        assert_eq!(data.meas[3], vec![17.5, 17.5, 17.5]);
    }

    #[test]
    fn unparseable_extractor_output_fails() {
        let mut meas = default_meas_list();
        meas.push(MeasSpec::custom("v", Units::None, "cat"));
        let p = params("printf 'not-a-number\\n'", meas);
        let mut data = BenchData::new(p.meas.len(), true).unwrap();
        collect_sample(&p, &mut data, false, false).unwrap();
        let err = run_custom_measurements(&p, &mut data).unwrap_err();
        assert!(err.to_string().contains("no parseable number"));
    }

    #[test]
    fn prepare_failure_aborts() {
        let mut p = params("true", default_meas_list());
        p.prepare = Some(String::from("false"));
        let mut data = BenchData::new(p.meas.len(), false).unwrap();
        let err = collect_sample(&p, &mut data, false, false).unwrap_err();
        assert!(err.to_string().contains("prepare"));
    }

    #[test]
    fn var_and_group_align() {
        let var = BenchVar {
            name: String::from("n"),
            values: vec![String::from("100"), String::from("200")],
        };
        let group = BenchGroup {
            name: String::from("cmd {n}"),
            bench_idxs: vec![0, 1],
        };
        assert_eq!(var.values.len(), group.bench_idxs.len());
    }
}
