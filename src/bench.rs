//! Benchmark parameters and the per-benchmark sample accumulator.

use std::fs::File;
use std::path::PathBuf;

use crate::meas::MeasSpec;
use crate::process::ExecSpec;

/// Where a run's stdin comes from.
#[derive(Debug, Clone)]
pub enum InputPolicy {
    Null,
    /// Read from this file.
    File(PathBuf),
    /// Feed this string.
    String(String),
}

/// Where a run's stdout goes (stderr follows stdout for `Inherit`, is
/// dropped otherwise). Capture into the benchmark tempfile is not a policy:
/// it is forced whenever custom measurements exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPolicy {
    Null,
    Inherit,
}

/// Everything needed to execute one benchmark. Owned by the task; workers
/// only share the immutable session config.
#[derive(Debug, Clone)]
pub struct BenchParams {
    pub name: String,
    pub exec: ExecSpec,
    pub prepare: Option<String>,
    pub input: InputPolicy,
    pub output: OutputPolicy,
    pub meas: Vec<MeasSpec>,
    pub ignore_failure: bool,
    /// Shell tokens used for prepare commands and custom extractors.
    pub shell: Vec<String>,
}

impl BenchParams {
    pub fn has_custom(&self) -> bool {
        self.meas.iter().any(|m| m.is_custom())
    }
}

/// Samples accumulated by one benchmark across all of its rounds.
///
/// `meas[i][run]`, `exit_codes[run]` and `stdout_offsets[run]` describe the
/// same iteration; `stdout_offsets` holds per-run *end* offsets into the
/// shared capture file and is strictly nondecreasing.
#[derive(Debug)]
pub struct BenchData {
    pub run_count: usize,
    pub meas: Vec<Vec<f64>>,
    pub exit_codes: Vec<i32>,
    pub stdout_file: Option<File>,
    pub stdout_offsets: Vec<u64>,
    /// Measured-loop seconds folded in across round suspensions, so the
    /// benchmark time limit keeps integrating over resumptions.
    pub time_run: f64,
    /// Warm-up runs once per benchmark, not once per resumption.
    pub warmup_done: bool,
}

impl BenchData {
    pub fn new(meas_count: usize, capture_stdout: bool) -> std::io::Result<Self> {
        let stdout_file = if capture_stdout {
            // Anonymous and already unlinked, so it vanishes on crash.
            Some(tempfile::tempfile()?)
        } else {
            None
        };
        Ok(BenchData {
            run_count: 0,
            meas: vec![Vec::new(); meas_count],
            exit_codes: Vec::new(),
            stdout_file,
            stdout_offsets: Vec::new(),
            time_run: 0.0,
            warmup_done: false,
        })
    }

    /// Appends one completed iteration. `values` carries the non-custom
    /// measurement scalars as (measurement index, value) pairs; custom
    /// columns are filled later by the extraction pass.
    pub fn push_run(&mut self, exit_code: i32, values: &[(usize, f64)], stdout_end: Option<u64>) {
        self.exit_codes.push(exit_code);
        for &(idx, val) in values {
            self.meas[idx].push(val);
        }
        if let Some(end) = stdout_end {
            debug_assert!(self.stdout_offsets.last().map_or(true, |&prev| prev <= end));
            self.stdout_offsets.push(end);
        }
        self.run_count += 1;
    }

    /// Byte range of run `i` within the capture file.
    pub fn stdout_slice(&self, run: usize) -> (u64, u64) {
        let start = if run == 0 {
            0
        } else {
            self.stdout_offsets[run - 1]
        };
        (start, self.stdout_offsets[run])
    }
}

/// The session's single parameter variable (at most one per session).
#[derive(Debug, Clone)]
pub struct BenchVar {
    pub name: String,
    pub values: Vec<String>,
}

/// Benchmarks generated from one command template, ordered like the
/// variable's values.
#[derive(Debug, Clone)]
pub struct BenchGroup {
    pub name: String,
    pub bench_idxs: Vec<usize>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_run_keeps_columns_aligned() {
        let mut data = BenchData::new(2, false).unwrap();
        data.push_run(0, &[(0, 1.0), (1, 10.0)], None);
        data.push_run(1, &[(0, 2.0), (1, 20.0)], None);
        assert_eq!(data.run_count, 2);
        assert_eq!(data.exit_codes, vec![0, 1]);
        assert_eq!(data.meas[0], vec![1.0, 2.0]);
        assert_eq!(data.meas[1], vec![10.0, 20.0]);
        assert!(data.stdout_offsets.is_empty());
    }

    #[test]
    fn stdout_slices_are_delimited_by_offsets() {
        let mut data = BenchData::new(1, true).unwrap();
        assert!(data.stdout_file.is_some());
        data.push_run(0, &[(0, 0.1)], Some(5));
        data.push_run(0, &[(0, 0.2)], Some(5));
        data.push_run(0, &[(0, 0.3)], Some(12));
        assert_eq!(data.stdout_slice(0), (0, 5));
        assert_eq!(data.stdout_slice(1), (5, 5));
        assert_eq!(data.stdout_slice(2), (5, 12));
    }
}
