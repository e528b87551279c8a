//! Analysis layer: turns raw sample matrices into distributions, pairwise
//! comparisons, group aggregates and complexity fits.

use crate::bench::{BenchData, BenchGroup, BenchParams, BenchVar};
use crate::rng::with_thread_rng;
use crate::stats::{
    bootstrap_mean, bootstrap_st_dev, classify_outliers, mann_whitney_u, ols_fit,
    outlier_variance, percentile_sorted, speedup, t_test_boot, Estimate, Ols, Outliers, Speedup,
};

/// Distribution summary of one (benchmark, measurement) sample vector.
#[derive(Debug, Clone)]
pub struct Distr {
    pub mean: Estimate,
    pub st_dev: Estimate,
    pub min: f64,
    pub p1: f64,
    pub p5: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub outliers: Outliers,
}

pub fn distr_of(samples: &[f64], nresamp: usize) -> Distr {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let (mean, st_dev) = with_thread_rng(|rng| {
        (
            bootstrap_mean(samples, nresamp, rng),
            bootstrap_st_dev(samples, nresamp, rng),
        )
    });
    let mut outliers = classify_outliers(&sorted);
    outliers.var_fraction = outlier_variance(mean.point, st_dev.point, samples.len());
    Distr {
        mean,
        st_dev,
        min: sorted[0],
        p1: percentile_sorted(&sorted, 0.01),
        p5: percentile_sorted(&sorted, 0.05),
        q1: percentile_sorted(&sorted, 0.25),
        median: percentile_sorted(&sorted, 0.5),
        q3: percentile_sorted(&sorted, 0.75),
        p95: percentile_sorted(&sorted, 0.95),
        p99: percentile_sorted(&sorted, 0.99),
        max: sorted[sorted.len() - 1],
        outliers,
    }
}

/// Per-benchmark analysis: one distribution per configured measurement.
#[derive(Debug, Clone)]
pub struct BenchAnalysis {
    pub distrs: Vec<Distr>,
}

/// Runs after a benchmark finished. A benchmark whose every run failed (or
/// that never ran) is an aggregation error, not an empty report.
pub fn analyze_benchmark(
    params: &BenchParams,
    data: &BenchData,
    nresamp: usize,
) -> anyhow::Result<BenchAnalysis> {
    anyhow::ensure!(
        data.run_count > 0,
        "benchmark `{}` collected no samples",
        params.name
    );
    let mut distrs = Vec::with_capacity(params.meas.len());
    for (idx, spec) in params.meas.iter().enumerate() {
        let column = &data.meas[idx];
        anyhow::ensure!(
            column.len() == data.run_count,
            "measurement `{}` of `{}` has {} samples for {} runs",
            spec.name,
            params.name,
            column.len(),
            data.run_count
        );
        distrs.push(distr_of(column, nresamp));
    }
    Ok(BenchAnalysis { distrs })
}

/// Report orderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    Default,
    Raw,
    BySpeed,
    BaselineRaw,
    BaselineBySpeed,
}

impl SortMode {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "default" => SortMode::Default,
            "raw" => SortMode::Raw,
            "by-speed" => SortMode::BySpeed,
            "baseline-raw" => SortMode::BaselineRaw,
            "baseline-by-speed" => SortMode::BaselineBySpeed,
            _ => return None,
        })
    }

    /// `default` is by-speed unless the user pinned a baseline.
    fn resolve(self, fixed_baseline: bool) -> SortMode {
        match self {
            SortMode::Default if fixed_baseline => SortMode::BaselineRaw,
            SortMode::Default => SortMode::BySpeed,
            other => other,
        }
    }
}

/// Group-level speedup against the baseline group: geometric mean across
/// the variable's values, and the ratio of summed means.
#[derive(Debug, Clone, Copy)]
pub struct GroupSpeedup {
    pub avg: Speedup,
    pub sum: Speedup,
}

/// The per-measurement analysis bundle.
#[derive(Debug)]
pub struct MeasAnalysis {
    pub meas_idx: usize,
    /// Reference benchmark every other one is compared against.
    pub baseline: usize,
    /// Per-bench speedup vs the baseline; `None` at the baseline itself.
    pub speedups: Vec<Option<Speedup>>,
    /// Mann-Whitney p-values vs the baseline (1.0 at the baseline).
    pub mwu_p: Vec<f64>,
    /// Bootstrapped Welch t-test p-values vs the baseline.
    pub ttest_p: Vec<f64>,
    /// Bench indices in report order for this measurement.
    pub order: Vec<usize>,
    /// Bench indices ascending by point mean.
    pub by_speed: Vec<usize>,
    /// Group aggregates, aligned with the session's groups.
    pub group_speedups: Vec<GroupSpeedup>,
    /// Group indices ascending by geometric mean of per-value means.
    pub groups_by_avg_speed: Vec<usize>,
    /// Group indices ascending by sum of per-value means.
    pub groups_by_total_speed: Vec<usize>,
    /// Complexity fit per group over (variable value, mean); present when
    /// every variable value parses as a number.
    pub ols: Vec<Option<Ols>>,
}

pub struct SessionView<'a> {
    pub params: &'a [BenchParams],
    pub data: &'a [BenchData],
    pub analyses: &'a [BenchAnalysis],
    pub var: Option<&'a BenchVar>,
    pub groups: &'a [BenchGroup],
}

/// Computes the bundle for measurement `meas_idx`.
pub fn analyze_meas(
    view: &SessionView,
    meas_idx: usize,
    fixed_baseline: Option<usize>,
    sort_mode: SortMode,
    nresamp: usize,
) -> MeasAnalysis {
    let n = view.params.len();
    let means: Vec<f64> = view
        .analyses
        .iter()
        .map(|a| a.distrs[meas_idx].mean.point)
        .collect();
    let st_devs: Vec<f64> = view
        .analyses
        .iter()
        .map(|a| a.distrs[meas_idx].st_dev.point)
        .collect();

    let baseline = select_baseline(fixed_baseline, &means);

    let mut speedups = Vec::with_capacity(n);
    let mut mwu_p = Vec::with_capacity(n);
    let mut ttest_p = Vec::with_capacity(n);
    for i in 0..n {
        if i == baseline {
            speedups.push(None);
            mwu_p.push(1.0);
            ttest_p.push(1.0);
            continue;
        }
        speedups.push(Some(speedup(
            means[baseline],
            st_devs[baseline],
            means[i],
            st_devs[i],
        )));
        let base_samples = &view.data[baseline].meas[meas_idx];
        let samples = &view.data[i].meas[meas_idx];
        mwu_p.push(mann_whitney_u(base_samples, samples));
        ttest_p.push(with_thread_rng(|rng| {
            t_test_boot(base_samples, samples, nresamp, rng)
        }));
    }

    let mut by_speed: Vec<usize> = (0..n).collect();
    by_speed.sort_by(|&a, &b| means[a].partial_cmp(&means[b]).unwrap());

    let order = match sort_mode.resolve(fixed_baseline.is_some()) {
        SortMode::Raw => (0..n).collect(),
        SortMode::BySpeed => by_speed.clone(),
        SortMode::BaselineRaw => {
            let mut order = vec![baseline];
            order.extend((0..n).filter(|&i| i != baseline));
            order
        }
        SortMode::BaselineBySpeed => {
            let mut order = vec![baseline];
            order.extend(by_speed.iter().copied().filter(|&i| i != baseline));
            order
        }
        SortMode::Default => unreachable!("resolved above"),
    };

    let (group_speedups, groups_by_avg_speed, groups_by_total_speed, ols) =
        analyze_groups(view, meas_idx, baseline, &means, &st_devs);

    MeasAnalysis {
        meas_idx,
        baseline,
        speedups,
        mwu_p,
        ttest_p,
        order,
        by_speed,
        group_speedups,
        groups_by_avg_speed,
        groups_by_total_speed,
        ols,
    }
}

fn analyze_groups(
    view: &SessionView,
    meas_idx: usize,
    baseline: usize,
    means: &[f64],
    st_devs: &[f64],
) -> (Vec<GroupSpeedup>, Vec<usize>, Vec<usize>, Vec<Option<Ols>>) {
    let groups = view.groups;
    if groups.len() < 2 && view.var.is_none() {
        return (Vec::new(), Vec::new(), Vec::new(), Vec::new());
    }

    let base_group = groups
        .iter()
        .position(|g| g.bench_idxs.contains(&baseline))
        .unwrap_or(0);

    let mut group_speedups = Vec::with_capacity(groups.len());
    for group in groups {
        let base_idxs = &groups[base_group].bench_idxs;
        let val_count = group.bench_idxs.len() as f64;

        // Geometric mean of the per-value speedups; relative errors add in
        // quadrature, scaled down by the value count.
        let mut log_point = 0.0;
        let mut rel2 = 0.0;
        let mut sum_mu = 0.0;
        let mut sum_var = 0.0;
        let mut base_sum_mu = 0.0;
        let mut base_sum_var = 0.0;
        for (pos, &bench) in group.bench_idxs.iter().enumerate() {
            let base = base_idxs[pos.min(base_idxs.len() - 1)];
            let s = speedup(means[base], st_devs[base], means[bench], st_devs[bench]);
            let oriented = if s.is_slower { s.inv_point } else { s.point };
            log_point += oriented.ln();
            let rel = s.err / s.point;
            rel2 += rel * rel / (val_count * val_count);
            sum_mu += means[bench];
            sum_var += st_devs[bench] * st_devs[bench];
            base_sum_mu += means[base];
            base_sum_var += st_devs[base] * st_devs[base];
        }
        let avg_point = (log_point / val_count).exp();
        let rel = rel2.sqrt();
        let avg = Speedup {
            point: avg_point.max(1.0 / avg_point),
            err: avg_point.max(1.0 / avg_point) * rel,
            is_slower: avg_point < 1.0,
            inv_point: avg_point.min(1.0 / avg_point),
            inv_err: avg_point.min(1.0 / avg_point) * rel,
        };
        let sum = speedup(
            base_sum_mu,
            base_sum_var.sqrt(),
            sum_mu,
            sum_var.sqrt(),
        );
        group_speedups.push(GroupSpeedup { avg, sum });
    }

    let group_mean = |g: &BenchGroup| -> f64 {
        let log_sum: f64 = g.bench_idxs.iter().map(|&i| means[i].ln()).sum();
        (log_sum / g.bench_idxs.len() as f64).exp()
    };
    let group_total = |g: &BenchGroup| -> f64 { g.bench_idxs.iter().map(|&i| means[i]).sum() };

    let mut by_avg: Vec<usize> = (0..groups.len()).collect();
    by_avg.sort_by(|&a, &b| {
        group_mean(&groups[a])
            .partial_cmp(&group_mean(&groups[b]))
            .unwrap()
    });
    let mut by_total: Vec<usize> = (0..groups.len()).collect();
    by_total.sort_by(|&a, &b| {
        group_total(&groups[a])
            .partial_cmp(&group_total(&groups[b]))
            .unwrap()
    });

    let ols = fit_groups(view, meas_idx, means);

    (group_speedups, by_avg, by_total, ols)
}

/// Per-group complexity fit over (value, mean). Only meaningful when the
/// variable's values are numeric.
fn fit_groups(view: &SessionView, _meas_idx: usize, means: &[f64]) -> Vec<Option<Ols>> {
    let Some(var) = view.var else {
        return vec![None; view.groups.len()];
    };
    let xs: Option<Vec<f64>> = var.values.iter().map(|v| v.parse::<f64>().ok()).collect();
    let Some(xs) = xs else {
        return vec![None; view.groups.len()];
    };
    view.groups
        .iter()
        .map(|group| {
            if group.bench_idxs.len() != xs.len() || xs.len() < 2 {
                return None;
            }
            let ys: Vec<f64> = group.bench_idxs.iter().map(|&i| means[i]).collect();
            Some(ols_fit(&xs, &ys))
        })
        .collect()
}

/// Fixed 1-based index if the user chose one; otherwise the benchmark with
/// the smallest point mean.
pub fn select_baseline(fixed: Option<usize>, means: &[f64]) -> usize {
    if let Some(idx) = fixed {
        return idx;
    }
    let mut best = 0;
    for (i, &m) in means.iter().enumerate() {
        if m < means[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bench::{InputPolicy, OutputPolicy};
    use crate::meas::default_meas_list;
    use crate::process::ExecSpec;

    fn fake_bench(name: &str, samples: Vec<f64>) -> (BenchParams, BenchData, BenchAnalysis) {
        let params = BenchParams {
            name: String::from(name),
            exec: ExecSpec::Shell {
                shell: vec![String::from("/bin/sh")],
                cmd: String::from(name),
            },
            prepare: None,
            input: InputPolicy::Null,
            output: OutputPolicy::Null,
            meas: default_meas_list(),
            ignore_failure: false,
            shell: vec![String::from("/bin/sh")],
        };
        let mut data = BenchData::new(params.meas.len(), false).unwrap();
        for &s in &samples {
            data.push_run(0, &[(0, s), (1, s / 2.0), (2, s / 4.0)], None);
        }
        let analysis = analyze_benchmark(&params, &data, 200).unwrap();
        (params, data, analysis)
    }

    #[test]
    fn distr_percentiles_are_ordered() {
        let samples: Vec<f64> = (0..50).map(|i| (i % 13) as f64 + 1.0).collect();
        let d = distr_of(&samples, 500);
        assert!(d.min <= d.p1 && d.p1 <= d.p5 && d.p5 <= d.q1);
        assert!(d.q1 <= d.median && d.median <= d.q3);
        assert!(d.q3 <= d.p95 && d.p95 <= d.p99 && d.p99 <= d.max);
        assert!(d.mean.lower <= d.mean.point && d.mean.point <= d.mean.upper);
        assert!(d.st_dev.lower <= d.st_dev.point + 1e-12);
    }

    #[test]
    fn empty_benchmark_is_an_error() {
        let params = fake_bench("x", vec![1.0]).0;
        let data = BenchData::new(params.meas.len(), false).unwrap();
        assert!(analyze_benchmark(&params, &data, 100).is_err());
    }

    #[test]
    fn baseline_defaults_to_fastest() {
        assert_eq!(select_baseline(None, &[3.0, 1.0, 2.0]), 1);
        assert_eq!(select_baseline(Some(2), &[3.0, 1.0, 2.0]), 2);
    }

    #[test]
    fn bundle_compares_against_baseline() {
        let (p1, d1, a1) = fake_bench("fast", vec![1.0, 1.1, 0.9, 1.0, 1.05, 0.95]);
        let (p2, d2, a2) = fake_bench("slow", vec![2.0, 2.2, 1.8, 2.0, 2.1, 1.9]);
        let params = [p1, p2];
        let data = [d1, d2];
        let analyses = [a1, a2];
        let view = SessionView {
            params: &params,
            data: &data,
            analyses: &analyses,
            var: None,
            groups: &[],
        };
        let bundle = analyze_meas(&view, 0, None, SortMode::Default, 200);
        assert_eq!(bundle.baseline, 0);
        assert!(bundle.speedups[0].is_none());
        let s = bundle.speedups[1].unwrap();
        assert!(s.point > 1.5 && s.point < 2.5, "speedup {}", s.point);
        assert!(bundle.mwu_p[1] < 0.05);
        assert_eq!(bundle.by_speed, vec![0, 1]);
        // Default without fixed baseline sorts by speed.
        assert_eq!(bundle.order, vec![0, 1]);
    }

    #[test]
    fn fixed_baseline_changes_order_mode() {
        let (p1, d1, a1) = fake_bench("fast", vec![1.0, 1.1, 0.9]);
        let (p2, d2, a2) = fake_bench("slow", vec![2.0, 2.2, 1.8]);
        let params = [p1, p2];
        let data = [d1, d2];
        let analyses = [a1, a2];
        let view = SessionView {
            params: &params,
            data: &data,
            analyses: &analyses,
            var: None,
            groups: &[],
        };
        let bundle = analyze_meas(&view, 0, Some(1), SortMode::Default, 100);
        assert_eq!(bundle.baseline, 1);
        // baseline-raw: baseline first, then input order.
        assert_eq!(bundle.order, vec![1, 0]);
    }

    #[test]
    fn groups_aggregate_speedups() {
        // Group A is uniformly 2x faster than group B across two values.
        let (pa1, da1, aa1) = fake_bench("a1", vec![1.0, 1.0, 1.0, 1.0]);
        let (pa2, da2, aa2) = fake_bench("a2", vec![2.0, 2.0, 2.0, 2.0]);
        let (pb1, db1, ab1) = fake_bench("b1", vec![2.0, 2.0, 2.0, 2.0]);
        let (pb2, db2, ab2) = fake_bench("b2", vec![4.0, 4.0, 4.0, 4.0]);
        let params = [pa1, pa2, pb1, pb2];
        let data = [da1, da2, db1, db2];
        let analyses = [aa1, aa2, ab1, ab2];
        let var = BenchVar {
            name: String::from("n"),
            values: vec![String::from("100"), String::from("200")],
        };
        let groups = [
            BenchGroup {
                name: String::from("A"),
                bench_idxs: vec![0, 1],
            },
            BenchGroup {
                name: String::from("B"),
                bench_idxs: vec![2, 3],
            },
        ];
        let view = SessionView {
            params: &params,
            data: &data,
            analyses: &analyses,
            var: Some(&var),
            groups: &groups,
        };
        let bundle = analyze_meas(&view, 0, None, SortMode::Raw, 100);
        assert_eq!(bundle.group_speedups.len(), 2);
        let b_vs_a = bundle.group_speedups[1];
        approx::assert_abs_diff_eq!(b_vs_a.avg.point, 2.0, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(b_vs_a.sum.point, 2.0, epsilon = 1e-9);
        assert_eq!(bundle.groups_by_avg_speed, vec![0, 1]);
        assert_eq!(bundle.groups_by_total_speed, vec![0, 1]);
        // Linear growth in the variable: some fit exists per group.
        assert!(bundle.ols[0].is_some());
        assert_eq!(bundle.ols[0].unwrap().c, 100.0);
    }
}
