//! Statistics kernel: bootstrap estimates, outlier analysis, pairwise tests
//! and complexity fitting.
//!
//! Sample standard deviation uses the `n − 1` denominator throughout.

use crate::rng::Pcg32;

/// Point estimate with a 95% bootstrap confidence interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

pub fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Residual sum of squares around the sample mean.
fn rss(xs: &[f64]) -> f64 {
    let m = mean(xs);
    xs.iter().map(|x| (x - m) * (x - m)).sum()
}

pub fn st_dev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    (rss(xs) / (xs.len() - 1) as f64).sqrt()
}

/// Percentile of a sorted sample, linear interpolation between closest
/// ranks. `q` in [0, 1].
pub fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

fn resample(xs: &[f64], rng: &mut Pcg32, out: &mut Vec<f64>) {
    out.clear();
    for _ in 0..xs.len() {
        out.push(xs[rng.below(xs.len())]);
    }
}

/// Bootstrap estimate of the mean: point on the original sample, interval
/// at the 2.5/97.5 percentiles of `nresamp` resampled means.
pub fn bootstrap_mean(xs: &[f64], nresamp: usize, rng: &mut Pcg32) -> Estimate {
    let point = mean(xs);
    if xs.len() < 2 {
        return Estimate {
            point,
            lower: point,
            upper: point,
        };
    }
    let mut stats = Vec::with_capacity(nresamp);
    let mut buf = Vec::with_capacity(xs.len());
    for _ in 0..nresamp {
        resample(xs, rng, &mut buf);
        stats.push(mean(&buf));
    }
    stats.sort_by(|a, b| a.partial_cmp(b).unwrap());
    Estimate {
        point,
        lower: percentile_sorted(&stats, 0.025),
        upper: percentile_sorted(&stats, 0.975),
    }
}

/// Bootstrap estimate of the sample standard deviation. The interval comes
/// from percentiles of the resampled residual sums of squares, converted
/// with the `n − 1` denominator.
pub fn bootstrap_st_dev(xs: &[f64], nresamp: usize, rng: &mut Pcg32) -> Estimate {
    let point = st_dev(xs);
    if xs.len() < 2 {
        return Estimate {
            point,
            lower: point,
            upper: point,
        };
    }
    let mut stats = Vec::with_capacity(nresamp);
    let mut buf = Vec::with_capacity(xs.len());
    for _ in 0..nresamp {
        resample(xs, rng, &mut buf);
        stats.push(rss(&buf));
    }
    stats.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let denom = (xs.len() - 1) as f64;
    Estimate {
        point,
        lower: (percentile_sorted(&stats, 0.025) / denom).sqrt(),
        upper: (percentile_sorted(&stats, 0.975) / denom).sqrt(),
    }
}

/// Tukey outlier tally over a sorted sample. Thresholds are ordered
/// low-severe, low-mild, high-mild, high-severe; each sample lands in at
/// most one class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Outliers {
    pub low_severe: usize,
    pub low_mild: usize,
    pub high_mild: usize,
    pub high_severe: usize,
    pub thresholds: [f64; 4],
    /// Fraction of variance attributable to outliers.
    pub var_fraction: f64,
}

impl Outliers {
    pub fn count(&self) -> usize {
        self.low_severe + self.low_mild + self.high_mild + self.high_severe
    }
}

pub fn classify_outliers(sorted: &[f64]) -> Outliers {
    let q1 = percentile_sorted(sorted, 0.25);
    let q3 = percentile_sorted(sorted, 0.75);
    let iqr = q3 - q1;
    let thresholds = [
        q1 - 3.0 * iqr,
        q1 - 1.5 * iqr,
        q3 + 1.5 * iqr,
        q3 + 3.0 * iqr,
    ];
    let mut out = Outliers {
        thresholds,
        ..Outliers::default()
    };
    for &x in sorted {
        if x < thresholds[0] {
            out.low_severe += 1;
        } else if x < thresholds[1] {
            out.low_mild += 1;
        } else if x > thresholds[3] {
            out.high_severe += 1;
        } else if x > thresholds[2] {
            out.high_mild += 1;
        }
    }
    out
}

/// Fraction of the sample variance explained by outliers, after the
/// Criterion-lineage model.
pub fn outlier_variance(mean: f64, st_dev: f64, n: usize) -> f64 {
    let a = n as f64;
    let sigma_b = st_dev;
    if sigma_b == 0.0 {
        return 0.0;
    }
    let mu_a = mean / a;
    let mu_g_min = mu_a / 2.0;
    let sigma_g = (mu_g_min / 4.0).min(sigma_b / a.sqrt());
    let sigma_b2 = sigma_b * sigma_b;
    let sigma_g2 = sigma_g * sigma_g;

    let c_max = |x: f64| -> f64 {
        let k = mu_a - x;
        let d = k * k;
        let ad = a * d;
        let k0 = -a * ad;
        let k1 = sigma_b2 - a * sigma_g2 + ad;
        let det = k1 * k1 - 4.0 * sigma_g2 * k0;
        (-2.0 * k0 / (k1 + det.sqrt())).floor()
    };

    let var_out = |c: f64| -> f64 {
        let ac = a - c;
        (ac / a) * (sigma_b2 - ac * sigma_g2)
    };

    let c = c_max(0.0).min(c_max(mu_g_min));
    (var_out(1.0).min(var_out(c)) / sigma_b2).clamp(0.0, 1.0)
}

pub fn severity_label(var_fraction: f64) -> &'static str {
    if var_fraction < 0.01 {
        "no"
    } else if var_fraction < 0.1 {
        "slight"
    } else if var_fraction < 0.5 {
        "moderate"
    } else {
        "severe"
    }
}

/// Standard normal CDF via the Abramowitz & Stegun erf approximation
/// (absolute error below 1.5e-7, plenty for p-values).
fn normal_cdf(z: f64) -> f64 {
    let x = z / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let erf = 1.0 - poly * (-x * x).exp();
    let erf = if x < 0.0 { -erf } else { erf };
    0.5 * (1.0 + erf)
}

/// Two-tailed Mann–Whitney U through the normal approximation with
/// tie-averaged ranks and continuity correction 0.5.
///
/// The approximation is used for all sample sizes (no exact table for tiny
/// samples); the result is clamped to [0, 1].
pub fn mann_whitney_u(a: &[f64], b: &[f64]) -> f64 {
    let n1 = a.len() as f64;
    let n2 = b.len() as f64;
    let mut merged: Vec<(f64, bool)> = a
        .iter()
        .map(|&x| (x, true))
        .chain(b.iter().map(|&x| (x, false)))
        .collect();
    merged.sort_by(|x, y| x.0.partial_cmp(&y.0).unwrap());

    // Average ranks across ties.
    let mut r1 = 0.0;
    let mut i = 0;
    while i < merged.len() {
        let mut j = i;
        while j < merged.len() && merged[j].0 == merged[i].0 {
            j += 1;
        }
        let avg_rank = (i + 1 + j) as f64 / 2.0;
        for item in &merged[i..j] {
            if item.1 {
                r1 += avg_rank;
            }
        }
        i = j;
    }

    let u1 = r1 - n1 * (n1 + 1.0) / 2.0;
    let mu = n1 * n2 / 2.0;
    let sigma = (n1 * n2 * (n1 + n2 + 1.0) / 12.0).sqrt();
    if sigma == 0.0 {
        return 1.0;
    }
    let z = ((u1 - mu).abs() - 0.5) / sigma;
    (2.0 * (1.0 - normal_cdf(z))).clamp(0.0, 1.0)
}

fn welch_t(a: &[f64], b: &[f64]) -> f64 {
    let va = st_dev(a).powi(2) / a.len() as f64;
    let vb = st_dev(b).powi(2) / b.len() as f64;
    let denom = (va + vb).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (mean(a) - mean(b)) / denom
}

/// Bootstrapped Welch t-test: the observed statistic is compared against
/// its null distribution obtained by shifting both samples to the common
/// overall mean and resampling each `nresamp` times.
pub fn t_test_boot(a: &[f64], b: &[f64], nresamp: usize, rng: &mut Pcg32) -> f64 {
    let t_obs = welch_t(a, b).abs();
    let grand = (a.iter().sum::<f64>() + b.iter().sum::<f64>()) / (a.len() + b.len()) as f64;
    let ma = mean(a);
    let mb = mean(b);
    let a0: Vec<f64> = a.iter().map(|x| x - ma + grand).collect();
    let b0: Vec<f64> = b.iter().map(|x| x - mb + grand).collect();

    let mut hits = 0usize;
    let mut ra = Vec::with_capacity(a.len());
    let mut rb = Vec::with_capacity(b.len());
    for _ in 0..nresamp {
        resample(&a0, rng, &mut ra);
        resample(&b0, rng, &mut rb);
        if welch_t(&ra, &rb).abs() >= t_obs {
            hits += 1;
        }
    }
    hits as f64 / nresamp as f64
}

/// Ratio of two means, oriented so that `point >= 1`, with propagated
/// relative error. `is_slower` is set when A is the slower side. The
/// reciprocal form carries the same relative error.
#[derive(Debug, Clone, Copy)]
pub struct Speedup {
    pub point: f64,
    pub err: f64,
    pub is_slower: bool,
    pub inv_point: f64,
    pub inv_err: f64,
}

pub fn speedup(mu_a: f64, sigma_a: f64, mu_b: f64, sigma_b: f64) -> Speedup {
    let rel = ((sigma_a / mu_a).powi(2) + (sigma_b / mu_b).powi(2)).sqrt();
    let (point, is_slower) = if mu_a < mu_b {
        (mu_b / mu_a, false)
    } else {
        (mu_a / mu_b, true)
    };
    let inv_point = 1.0 / point;
    Speedup {
        point,
        err: point * rel,
        is_slower,
        inv_point,
        inv_err: inv_point * rel,
    }
}

/// The fixed fitting-curve family, ordered so that ties in fit quality
/// resolve to the simplest shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    O1,
    OLogN,
    ON,
    ONLogN,
    ON2,
    ON3,
}

impl Complexity {
    pub fn label(&self) -> &'static str {
        match self {
            Complexity::O1 => "O(1)",
            Complexity::OLogN => "O(log N)",
            Complexity::ON => "O(N)",
            Complexity::ONLogN => "O(N log N)",
            Complexity::ON2 => "O(N^2)",
            Complexity::ON3 => "O(N^3)",
        }
    }

    const ALL: [Complexity; 6] = [
        Complexity::O1,
        Complexity::OLogN,
        Complexity::ON,
        Complexity::ONLogN,
        Complexity::ON2,
        Complexity::ON3,
    ];

    fn curve(&self, n: f64) -> f64 {
        // log2 of sub-unit arguments is flattened to zero so the shifted
        // first point stays finite.
        let log2 = if n < 1.0 { 0.0 } else { n.log2() };
        match self {
            Complexity::O1 => 1.0,
            Complexity::OLogN => log2,
            Complexity::ON => n,
            Complexity::ONLogN => n * log2,
            Complexity::ON2 => n * n,
            Complexity::ON3 => n * n * n,
        }
    }
}

/// One-parameter least-squares fit `y ≈ a·g(x − c) + b` with `c = min(x)`,
/// `b = min(y)`, over the whole curve family; the winner has the smallest
/// normalized RMS. The complexity is an advisory label only.
#[derive(Debug, Clone, Copy)]
pub struct Ols {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub rms: f64,
    pub complexity: Complexity,
}

pub fn ols_fit(x: &[f64], y: &[f64]) -> Ols {
    debug_assert_eq!(x.len(), y.len());
    let c = x.iter().copied().fold(f64::INFINITY, f64::min);
    let b = y.iter().copied().fold(f64::INFINITY, f64::min);
    let shifted: Vec<f64> = y.iter().map(|v| v - b).collect();
    let y_mean = mean(&shifted);

    let mut best: Option<Ols> = None;
    for family in Complexity::ALL {
        let g: Vec<f64> = x.iter().map(|&v| family.curve(v - c)).collect();
        let gg: f64 = g.iter().map(|v| v * v).sum();
        let a = if gg == 0.0 {
            0.0
        } else {
            g.iter().zip(&shifted).map(|(gi, yi)| gi * yi).sum::<f64>() / gg
        };
        let mse = g
            .iter()
            .zip(&shifted)
            .map(|(gi, yi)| {
                let r = yi - a * gi;
                r * r
            })
            .sum::<f64>()
            / x.len() as f64;
        let rms = if y_mean == 0.0 {
            0.0
        } else {
            mse.sqrt() / y_mean
        };
        let candidate = Ols {
            a,
            b,
            c,
            rms,
            complexity: family,
        };
        if best.as_ref().map_or(true, |prev| rms < prev.rms) {
            best = Some(candidate);
        }
    }
    best.unwrap()
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_ulps_eq};

    fn rng() -> Pcg32 {
        Pcg32::new(0xcafe, 0xbabe)
    }

    #[test]
    fn mean_and_st_dev_use_sample_denominator() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_ulps_eq!(mean(&xs), 5.0);
        // Population sigma of this classic set is 2; sample uses n-1.
        assert_ulps_eq!(st_dev(&xs), (32.0f64 / 7.0).sqrt());
    }

    #[test]
    fn percentiles_interpolate() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_ulps_eq!(percentile_sorted(&sorted, 0.0), 1.0);
        assert_ulps_eq!(percentile_sorted(&sorted, 1.0), 4.0);
        assert_ulps_eq!(percentile_sorted(&sorted, 0.5), 2.5);
        assert_ulps_eq!(percentile_sorted(&sorted, 0.25), 1.75);
    }

    #[test]
    fn bootstrap_interval_brackets_point() {
        let xs: Vec<f64> = (0..40).map(|i| 1.0 + (i % 7) as f64 * 0.01).collect();
        let mut r = rng();
        let est = bootstrap_mean(&xs, 1000, &mut r);
        assert!(est.lower <= est.point);
        assert!(est.point <= est.upper);
        let sd = bootstrap_st_dev(&xs, 1000, &mut r);
        assert!(sd.lower <= sd.point + 1e-12);
        assert!(sd.point <= sd.upper + 1e-12);
    }

    #[test]
    fn singleton_sample_collapses_interval() {
        let mut r = rng();
        let est = bootstrap_mean(&[3.5], 100, &mut r);
        assert_eq!((est.lower, est.point, est.upper), (3.5, 3.5, 3.5));
        let sd = bootstrap_st_dev(&[3.5], 100, &mut r);
        assert_eq!((sd.lower, sd.point, sd.upper), (0.0, 0.0, 0.0));
    }

    #[test]
    fn outlier_classes_do_not_double_count() {
        let mut xs: Vec<f64> = (0..20).map(|i| 10.0 + i as f64 * 0.1).collect();
        xs.push(100.0);
        xs.insert(0, -50.0);
        let out = classify_outliers(&xs);
        assert!(out.count() <= xs.len());
        assert_eq!(out.low_severe, 1);
        assert_eq!(out.high_severe, 1);
        assert_eq!(out.low_mild + out.high_mild, 0);
    }

    #[test]
    fn tight_sample_has_no_outliers() {
        let xs = [1.0, 1.01, 1.02, 1.03, 1.04, 1.05, 1.06, 1.07];
        let out = classify_outliers(&xs);
        assert_eq!(out.count(), 0);
    }

    #[test]
    fn outlier_variance_labels() {
        assert_eq!(severity_label(0.001), "no");
        assert_eq!(severity_label(0.05), "slight");
        assert_eq!(severity_label(0.3), "moderate");
        assert_eq!(severity_label(0.7), "severe");
    }

    #[test]
    fn outlier_variance_grows_with_contamination() {
        let n = 30;
        let clean = outlier_variance(1.0, 0.001, n);
        let dirty = outlier_variance(1.0, 0.5, n);
        assert!(clean <= dirty);
        assert!((0.0..=1.0).contains(&clean));
        assert!((0.0..=1.0).contains(&dirty));
    }

    #[test]
    fn mwu_identical_samples_give_p_one() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_ulps_eq!(mann_whitney_u(&xs, &xs), 1.0);
    }

    #[test]
    fn mwu_separated_samples_give_small_p() {
        let a: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let b: Vec<f64> = (0..20).map(|i| 1000.0 + i as f64).collect();
        let p = mann_whitney_u(&a, &b);
        assert!(p < 1e-6, "p = {p}");
    }

    #[test]
    fn mwu_is_symmetric() {
        let a = [1.0, 3.0, 5.0, 7.0, 7.0];
        let b = [2.0, 4.0, 6.0, 7.0, 9.0];
        assert_abs_diff_eq!(
            mann_whitney_u(&a, &b),
            mann_whitney_u(&b, &a),
            epsilon = 1e-12
        );
    }

    #[test]
    fn t_test_detects_separation() {
        let a: Vec<f64> = (0..25).map(|i| 1.0 + (i % 5) as f64 * 0.01).collect();
        let b: Vec<f64> = (0..25).map(|i| 2.0 + (i % 5) as f64 * 0.01).collect();
        let mut r = rng();
        let p = t_test_boot(&a, &b, 1000, &mut r);
        assert!(p < 0.01, "p = {p}");
    }

    #[test]
    fn t_test_same_distribution_is_insignificant() {
        let a: Vec<f64> = (0..25).map(|i| 1.0 + (i % 7) as f64 * 0.05).collect();
        let b: Vec<f64> = (0..25).map(|i| 1.0 + ((i + 3) % 7) as f64 * 0.05).collect();
        let mut r = rng();
        let p = t_test_boot(&a, &b, 1000, &mut r);
        assert!(p > 0.05, "p = {p}");
    }

    #[test]
    fn speedup_orientation_and_reciprocal() {
        let s = speedup(1.0, 0.1, 2.0, 0.2);
        assert!(!s.is_slower);
        assert_ulps_eq!(s.point, 2.0);
        assert_abs_diff_eq!(s.point * s.inv_point, 1.0, epsilon = 1e-12);
        assert_ulps_eq!(s.err, 2.0 * (0.01f64 + 0.01).sqrt());

        let r = speedup(2.0, 0.2, 1.0, 0.1);
        assert!(r.is_slower);
        assert_ulps_eq!(r.point, s.point);
    }

    #[test]
    fn ols_picks_linear_for_linear_data() {
        let x = [100.0, 200.0, 300.0, 400.0, 500.0];
        let y: Vec<f64> = x.iter().map(|v| 3.0 * v + 17.0).collect();
        let fit = ols_fit(&x, &y);
        assert_eq!(fit.complexity, Complexity::ON);
        assert_ulps_eq!(fit.c, 100.0);
        assert_ulps_eq!(fit.b, 317.0);
        assert!(fit.rms < 1e-9);
    }

    #[test]
    fn ols_picks_quadratic_for_quadratic_data() {
        let x = [10.0, 20.0, 40.0, 80.0, 160.0];
        let y: Vec<f64> = x
            .iter()
            .map(|v| 0.5 * (v - 10.0) * (v - 10.0) + 2.0)
            .collect();
        let fit = ols_fit(&x, &y);
        assert_eq!(fit.complexity, Complexity::ON2);
        assert!(fit.rms < 1e-9);
    }

    #[test]
    fn ols_constant_data_is_constant() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [5.0, 5.0, 5.0, 5.0];
        let fit = ols_fit(&x, &y);
        assert_eq!(fit.complexity, Complexity::O1);
    }

    #[test]
    fn ols_nlogn_like_data_stays_near_linear_families() {
        let x: [f64; 6] = [128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0];
        let y: Vec<f64> = x.iter().map(|v| v * v.log2() * 0.001 + 1.0).collect();
        let fit = ols_fit(&x, &y);
        assert!(
            matches!(fit.complexity, Complexity::ONLogN | Complexity::ON),
            "got {:?}",
            fit.complexity
        );
    }
}
