//! Textual report printed after a session: per-benchmark distribution
//! summaries, the pairwise speed comparison, and group aggregates.

use std::collections::HashMap;
use std::io::Write;

use crossterm::style::Stylize;

use crate::analyze::{MeasAnalysis, SessionView};
use crate::meas::format_value;
use crate::stats::severity_label;

/// Non-fatal conditions get a styled `warning:` line on stderr.
pub fn warning(colored: bool, message: &str) {
    if colored {
        eprintln!("{} {message}", "warning:".yellow().bold());
    } else {
        eprintln!("warning: {message}");
    }
}

pub struct Report<'a> {
    pub view: &'a SessionView<'a>,
    pub bundles: &'a [MeasAnalysis],
    pub colored: bool,
}

impl<'a> Report<'a> {
    pub fn print(&self, out: &mut impl Write) -> std::io::Result<()> {
        let order = self
            .bundles
            .first()
            .map(|b| b.order.clone())
            .unwrap_or_else(|| (0..self.view.params.len()).collect());

        for (pos, &bench) in order.iter().enumerate() {
            self.print_bench(out, pos, bench)?;
        }
        for bundle in self.bundles {
            self.print_comparison(out, bundle)?;
        }
        if !self.view.groups.is_empty() {
            for bundle in self.bundles {
                self.print_groups(out, bundle)?;
            }
        }
        Ok(())
    }

    fn print_bench(&self, out: &mut impl Write, pos: usize, bench: usize) -> std::io::Result<()> {
        let params = &self.view.params[bench];
        let data = &self.view.data[bench];
        let analysis = &self.view.analyses[bench];

        let header = format!("Benchmark #{}> {}", pos + 1, params.name);
        if self.colored {
            writeln!(out, "{}", header.cyan().bold())?;
        } else {
            writeln!(out, "{header}")?;
        }

        let name_width = params
            .meas
            .iter()
            .map(|m| m.name.len())
            .max()
            .unwrap_or(0)
            .max(4);
        for (idx, spec) in params.meas.iter().enumerate() {
            let d = &analysis.distrs[idx];
            let u = &spec.units;
            writeln!(
                out,
                "  {:name_width$}: {} ± {} [{} ≤ {} ≤ {}] / {} runs",
                spec.name,
                format_value(u, d.mean.point),
                format_value(u, d.st_dev.point),
                format_value(u, d.min),
                format_value(u, d.median),
                format_value(u, d.max),
                data.run_count,
            )?;
            writeln!(
                out,
                "  {:name_width$}  mean CI [{}, {}], st dev {} CI [{}, {}]",
                "",
                format_value(u, d.mean.lower),
                format_value(u, d.mean.upper),
                format_value(u, d.st_dev.point),
                format_value(u, d.st_dev.lower),
                format_value(u, d.st_dev.upper),
            )?;
            writeln!(
                out,
                "  {:name_width$}  q1 {}, q3 {}, p5 {}, p95 {}",
                "",
                format_value(u, d.q1),
                format_value(u, d.q3),
                format_value(u, d.p5),
                format_value(u, d.p95),
            )?;
            let outl = &d.outliers;
            if outl.count() > 0 {
                let line = format!(
                    "  {:name_width$}  {} outliers ({} low severe, {} low mild, {} high mild, {} high severe), {} ({:.0}%) effect on st dev",
                    "",
                    outl.count(),
                    outl.low_severe,
                    outl.low_mild,
                    outl.high_mild,
                    outl.high_severe,
                    severity_label(outl.var_fraction),
                    outl.var_fraction * 100.0,
                );
                if self.colored {
                    writeln!(out, "{}", line.yellow())?;
                } else {
                    writeln!(out, "{line}")?;
                }
            }
        }
        self.print_exit_codes(out, data.run_count, &data.exit_codes)
    }

    fn print_exit_codes(
        &self,
        out: &mut impl Write,
        run_count: usize,
        exit_codes: &[i32],
    ) -> std::io::Result<()> {
        let failures = exit_codes.iter().filter(|&&c| c != 0).count();
        if failures == 0 {
            return Ok(());
        }
        let mut histogram = HashMap::<i32, usize>::new();
        for &code in exit_codes.iter().filter(|&&c| c != 0) {
            *histogram.entry(code).or_insert(0) += 1;
        }
        let mut codes: Vec<(i32, usize)> = histogram.into_iter().collect();
        codes.sort_by_key(|&(code, _)| code);
        let detail: Vec<String> = codes
            .iter()
            .map(|(code, times)| format!("{code}× {times}"))
            .collect();
        let line = format!(
            "  exit status: {} ok, {} failed [(code× times) {}]",
            run_count - failures,
            failures,
            detail.join(", ")
        );
        if self.colored {
            writeln!(out, "{}", line.red())
        } else {
            writeln!(out, "{line}")
        }
    }

    fn print_comparison(&self, out: &mut impl Write, bundle: &MeasAnalysis) -> std::io::Result<()> {
        if self.view.params.len() < 2 {
            return Ok(());
        }
        let spec = &self.view.params[0].meas[bundle.meas_idx];
        writeln!(out)?;
        writeln!(out, "Speed comparison ({}):", spec.name)?;
        let fastest = &self.view.params[bundle.baseline].name;
        if self.colored {
            writeln!(out, "  fastest: {}", fastest.as_str().green().bold())?;
        } else {
            writeln!(out, "  fastest: {fastest}")?;
        }
        for &bench in &bundle.order {
            let Some(s) = bundle.speedups[bench] else {
                continue;
            };
            let relation = if s.is_slower { "slower" } else { "faster" };
            writeln!(
                out,
                "  {:.2} ± {:.2} times {relation} than {} (MWU p={:.3}, t p={:.3})",
                s.point, s.err, self.view.params[bench].name, bundle.mwu_p[bench], bundle.ttest_p[bench],
            )?;
        }
        Ok(())
    }

    fn print_groups(&self, out: &mut impl Write, bundle: &MeasAnalysis) -> std::io::Result<()> {
        let groups = self.view.groups;
        if groups.len() < 2 && bundle.ols.iter().all(Option::is_none) {
            return Ok(());
        }
        let spec = &self.view.params[0].meas[bundle.meas_idx];
        writeln!(out)?;
        writeln!(out, "Groups ({}):", spec.name)?;
        for (g, group) in groups.iter().enumerate() {
            if groups.len() >= 2 {
                if let Some(gs) = bundle.group_speedups.get(g) {
                    writeln!(
                        out,
                        "  {}: avg {:.2} ± {:.2}x, by total {:.2} ± {:.2}x",
                        group.name, gs.avg.point, gs.avg.err, gs.sum.point, gs.sum.err,
                    )?;
                }
            }
            if let Some(Some(fit)) = bundle.ols.get(g) {
                writeln!(
                    out,
                    "  {}: complexity {} (rms {:.3})",
                    group.name,
                    fit.complexity.label(),
                    fit.rms,
                )?;
            }
        }
        Ok(())
    }
}
