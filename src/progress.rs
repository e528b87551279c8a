//! Lock-free progress reporting.
//!
//! Workers publish per-benchmark state through atomics only (`f64` values
//! travel as `u64` bit patterns since there is no atomic double); a single
//! reporter thread polls the records every ~100 ms and redraws the bar
//! block. Worker error text goes into per-worker "output anchors" instead
//! of stderr so a message never tears a half-drawn frame.

use std::io::Write;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossterm::style::Stylize;

const BAR_WIDTH: usize = 40;
const NAME_LIMIT: usize = 40;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the bar's trailing field shows.
#[derive(Debug, Clone, Copy)]
pub enum ProgressMode {
    /// `runs/total eta T`.
    ExactRuns(u64),
    /// `elapsed/limit`.
    TimeLimit(f64),
}

/// One benchmark's published state. Written by the owning worker with
/// `Release` stores; the reporter reads with `Acquire` loads. A full fence
/// orders every prior store before `finished`/`aborted` is raised.
#[derive(Debug, Default)]
pub struct ProgressRecord {
    bar_percent: AtomicU64,
    metric: AtomicU64,
    time_passed: AtomicU64,
    owner: AtomicUsize,
    finished: AtomicBool,
    aborted: AtomicBool,
}

impl ProgressRecord {
    pub fn mark_started(&self, worker: usize) {
        self.owner.store(worker, Ordering::Release);
    }

    pub fn publish(&self, percent: f64, metric: f64, time_passed: f64) {
        self.bar_percent.store(percent.to_bits(), Ordering::Release);
        self.metric.store(metric.to_bits(), Ordering::Release);
        self.time_passed
            .store(time_passed.to_bits(), Ordering::Release);
    }

    pub fn mark_finished(&self) {
        self.bar_percent.store(100f64.to_bits(), Ordering::Release);
        fence(Ordering::SeqCst);
        self.finished.store(true, Ordering::Release);
    }

    pub fn mark_aborted(&self) {
        fence(Ordering::SeqCst);
        self.aborted.store(true, Ordering::Release);
    }

    fn percent(&self) -> f64 {
        f64::from_bits(self.bar_percent.load(Ordering::Acquire))
    }

    fn metric_value(&self) -> f64 {
        f64::from_bits(self.metric.load(Ordering::Acquire))
    }

    fn elapsed(&self) -> f64 {
        f64::from_bits(self.time_passed.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn owner(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }
}

/// Shared between workers and the reporter thread.
pub struct Progress {
    pub records: Vec<ProgressRecord>,
    names: Vec<String>,
    mode: ProgressMode,
    /// One slot per worker; only the first message of an error episode is
    /// kept.
    anchors: Vec<Mutex<Option<String>>>,
    colored: bool,
}

impl Progress {
    pub fn new(names: Vec<String>, mode: ProgressMode, workers: usize, colored: bool) -> Self {
        let records = names.iter().map(|_| ProgressRecord::default()).collect();
        let anchors = (0..workers).map(|_| Mutex::new(None)).collect();
        Progress {
            records,
            names,
            mode,
            anchors,
            colored,
        }
    }

    /// Routes a worker's error text to its anchor. Later messages of the
    /// same episode are dropped.
    pub fn set_anchor(&self, worker: usize, message: String) {
        let mut slot = self.anchors[worker].lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    fn anchor(&self, worker: usize) -> Option<String> {
        self.anchors[worker].lock().unwrap().clone()
    }

    /// Row labels: real names, or `A`, `B`, … when the longest name would
    /// blow up the row.
    fn labels(&self) -> Vec<String> {
        let longest = self.names.iter().map(|n| n.len()).max().unwrap_or(0);
        if longest <= NAME_LIMIT {
            self.names.clone()
        } else {
            (0..self.names.len()).map(letter_label).collect()
        }
    }
}

fn letter_label(mut idx: usize) -> String {
    let mut label = String::new();
    loop {
        label.insert(0, (b'A' + (idx % 26) as u8) as char);
        idx /= 26;
        if idx == 0 {
            return label;
        }
        idx -= 1;
    }
}

/// Per-row reporter-local state for ETA smoothing: while the run count has
/// not moved since the last poll, the displayed ETA just counts down.
#[derive(Clone, Copy)]
struct RowState {
    last_runs: f64,
    last_eta: f64,
    last_update: Instant,
}

/// Reporter loop. Returns once `stop` is raised (a final frame is drawn
/// first). `out` is normally stderr.
pub fn reporter_loop(progress: &Progress, stop: &AtomicBool, out: &mut impl Write) {
    let labels = progress.labels();
    let width = labels.iter().map(|l| l.len()).max().unwrap_or(0);
    let mut rows = vec![
        RowState {
            last_runs: -1.0,
            last_eta: 0.0,
            last_update: Instant::now(),
        };
        progress.records.len()
    ];
    let mut drawn = false;

    loop {
        let stopping = stop.load(Ordering::Acquire);
        draw_frame(progress, &labels, width, &mut rows, &mut drawn, out);
        if stopping {
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn draw_frame(
    progress: &Progress,
    labels: &[String],
    width: usize,
    rows: &mut [RowState],
    drawn: &mut bool,
    out: &mut impl Write,
) {
    use crossterm::{cursor, terminal};

    if *drawn {
        let _ = crossterm::queue!(out, cursor::MoveUp(progress.records.len() as u16));
    }
    for (idx, record) in progress.records.iter().enumerate() {
        let _ = crossterm::queue!(
            out,
            terminal::Clear(terminal::ClearType::CurrentLine),
            cursor::MoveToColumn(0)
        );
        let line = render_row(progress, record, &labels[idx], width, &mut rows[idx]);
        let _ = write!(out, "{line}\r\n");
    }
    let _ = out.flush();
    *drawn = true;
}

fn render_row(
    progress: &Progress,
    record: &ProgressRecord,
    label: &str,
    width: usize,
    row: &mut RowState,
) -> String {
    if record.is_aborted() {
        let message = progress
            .anchor(record.owner())
            .unwrap_or_else(|| String::from("benchmark failed"));
        let message = message.lines().next().unwrap_or("").to_string();
        return if progress.colored {
            format!("{label:width$} {}", message.red())
        } else {
            format!("{label:width$} {message}")
        };
    }

    let percent = record.percent().clamp(0.0, 100.0);
    let filled = (percent / 100.0 * BAR_WIDTH as f64).round() as usize;
    let bar: String = std::iter::repeat('#')
        .take(filled)
        .chain(std::iter::repeat('-').take(BAR_WIDTH - filled))
        .collect();
    let bar = if progress.colored {
        format!("{}", bar.cyan())
    } else {
        bar
    };

    let trailer = match progress.mode {
        ProgressMode::ExactRuns(total) => {
            let runs = record.metric_value();
            let elapsed = record.elapsed();
            let eta = if record.is_finished() {
                0.0
            } else if runs != row.last_runs && runs > 0.0 {
                let eta = (total as f64 - runs) * elapsed / runs;
                row.last_runs = runs;
                row.last_eta = eta;
                row.last_update = Instant::now();
                eta
            } else {
                (row.last_eta - row.last_update.elapsed().as_secs_f64()).max(0.0)
            };
            if runs <= 0.0 {
                format!("{}/{} eta ?", runs as u64, total)
            } else {
                format!("{}/{} eta {:.1} s", runs as u64, total, eta)
            }
        }
        ProgressMode::TimeLimit(limit) => {
            format!("{:.1}/{:.1} s", record.metric_value(), limit)
        }
    };

    if record.is_finished() {
        format!("{label:width$} [{bar}] done")
    } else {
        format!("{label:width$} [{bar}] {trailer}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn f64_survives_the_bit_roundtrip() {
        let record = ProgressRecord::default();
        record.publish(73.5, 12.0, 1.25);
        assert_eq!(record.percent(), 73.5);
        assert_eq!(record.metric_value(), 12.0);
        assert_eq!(record.elapsed(), 1.25);
    }

    #[test]
    fn finish_raises_flag_after_percent() {
        let record = ProgressRecord::default();
        record.publish(40.0, 4.0, 0.5);
        record.mark_finished();
        assert!(record.is_finished());
        assert_eq!(record.percent(), 100.0);
    }

    #[test]
    fn letter_labels_extend_past_z() {
        assert_eq!(letter_label(0), "A");
        assert_eq!(letter_label(25), "Z");
        assert_eq!(letter_label(26), "AA");
        assert_eq!(letter_label(27), "AB");
    }

    #[test]
    fn long_names_are_abbreviated() {
        let long = "x".repeat(60);
        let progress = Progress::new(
            vec![String::from("short"), long],
            ProgressMode::ExactRuns(5),
            1,
            false,
        );
        assert_eq!(progress.labels(), vec!["A", "B"]);

        let progress = Progress::new(
            vec![String::from("short"), String::from("also short")],
            ProgressMode::ExactRuns(5),
            1,
            false,
        );
        assert_eq!(progress.labels(), vec!["short", "also short"]);
    }

    #[test]
    fn anchor_keeps_first_message() {
        let progress = Progress::new(vec![String::from("b")], ProgressMode::TimeLimit(1.0), 2, false);
        progress.set_anchor(1, String::from("first"));
        progress.set_anchor(1, String::from("second"));
        assert_eq!(progress.anchor(1).as_deref(), Some("first"));
        assert_eq!(progress.anchor(0), None);
    }

    #[test]
    fn aborted_row_shows_anchor_text() {
        let progress = Progress::new(vec![String::from("b")], ProgressMode::TimeLimit(1.0), 1, false);
        progress.set_anchor(0, String::from("error: boom"));
        progress.records[0].mark_started(0);
        progress.records[0].mark_aborted();
        let mut row = RowState {
            last_runs: -1.0,
            last_eta: 0.0,
            last_update: Instant::now(),
        };
        let line = render_row(&progress, &progress.records[0], "b", 1, &mut row);
        assert!(line.contains("error: boom"));
    }

    #[test]
    fn exact_mode_row_shows_counts() {
        let progress = Progress::new(vec![String::from("b")], ProgressMode::ExactRuns(20), 1, false);
        progress.records[0].publish(50.0, 10.0, 2.0);
        let mut row = RowState {
            last_runs: -1.0,
            last_eta: 0.0,
            last_update: Instant::now(),
        };
        let line = render_row(&progress, &progress.records[0], "b", 1, &mut row);
        assert!(line.contains("10/20"), "{line}");
        assert!(line.contains("eta 2.0 s"), "{line}");
        // Unchanged runs count: the eta only counts down.
        let line = render_row(&progress, &progress.records[0], "b", 1, &mut row);
        assert!(line.contains("eta"), "{line}");
    }
}
