//! Measurement descriptors: what gets sampled for every benchmark run and
//! how values are labeled and printed.

use num_format::ToFormattedString;
use strum::{AsRefStr, EnumIter};

/// Stable measurement identifiers. Everything except `Custom` is filled in
/// directly by the sample collector; `Custom` values are extracted from
/// captured stdout after the run loop finishes.
#[derive(Debug, Hash, Eq, PartialEq, Copy, Clone, EnumIter, AsRefStr)]
pub enum MeasKind {
    #[strum(serialize = "wall")]
    Wall,
    #[strum(serialize = "utime")]
    UTime,
    #[strum(serialize = "stime")]
    STime,
    #[strum(serialize = "maxrss")]
    MaxRss,
    #[strum(serialize = "minflt")]
    MinFlt,
    #[strum(serialize = "majflt")]
    MajFlt,
    #[strum(serialize = "nvcsw")]
    NvCsw,
    #[strum(serialize = "nivcsw")]
    NiVCsw,
    #[strum(serialize = "cycles")]
    Cycles,
    #[strum(serialize = "instructions")]
    Instructions,
    #[strum(serialize = "branches")]
    Branches,
    #[strum(serialize = "branch-misses")]
    BranchMisses,
    #[strum(serialize = "custom")]
    Custom,
}

impl MeasKind {
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "wall" => MeasKind::Wall,
            "utime" => MeasKind::UTime,
            "stime" => MeasKind::STime,
            "maxrss" => MeasKind::MaxRss,
            "minflt" => MeasKind::MinFlt,
            "majflt" => MeasKind::MajFlt,
            "nvcsw" => MeasKind::NvCsw,
            "nivcsw" => MeasKind::NiVCsw,
            "cycles" => MeasKind::Cycles,
            "instructions" => MeasKind::Instructions,
            "branches" => MeasKind::Branches,
            "branch-misses" => MeasKind::BranchMisses,
            _ => return None,
        })
    }

    /// Whether collecting this measurement needs the perf counter adapter.
    pub fn is_pmc(&self) -> bool {
        matches!(
            self,
            MeasKind::Cycles | MeasKind::Instructions | MeasKind::Branches | MeasKind::BranchMisses
        )
    }

    fn default_units(&self) -> Units {
        match self {
            MeasKind::Wall | MeasKind::UTime | MeasKind::STime => Units::Seconds,
            MeasKind::MaxRss => Units::Bytes,
            _ => Units::None,
        }
    }
}

/// Units attached to a measurement. Anything that is not one of the known
/// tokens becomes a freeform label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Units {
    Seconds,
    Millis,
    Micros,
    Nanos,
    Bytes,
    Kilobytes,
    Megabytes,
    Gigabytes,
    None,
    Custom(String),
}

impl Units {
    pub fn parse(s: &str) -> Units {
        match s {
            "s" => Units::Seconds,
            "ms" => Units::Millis,
            "us" => Units::Micros,
            "ns" => Units::Nanos,
            "b" => Units::Bytes,
            "kb" => Units::Kilobytes,
            "mb" => Units::Megabytes,
            "gb" => Units::Gigabytes,
            "none" => Units::None,
            other => Units::Custom(String::from(other)),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Units::Seconds => "s",
            Units::Millis => "ms",
            Units::Micros => "us",
            Units::Nanos => "ns",
            Units::Bytes => "b",
            Units::Kilobytes => "kb",
            Units::Megabytes => "mb",
            Units::Gigabytes => "gb",
            Units::None => "",
            Units::Custom(s) => s.as_str(),
        }
    }

}

/// One configured measurement of a benchmark.
///
/// `primary` links a secondary measurement (utime/stime annotate wall) to
/// the index of the measurement it describes. `cmd` is the extractor shell
/// pipeline of a custom measurement; `cat` means "parse the first real
/// number found in stdout".
#[derive(Debug, Clone)]
pub struct MeasSpec {
    pub kind: MeasKind,
    pub name: String,
    pub units: Units,
    pub cmd: Option<String>,
    pub primary: Option<usize>,
}

impl MeasSpec {
    pub fn builtin(kind: MeasKind) -> Self {
        MeasSpec {
            kind,
            name: String::from(kind.as_ref()),
            units: kind.default_units(),
            cmd: None,
            primary: None,
        }
    }

    pub fn secondary_of(kind: MeasKind, primary: usize) -> Self {
        MeasSpec {
            primary: Some(primary),
            ..MeasSpec::builtin(kind)
        }
    }

    pub fn custom(name: &str, units: Units, cmd: &str) -> Self {
        MeasSpec {
            kind: MeasKind::Custom,
            name: String::from(name),
            units,
            cmd: Some(String::from(cmd)),
            primary: None,
        }
    }

    pub fn is_custom(&self) -> bool {
        self.kind == MeasKind::Custom
    }

    pub fn is_secondary(&self) -> bool {
        self.primary.is_some()
    }
}

/// The default measurement set: wall clock as primary, CPU times annotating
/// it. `--no-default-meas` suppresses this whole block.
pub fn default_meas_list() -> Vec<MeasSpec> {
    vec![
        MeasSpec::builtin(MeasKind::Wall),
        MeasSpec::secondary_of(MeasKind::UTime, 0),
        MeasSpec::secondary_of(MeasKind::STime, 0),
    ]
}

/// Human-readable value with the measurement's units, auto-scaled for time
/// and byte quantities, thousands-separated for bare counts.
pub fn format_value(units: &Units, val: f64) -> String {
    match units {
        Units::Seconds => format_seconds(val),
        Units::Millis => format!("{} ms", round3(val)),
        Units::Micros => format!("{} us", round3(val)),
        Units::Nanos => format!("{} ns", round3(val)),
        Units::Bytes => format_bytes(val),
        Units::Kilobytes => format_bytes(val * 1024.0),
        Units::Megabytes => format_bytes(val * 1024.0 * 1024.0),
        Units::Gigabytes => format_bytes(val * 1024.0 * 1024.0 * 1024.0),
        Units::None => format_count(val),
        Units::Custom(label) => format!("{} {}", round3(val), label),
    }
}

fn format_seconds(val: f64) -> String {
    let abs = val.abs();
    if abs < 1e-6 {
        format!("{} ns", round3(val * 1e9))
    } else if abs < 1e-3 {
        format!("{} us", round3(val * 1e6))
    } else if abs < 1.0 {
        format!("{} ms", round3(val * 1e3))
    } else if abs < 60.0 {
        format!("{} s", round3(val))
    } else {
        let min = (val / 60.0).floor();
        format!("{:02}:{:06.3} min", min, val - min * 60.0)
    }
}

fn format_bytes(val: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * KB;
    const GB: f64 = 1024.0 * MB;
    if val < KB {
        format!("{} B", round3(val))
    } else if val < MB {
        format!("{} KB", round3(val / KB))
    } else if val < GB {
        format!("{} MB", round3(val / MB))
    } else {
        format!("{} GB", round3(val / GB))
    }
}

fn format_count(val: f64) -> String {
    let int = val.floor() as i64;
    let dec = format!("{}", round3(val - int as f64));
    if dec == "0" {
        int.to_formatted_string(&num_format::Locale::en)
    } else {
        int.to_formatted_string(&num_format::Locale::en) + &dec[1..]
    }
}

fn round3(val: f64) -> f64 {
    (val * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn tokens_round_trip() {
        for kind in MeasKind::iter() {
            if kind == MeasKind::Custom {
                continue;
            }
            assert_eq!(MeasKind::from_token(kind.as_ref()), Some(kind));
        }
        assert_eq!(MeasKind::from_token("bogus"), None);
    }

    #[test]
    fn units_parse_known_and_freeform() {
        assert_eq!(Units::parse("ms"), Units::Millis);
        assert_eq!(Units::parse("none"), Units::None);
        assert_eq!(Units::parse("ops/s"), Units::Custom(String::from("ops/s")));
    }

    #[test]
    fn seconds_scale() {
        assert_eq!(format_value(&Units::Seconds, 0.000000123), "123 ns");
        assert_eq!(format_value(&Units::Seconds, 0.000123), "123 us");
        assert_eq!(format_value(&Units::Seconds, 0.1234564), "123.456 ms");
        assert_eq!(format_value(&Units::Seconds, 12.3456789), "12.346 s");
        assert_eq!(format_value(&Units::Seconds, 83.4567), "01:23.457 min");
    }

    #[test]
    fn bytes_scale() {
        assert_eq!(format_value(&Units::Bytes, 123.0), "123 B");
        assert_eq!(format_value(&Units::Bytes, 12.5 * 1024.0), "12.5 KB");
        assert_eq!(format_value(&Units::Kilobytes, 2048.0), "2 MB");
    }

    #[test]
    fn counts_get_separators() {
        assert_eq!(format_value(&Units::None, 123456789.0), "123,456,789");
        assert_eq!(format_value(&Units::None, 1234.5), "1,234.5");
    }

    #[test]
    fn default_list_annotates_wall() {
        let list = default_meas_list();
        assert_eq!(list.len(), 3);
        assert!(list[0].primary.is_none());
        assert_eq!(list[1].primary, Some(0));
        assert_eq!(list[2].primary, Some(0));
    }
}
