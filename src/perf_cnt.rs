//! Hardware performance counter adapter.
//!
//! On Linux this opens one `perf_event_open` group per measured child:
//! cycles, retired instructions, branch instructions and mispredicted
//! branches, created disabled and enabled as a group once the (gated) child
//! is about to run. Reading happens after the child exited, so the counts
//! cover its whole lifetime.

use thiserror::Error;

#[derive(Debug, Clone, Copy, Default)]
pub struct PerfCounts {
    pub cycles: u64,
    pub instructions: u64,
    pub branches: u64,
    pub branch_misses: u64,
}

#[derive(Error, Debug)]
pub enum PerfError {
    #[error("perf_event_open failed for {event}: {source}")]
    Open {
        event: &'static str,
        source: std::io::Error,
    },
    #[error("could not enable counter group: {0}")]
    Enable(std::io::Error),
    #[error("could not read counter group: {0}")]
    Read(std::io::Error),
    #[error("performance counters are not supported on this platform")]
    Unsupported,
}

#[cfg(target_os = "linux")]
pub use linux::{init_perf, PerfGroup};

#[cfg(target_os = "linux")]
mod linux {
    use super::{PerfCounts, PerfError};
    use std::fs::File;
    use std::io::Read;
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

    // perf_event_open ABI pieces; the libc crate does not carry these.
    const PERF_TYPE_HARDWARE: u32 = 0;
    const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
    const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
    const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
    const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
    const PERF_FORMAT_GROUP: u64 = 1 << 3;
    const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
    const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
    const PERF_IOC_FLAG_GROUP: libc::c_ulong = 1;
    const ATTR_FLAG_DISABLED: u64 = 1;
    const ATTR_SIZE_VER5: u32 = 112;

    /// `struct perf_event_attr`, version 5 prefix. Later kernel versions
    /// accept this size and zero-extend.
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct PerfEventAttr {
        type_: u32,
        size: u32,
        config: u64,
        sample_period: u64,
        sample_type: u64,
        read_format: u64,
        flags: u64,
        wakeup_events: u32,
        bp_type: u32,
        config1: u64,
        config2: u64,
        branch_sample_type: u64,
        sample_regs_user: u64,
        sample_stack_user: u32,
        clockid: i32,
        sample_regs_intr: u64,
        aux_watermark: u32,
        sample_max_stack: u16,
        reserved_2: u16,
    }

    fn hw_attr(config: u64, leader: bool) -> PerfEventAttr {
        let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
        attr.type_ = PERF_TYPE_HARDWARE;
        attr.size = ATTR_SIZE_VER5;
        attr.config = config;
        if leader {
            // The leader starts disabled and is enabled with the whole
            // group once counters are armed; followers inherit the leader's
            // run state.
            attr.flags = ATTR_FLAG_DISABLED;
            attr.read_format = PERF_FORMAT_GROUP;
        }
        attr
    }

    fn perf_event_open(
        attr: &PerfEventAttr,
        pid: libc::pid_t,
        group_fd: RawFd,
        event: &'static str,
    ) -> Result<File, PerfError> {
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                attr as *const PerfEventAttr,
                pid,
                -1 as libc::c_int,
                group_fd,
                PERF_FLAG_FD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(PerfError::Open {
                event,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(unsafe { File::from_raw_fd(fd as RawFd) })
    }

    /// A counter group attached to one child process.
    pub struct PerfGroup {
        leader: File,
        _followers: Vec<File>,
    }

    const EVENTS: [(u64, &str); 4] = [
        (PERF_COUNT_HW_CPU_CYCLES, "cycles"),
        (PERF_COUNT_HW_INSTRUCTIONS, "instructions"),
        (PERF_COUNT_HW_BRANCH_INSTRUCTIONS, "branches"),
        (PERF_COUNT_HW_BRANCH_MISSES, "branch-misses"),
    ];

    impl PerfGroup {
        /// Opens the disabled counter group for `pid`. The caller is
        /// expected to hold the child gated until [`PerfGroup::enable`]
        /// succeeded.
        pub fn attach(pid: libc::pid_t) -> Result<Self, PerfError> {
            let leader = perf_event_open(&hw_attr(EVENTS[0].0, true), pid, -1, EVENTS[0].1)?;
            let mut followers = Vec::with_capacity(EVENTS.len() - 1);
            for &(config, name) in &EVENTS[1..] {
                followers.push(perf_event_open(
                    &hw_attr(config, false),
                    pid,
                    leader.as_raw_fd(),
                    name,
                )?);
            }
            Ok(PerfGroup {
                leader,
                _followers: followers,
            })
        }

        pub fn enable(&self) -> Result<(), PerfError> {
            let ret = unsafe {
                libc::ioctl(
                    self.leader.as_raw_fd(),
                    PERF_EVENT_IOC_ENABLE,
                    PERF_IOC_FLAG_GROUP,
                )
            };
            if ret != 0 {
                return Err(PerfError::Enable(std::io::Error::last_os_error()));
            }
            Ok(())
        }

        /// Reads the group totals. Valid after the child exited.
        pub fn collect(&mut self) -> Result<PerfCounts, PerfError> {
            // PERF_FORMAT_GROUP layout: nr, then one value per event in
            // creation order.
            let mut buf = [0u8; 8 * (1 + EVENTS.len())];
            self.leader.read_exact(&mut buf).map_err(PerfError::Read)?;
            let word = |i: usize| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
                u64::from_ne_bytes(raw)
            };
            if word(0) != EVENTS.len() as u64 {
                return Err(PerfError::Read(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unexpected group size",
                )));
            }
            Ok(PerfCounts {
                cycles: word(1),
                instructions: word(2),
                branches: word(3),
                branch_misses: word(4),
            })
        }
    }

    /// Probes counter support once at startup: opens a self-targeted cycles
    /// counter and closes it again. When this fails (no PMU, paranoid
    /// setting, container without the capability), PMC measurements are
    /// refused up front.
    pub fn init_perf() -> bool {
        perf_event_open(&hw_attr(PERF_COUNT_HW_CPU_CYCLES, true), 0, -1, "cycles").is_ok()
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn probe_matches_attach() {
            // Either the whole stack is available or none of it is;
            // attach-to-self must agree with the probe.
            let supported = init_perf();
            let attached = PerfGroup::attach(0).is_ok();
            assert_eq!(supported, attached);
        }

        #[test]
        fn self_counts_accumulate_when_supported() {
            if !init_perf() {
                return;
            }
            let mut group = PerfGroup::attach(0).unwrap();
            group.enable().unwrap();
            let mut acc = 0u64;
            for i in 0..10_000u64 {
                acc = acc.wrapping_add(i * i);
            }
            std::hint::black_box(acc);
            let counts = group.collect().unwrap();
            assert!(counts.instructions > 0);
            assert!(counts.cycles > 0);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::{init_perf, PerfGroup};

#[cfg(not(target_os = "linux"))]
mod stub {
    use super::{PerfCounts, PerfError};

    pub struct PerfGroup;

    impl PerfGroup {
        pub fn attach(_pid: libc::pid_t) -> Result<Self, PerfError> {
            Err(PerfError::Unsupported)
        }

        pub fn enable(&self) -> Result<(), PerfError> {
            Err(PerfError::Unsupported)
        }

        pub fn collect(&mut self) -> Result<PerfCounts, PerfError> {
            Err(PerfError::Unsupported)
        }
    }

    pub fn init_perf() -> bool {
        false
    }
}
