//! Child process launcher.
//!
//! Children are started with `fork` + `exec` rather than `std::process` so
//! that the parent can collect `rusage` through `wait4`, gate the exec on a
//! signal while performance counters are armed, and redirect std streams
//! onto arbitrary descriptors (tempfiles, pipes, `/dev/null`).
//!
//! Pre-exec failures travel from child to parent over a close-on-exec error
//! pipe: the child writes a single `0` byte once all redirections succeeded,
//! then execs. On success the pipe closes right after that byte; anything
//! else on the pipe is an error description.

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{FromRawFd, RawFd};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("command contains an interior NUL byte")]
    NulInCommand,
    #[error("could not create pipe: {0}")]
    Pipe(std::io::Error),
    #[error("could not fork: {0}")]
    Fork(std::io::Error),
    #[error("could not launch `{cmd}`: {reason}")]
    Child { cmd: String, reason: String },
    #[error("wait4 failed: {0}")]
    Wait(std::io::Error),
}

/// How the command line reaches `exec`.
#[derive(Debug, Clone)]
pub enum ExecSpec {
    /// `[shell-tokens..., "-c", cmd]`.
    Shell { shell: Vec<String>, cmd: String },
    /// Direct argv, no shell wrapping.
    Direct { argv: Vec<String> },
}

impl ExecSpec {
    fn to_argv(&self) -> Result<Vec<CString>, LaunchError> {
        let mut argv = Vec::new();
        match self {
            ExecSpec::Shell { shell, cmd } => {
                for tok in shell {
                    argv.push(cstr(tok)?);
                }
                argv.push(cstr("-c")?);
                argv.push(cstr(cmd)?);
            }
            ExecSpec::Direct { argv: words } => {
                for word in words {
                    argv.push(cstr(word)?);
                }
            }
        }
        Ok(argv)
    }

    pub fn display(&self) -> String {
        match self {
            ExecSpec::Shell { cmd, .. } => cmd.clone(),
            ExecSpec::Direct { argv } => argv.join(" "),
        }
    }
}

fn cstr(s: &str) -> Result<CString, LaunchError> {
    CString::new(s).map_err(|_| LaunchError::NulInCommand)
}

#[cfg(target_os = "linux")]
unsafe fn errno() -> i32 {
    *libc::__errno_location()
}

#[cfg(not(target_os = "linux"))]
unsafe fn errno() -> i32 {
    *libc::__error()
}

/// Destination of one standard stream in the child.
#[derive(Debug, Clone, Copy)]
pub enum StdioPolicy {
    /// Redirect to `/dev/null`.
    Null,
    /// Leave the inherited stream untouched.
    Inherit,
    /// `dup2` the given descriptor onto the stream.
    Fd(RawFd),
}

/// Spawn a child. When `gate` is set the child blocks on SIGUSR1 right
/// before `exec`, so the parent can arm per-pid counters and release it
/// with [`release_gate`].
pub fn launch(
    spec: &ExecSpec,
    stdin: StdioPolicy,
    stdout: StdioPolicy,
    stderr: StdioPolicy,
    gate: bool,
) -> Result<libc::pid_t, LaunchError> {
    // Everything the child needs is materialized before fork; between fork
    // and exec only async-signal-safe calls are allowed (other threads may
    // hold the allocator lock).
    let argv = spec.to_argv()?;
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let mut err_pipe = [0 as RawFd; 2];
    if unsafe { libc::pipe2(err_pipe.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(LaunchError::Pipe(std::io::Error::last_os_error()));
    }

    let mut old_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    let mut gate_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    if gate {
        // SIGUSR1 must be blocked before fork so a release sent before the
        // child reaches sigwait stays pending instead of getting lost.
        unsafe {
            libc::sigemptyset(&mut gate_mask);
            libc::sigaddset(&mut gate_mask, libc::SIGUSR1);
            libc::pthread_sigmask(libc::SIG_BLOCK, &gate_mask, &mut old_mask);
        }
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            if gate {
                libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, std::ptr::null_mut());
            }
            libc::close(err_pipe[0]);
            libc::close(err_pipe[1]);
        }
        return Err(LaunchError::Fork(err));
    }

    if pid == 0 {
        // Child.
        unsafe {
            if let Err(errno) = redirect(stdin, libc::STDIN_FILENO, libc::O_RDONLY) {
                child_fail(err_pipe[1], b"could not redirect stdin", errno);
            }
            if let Err(errno) = redirect(stdout, libc::STDOUT_FILENO, libc::O_WRONLY) {
                child_fail(err_pipe[1], b"could not redirect stdout", errno);
            }
            if let Err(errno) = redirect(stderr, libc::STDERR_FILENO, libc::O_WRONLY) {
                child_fail(err_pipe[1], b"could not redirect stderr", errno);
            }
            let ok = [0u8];
            libc::write(err_pipe[1], ok.as_ptr() as *const libc::c_void, 1);
            if gate {
                let mut sig: libc::c_int = 0;
                libc::sigwait(&gate_mask, &mut sig);
                libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, std::ptr::null_mut());
            }
            libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
            child_fail(err_pipe[1], b"could not exec", errno());
        }
    }

    // Parent.
    unsafe {
        if gate {
            libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, std::ptr::null_mut());
        }
        libc::close(err_pipe[1]);
    }
    let mut pipe = unsafe { File::from_raw_fd(err_pipe[0]) };
    let mut report = Vec::new();
    let ok = if gate {
        // A gated child holds the pipe open until it is released, so only
        // the redirection phase is awaited here; an exec failure after the
        // release surfaces as exit code 127 at wait time.
        let mut first = [0u8; 1];
        match pipe.read(&mut first) {
            Ok(1) if first[0] == 0 => true,
            Ok(1) => {
                report.push(first[0]);
                let _ = pipe.read_to_end(&mut report);
                false
            }
            _ => false,
        }
    } else {
        matches!(pipe.read_to_end(&mut report), Ok(_)) && report == [0]
    };
    if ok {
        return Ok(pid);
    }
    // The child never reached exec (or the pipe broke); reap it so it
    // doesn't linger as a zombie.
    let reason = if report.first() == Some(&0) {
        String::from_utf8_lossy(&report[1..]).into_owned()
    } else if report.is_empty() {
        String::from("child exited before exec")
    } else {
        String::from_utf8_lossy(&report).into_owned()
    };
    if gate {
        release_gate(pid);
    }
    let _ = wait(pid);
    Err(LaunchError::Child {
        cmd: spec.display(),
        reason,
    })
}

/// Applies one stdio policy inside the child. Returns errno on failure.
///
/// Only async-signal-safe calls.
unsafe fn redirect(policy: StdioPolicy, target: RawFd, null_flags: libc::c_int) -> Result<(), i32> {
    let src = match policy {
        StdioPolicy::Inherit => return Ok(()),
        StdioPolicy::Fd(fd) => fd,
        StdioPolicy::Null => {
            let fd = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, null_flags);
            if fd < 0 {
                return Err(errno());
            }
            fd
        }
    };
    if libc::dup2(src, target) < 0 {
        return Err(errno());
    }
    if matches!(policy, StdioPolicy::Null) {
        libc::close(src);
    }
    Ok(())
}

/// Writes `0x00 <what>: errno <n>` to the error pipe and exits. Stack
/// buffers only; no allocation after fork.
unsafe fn child_fail(err_fd: RawFd, what: &[u8], errno: i32) -> ! {
    let mut buf = [0u8; 192];
    let mut len = 0;
    // The leading byte mirrors the success protocol: redirection failures
    // happen before the ok byte was sent, exec failures after. Either way a
    // payload longer than one byte marks the launch as failed.
    for &b in what.iter().take(128) {
        buf[len] = b;
        len += 1;
    }
    for &b in b": errno " {
        buf[len] = b;
        len += 1;
    }
    let mut digits = [0u8; 12];
    let mut n = if errno < 0 { 0 } else { errno as u32 };
    let mut ndigits = 0;
    loop {
        digits[ndigits] = b'0' + (n % 10) as u8;
        ndigits += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    while ndigits > 0 {
        ndigits -= 1;
        buf[len] = digits[ndigits];
        len += 1;
    }
    libc::write(err_fd, buf.as_ptr() as *const libc::c_void, len);
    libc::_exit(127);
}

/// Releases a gated child (SIGUSR1).
pub fn release_gate(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGUSR1);
    }
}

pub fn kill(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

/// Waits for the child and returns its shell-style exit code
/// (`128 + signal` when terminated by a signal) together with its resource
/// usage. Retries `wait4` on EINTR.
pub fn wait(pid: libc::pid_t) -> Result<(i32, libc::rusage), LaunchError> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if ret >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(LaunchError::Wait(err));
        }
    }
    let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        128 + libc::WTERMSIG(status)
    };
    Ok((code, usage))
}

/// Launch + wait; true only when the command exited 0. Used for prepare
/// commands and other fire-and-forget shell invocations.
pub fn shell_execute(
    shell: &[String],
    cmd: &str,
    stdin: StdioPolicy,
    stdout: StdioPolicy,
    stderr: StdioPolicy,
) -> Result<bool, LaunchError> {
    let spec = ExecSpec::Shell {
        shell: shell.to_vec(),
        cmd: String::from(cmd),
    };
    let pid = launch(&spec, stdin, stdout, stderr, false)?;
    let (code, _) = wait(pid)?;
    Ok(code == 0)
}

/// Launch a shell command whose stdin is a pipe owned by the caller. Used
/// to drive external plot backends.
pub fn shell_launch_stdin_pipe(
    shell: &[String],
    cmd: &str,
) -> Result<(libc::pid_t, File), LaunchError> {
    // Both ends close-on-exec: the read end survives in the child only as
    // the dup2'd stdin, and the write end must not leak into the child or
    // it would never see EOF.
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(LaunchError::Pipe(std::io::Error::last_os_error()));
    }
    let spec = ExecSpec::Shell {
        shell: shell.to_vec(),
        cmd: String::from(cmd),
    };
    let res = launch(
        &spec,
        StdioPolicy::Fd(fds[0]),
        StdioPolicy::Inherit,
        StdioPolicy::Inherit,
        false,
    );
    unsafe {
        libc::close(fds[0]);
    }
    match res {
        Ok(pid) => Ok((pid, unsafe { File::from_raw_fd(fds[1]) })),
        Err(err) => {
            unsafe {
                libc::close(fds[1]);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn sh() -> Vec<String> {
        vec![String::from("/bin/sh")]
    }

    #[test]
    fn true_exits_zero() {
        let ok = shell_execute(
            &sh(),
            "true",
            StdioPolicy::Null,
            StdioPolicy::Null,
            StdioPolicy::Null,
        )
        .unwrap();
        assert!(ok);
    }

    #[test]
    fn false_exits_nonzero() {
        let ok = shell_execute(
            &sh(),
            "false",
            StdioPolicy::Null,
            StdioPolicy::Null,
            StdioPolicy::Null,
        )
        .unwrap();
        assert!(!ok);
    }

    #[test]
    fn signalled_child_gets_shell_style_code() {
        let spec = ExecSpec::Shell {
            shell: sh(),
            cmd: String::from("kill -TERM $$"),
        };
        let pid = launch(
            &spec,
            StdioPolicy::Null,
            StdioPolicy::Null,
            StdioPolicy::Null,
            false,
        )
        .unwrap();
        let (code, _) = wait(pid).unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);
    }

    #[test]
    fn missing_binary_reports_through_error_pipe() {
        let spec = ExecSpec::Direct {
            argv: vec![String::from("/nonexistent/definitely-not-here")],
        };
        let err = launch(
            &spec,
            StdioPolicy::Null,
            StdioPolicy::Null,
            StdioPolicy::Null,
            false,
        )
        .unwrap_err();
        match err {
            LaunchError::Child { reason, .. } => assert!(reason.contains("exec")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn stdout_redirects_to_file() {
        let mut file = tempfile::tempfile().unwrap();
        let spec = ExecSpec::Shell {
            shell: sh(),
            cmd: String::from("printf hello"),
        };
        use std::os::unix::io::AsRawFd;
        let pid = launch(
            &spec,
            StdioPolicy::Null,
            StdioPolicy::Fd(file.as_raw_fd()),
            StdioPolicy::Null,
            false,
        )
        .unwrap();
        let (code, _) = wait(pid).unwrap();
        assert_eq!(code, 0);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn gated_child_waits_for_release() {
        let spec = ExecSpec::Shell {
            shell: sh(),
            cmd: String::from("true"),
        };
        let pid = launch(
            &spec,
            StdioPolicy::Null,
            StdioPolicy::Null,
            StdioPolicy::Null,
            true,
        )
        .unwrap();
        release_gate(pid);
        let (code, _) = wait(pid).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn stdin_pipe_feeds_child() {
        let out = tempfile::NamedTempFile::new().unwrap();
        let cmd = format!("cat > {}", out.path().display());
        let (pid, mut stdin) = shell_launch_stdin_pipe(&sh(), &cmd).unwrap();
        stdin.write_all(b"piped").unwrap();
        drop(stdin);
        let (code, _) = wait(pid).unwrap();
        assert_eq!(code, 0);
        assert_eq!(std::fs::read_to_string(out.path()).unwrap(), "piped");
    }

    #[test]
    fn rusage_times_are_finite() {
        let spec = ExecSpec::Shell {
            shell: sh(),
            cmd: String::from("true"),
        };
        let pid = launch(
            &spec,
            StdioPolicy::Null,
            StdioPolicy::Null,
            StdioPolicy::Null,
            false,
        )
        .unwrap();
        let (_, usage) = wait(pid).unwrap();
        assert!(usage.ru_utime.tv_sec >= 0);
        assert!(usage.ru_maxrss >= 0);
    }
}
