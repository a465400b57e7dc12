//! Process-control helpers shared across the workspace.
//!
//! Besides the Windows `CREATE_NO_WINDOW` command constructors, this crate
//! provides [`kill_tree`], which terminates a spawned binary together with
//! every descendant it forked. Download tools routinely hand work to a
//! muxing/transcoding child; killing only the root pid would leave that
//! child running as an orphan.

use std::ffi::OsStr;

use tracing::debug;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Forcefully terminate the process `pid` and every process descended from it.
///
/// Descendants are killed before their parent so a dying parent cannot
/// re-parent children to init between enumeration and the kill.
pub fn kill_tree(pid: u32) {
    debug!(pid, "killing process tree");

    #[cfg(unix)]
    unix::kill_tree(pid);

    #[cfg(windows)]
    windows::kill_tree(pid);

    #[cfg(not(any(unix, windows)))]
    {
        tracing::warn!(pid, "process-tree kill unsupported on this platform");
    }
}

#[cfg(unix)]
mod unix {
    use sysinfo::{Pid, ProcessesToUpdate, System};
    use tracing::{debug, warn};

    /// Kill `pid` and all descendants, children first.
    pub(super) fn kill_tree(pid: u32) {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let root = Pid::from_u32(pid);
        let mut victims = Vec::new();
        collect_descendants(&system, root, &mut victims);

        // Leaf-first order: descendants were appended breadth-first, so
        // reverse before the root goes last anyway.
        for victim in victims.iter().rev() {
            if let Some(process) = system.process(*victim)
                && !process.kill()
            {
                warn!(pid = victim.as_u32(), "failed to kill child process");
            }
        }

        match system.process(root) {
            Some(process) => {
                if !process.kill() {
                    warn!(pid, "failed to kill process");
                }
            }
            None => debug!(pid, "process already gone"),
        }
    }

    /// Breadth-first collection of every pid whose ancestry reaches `root`.
    fn collect_descendants(system: &System, root: Pid, out: &mut Vec<Pid>) {
        let mut frontier = vec![root];
        while let Some(parent) = frontier.pop() {
            for (pid, process) in system.processes() {
                if process.parent() == Some(parent) {
                    out.push(*pid);
                    frontier.push(*pid);
                }
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use tracing::warn;

    /// Windows resolves the whole tree itself via `taskkill /T`.
    pub(super) fn kill_tree(pid: u32) {
        let result = super::std_command("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();

        match result {
            Ok(output) if !output.status.success() => {
                warn!(
                    pid,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "taskkill reported failure"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(pid, error = %e, "failed to invoke taskkill"),
        }
    }
}
