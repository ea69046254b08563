//! Platform abstraction over the OS process table

use std::io;
use std::sync::Arc;

/// Scheduling state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    Stopped,
    /// Terminated but not yet reaped by its parent
    Zombie,
    Dead,
    Unknown,
}

impl ProcessState {
    /// Decode the single-letter state used by `/proc/<pid>/stat` and `ps`
    pub fn from_code(code: char) -> Self {
        match code {
            'R' => ProcessState::Running,
            'S' | 'D' | 'I' | 'U' => ProcessState::Sleeping,
            'T' | 't' => ProcessState::Stopped,
            'Z' => ProcessState::Zombie,
            'X' | 'x' => ProcessState::Dead,
            _ => ProcessState::Unknown,
        }
    }
}

/// One entry of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub state: ProcessState,
    /// Executable name, without path
    pub command: String,
}

/// Read and signal the OS process table
#[cfg_attr(test, mockall::automock)]
pub trait ProcessTable: Send + Sync {
    /// Snapshot every process visible to us
    fn snapshot(&self) -> io::Result<Vec<ProcessRecord>>;

    /// Forcefully terminate a process. A process that no longer exists is not an error.
    fn force_kill(&self, pid: u32) -> io::Result<()>;

    /// Collect the exit status of one of our own children without blocking.
    /// Returns whether an entry was released.
    fn reap_child(&self, pid: u32) -> io::Result<bool>;
}

/// Process table of the running platform
pub fn system_process_table() -> Arc<dyn ProcessTable> {
    Arc::new(SystemProcessTable)
}

/// Forcefully terminate `pid` on the running platform
pub fn force_kill(pid: u32) -> io::Result<()> {
    SystemProcessTable.force_kill(pid)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessRecord>> {
        #[cfg(target_os = "linux")]
        {
            linux::snapshot()
        }

        #[cfg(all(unix, not(target_os = "linux")))]
        {
            unix_ps::snapshot()
        }

        #[cfg(windows)]
        {
            windows::snapshot()
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "process enumeration not supported on this platform",
            ))
        }
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(errno) => Err(io::Error::from(errno)),
            }
        }

        #[cfg(windows)]
        {
            windows::terminate(pid)
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = pid;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "process termination not supported on this platform",
            ))
        }
    }

    fn reap_child(&self, pid: u32) -> io::Result<bool> {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
            use nix::unistd::Pid;

            match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => Ok(false),
                Ok(_) => Ok(true),
                Err(Errno::ECHILD) => Ok(false),
                Err(errno) => Err(io::Error::from(errno)),
            }
        }

        // Windows has no unreaped process entries.
        #[cfg(not(unix))]
        {
            let _ = pid;
            Ok(false)
        }
    }
}

/// Parse the contents of `/proc/<pid>/stat`.
///
/// The command is wrapped in parentheses and may itself contain spaces or
/// parentheses, so it spans from the first `(` to the last `)`.
pub fn parse_proc_stat(contents: &str) -> Option<ProcessRecord> {
    let open = contents.find('(')?;
    let close = contents.rfind(')')?;
    if close <= open {
        return None;
    }

    let pid = contents[..open].trim().parse().ok()?;
    let command = contents[open + 1..close].to_string();

    let mut fields = contents[close + 1..].split_whitespace();
    let state = fields.next()?.chars().next().map(ProcessState::from_code)?;
    let parent_pid = fields
        .next()
        .and_then(|field| field.parse().ok())
        .filter(|&ppid| ppid != 0);

    Some(ProcessRecord {
        pid,
        parent_pid,
        state,
        command,
    })
}

/// Parse one line of `ps -axo pid=,ppid=,stat=,comm=`
pub fn parse_ps_line(line: &str) -> Option<ProcessRecord> {
    let mut fields = line.split_whitespace();
    let pid = fields.next()?.parse().ok()?;
    let parent_pid = fields
        .next()
        .and_then(|field| field.parse().ok())
        .filter(|&ppid| ppid != 0);
    let state = fields.next()?.chars().next().map(ProcessState::from_code)?;

    let command = fields.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return None;
    }
    let command = command
        .rsplit('/')
        .next()
        .unwrap_or(command.as_str())
        .to_string();

    Some(ProcessRecord {
        pid,
        parent_pid,
        state,
        command,
    })
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{parse_proc_stat, ProcessRecord};
    use std::fs;
    use std::io;

    pub fn snapshot() -> io::Result<Vec<ProcessRecord>> {
        let mut records = Vec::new();

        for entry in fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }

            // Processes exit between listing and reading.
            let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };

            if let Some(record) = parse_proc_stat(&stat) {
                records.push(record);
            }
        }

        Ok(records)
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod unix_ps {
    use super::{parse_ps_line, ProcessRecord};
    use std::io;
    use std::process::{Command, Stdio};

    pub fn snapshot() -> io::Result<Vec<ProcessRecord>> {
        let output = Command::new("ps")
            .arg("-axo")
            .arg("pid=,ppid=,stat=,comm=")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ps exited with {}", output.status),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_ps_line)
            .collect())
    }
}

#[cfg(windows)]
mod windows {
    use super::{ProcessRecord, ProcessState};
    use std::io;
    use std::mem;
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::tlhelp32::{
        CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
        TH32CS_SNAPPROCESS,
    };
    use winapi::um::winnt::PROCESS_TERMINATE;

    pub fn snapshot() -> io::Result<Vec<ProcessRecord>> {
        let mut records = Vec::new();

        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0);
            if snapshot == INVALID_HANDLE_VALUE {
                return Err(io::Error::last_os_error());
            }

            let mut entry: PROCESSENTRY32W = mem::zeroed();
            entry.dwSize = mem::size_of::<PROCESSENTRY32W>() as u32;

            if Process32FirstW(snapshot, &mut entry) != 0 {
                loop {
                    let len = entry
                        .szExeFile
                        .iter()
                        .position(|&c| c == 0)
                        .unwrap_or(entry.szExeFile.len());

                    records.push(ProcessRecord {
                        pid: entry.th32ProcessID,
                        parent_pid: Some(entry.th32ParentProcessID).filter(|&ppid| ppid != 0),
                        state: ProcessState::Running,
                        command: String::from_utf16_lossy(&entry.szExeFile[..len]),
                    });

                    if Process32NextW(snapshot, &mut entry) == 0 {
                        break;
                    }
                }
            }

            CloseHandle(snapshot);
        }

        Ok(records)
    }

    pub fn terminate(pid: u32) -> io::Result<()> {
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                // Already gone.
                return Ok(());
            }

            let terminated = TerminateProcess(handle, 1);
            CloseHandle(handle);

            if terminated == 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }
}
