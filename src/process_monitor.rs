use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    pub executable_path: Option<String>,
}

/// List every process in the OS process table.
pub fn get_running_processes() -> Vec<RunningProcess> {
    let mut sys = System::new_all();
    sys.refresh_all();

    sys.processes()
        .iter()
        .map(|(pid, process)| RunningProcess {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            executable_path: process.exe().and_then(|p| p.to_str()).map(String::from),
        })
        .collect()
}

/// Case-insensitive substring search by process name.
pub fn find_by_name(name: &str) -> Vec<RunningProcess> {
    let name_lower = name.to_lowercase();
    get_running_processes()
        .into_iter()
        .filter(|p| p.name.to_lowercase().contains(&name_lower))
        .collect()
}

/// Whether a PID is still present in the process table.
pub fn is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid)).is_some()
}

// ── Async wrappers ─────────────────────────────────────────
// sysinfo scans the whole OS process table synchronously. Calling that on a
// tokio worker thread stalls the runtime, so these wrappers run it on the
// blocking pool.

pub async fn is_running_async(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || is_running(pid))
        .await
        .unwrap_or(false)
}

pub async fn find_by_name_async(name: &str) -> Vec<RunningProcess> {
    let name = name.to_string();
    tokio::task::spawn_blocking(move || find_by_name(&name))
        .await
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonexistent_pid_is_not_running() {
        // PID near the top of the range is almost certainly free
        assert!(!is_running(u32::MAX - 7));
    }

    #[test]
    fn find_by_name_no_match() {
        let found = find_by_name("definitely-not-a-real-process-name-xyz");
        assert!(found.is_empty());
    }
}
