//! Process memory probing for the session budget guard.

use sysinfo::{ProcessesToUpdate, System};

use crate::error::{Result, SessionError};

/// Resident set size of this process, if the platform reports one.
pub fn process_rss() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory())
}

/// Fail when current usage plus `extra` bytes would exceed `budget`
/// (0 disables the check; platforms without RSS reporting only check the
/// projected allocation itself).
pub fn check_budget(extra: u64, budget: u64) -> Result<()> {
    if budget == 0 {
        return Ok(());
    }
    let used = process_rss().unwrap_or(0);
    let needed = used.saturating_add(extra);
    if needed > budget {
        return Err(SessionError::OutOfMemory { needed, budget });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_budget_always_passes() {
        check_budget(u64::MAX, 0).unwrap();
    }

    #[test]
    fn test_tiny_budget_fails() {
        assert!(matches!(
            check_budget(1 << 40, 1024),
            Err(SessionError::OutOfMemory { .. })
        ));
    }
}
