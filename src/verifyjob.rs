//! Background dm-verity image verification: runs as a forked child per
//! image rather than on the setup thread, so a multi-minute integrity
//! scan of a large read-only image never blocks compartment bring-up.
//! No shared mutable state crosses the fork; the parent only ever
//! touches the `Child` handle.

use std::collections::HashMap;
use std::process::{Child, Command, ExitStatus};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Compartment-scoped wait registry: every verification child spawned
/// for a compartment is tracked here until reaped by `wait_all` or
/// `try_reap`.
static REGISTRY: Lazy<Mutex<HashMap<Uuid, Vec<Child>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Spawn `cmd` and track it under `compartment`. Intended for a verity
/// verification invocation the collaborator module builds; this module
/// only owns the fork/wait bookkeeping, not the command itself.
pub fn spawn(compartment: Uuid, mut cmd: Command) -> Result<()> {
    let child = cmd.spawn().map_err(Error::Io)?;
    REGISTRY
        .lock()
        .expect("verification registry lock poisoned")
        .entry(compartment)
        .or_default()
        .push(child);
    Ok(())
}

/// Block until every verification child spawned for `compartment` has
/// exited, returning the ones that reported non-zero/signal exit.
/// Removes the compartment's registry entry regardless of outcome.
pub fn wait_all(compartment: Uuid) -> Result<Vec<ExitStatus>> {
    let children = REGISTRY
        .lock()
        .expect("verification registry lock poisoned")
        .remove(&compartment)
        .unwrap_or_default();

    let mut failures = Vec::new();
    for mut child in children {
        let status = child.wait().map_err(Error::Io)?;
        if !status.success() {
            failures.push(status);
        }
    }
    Ok(failures)
}

/// Non-blocking reap of whichever of `compartment`'s verification
/// children have already exited, leaving still-running ones tracked.
/// Used by a teardown pass that must not block on a stuck verifier.
pub fn try_reap(compartment: Uuid) -> Vec<ExitStatus> {
    let mut registry = REGISTRY.lock().expect("verification registry lock poisoned");
    let Some(children) = registry.get_mut(&compartment) else {
        return Vec::new();
    };

    let mut finished = Vec::new();
    children.retain_mut(|child| match child.try_wait() {
        Ok(Some(status)) => {
            finished.push(status);
            false
        }
        _ => true,
    });
    finished
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_all_reports_no_failures_for_successful_children() {
        let compartment = Uuid::new_v4();
        spawn(compartment, Command::new("true")).unwrap();
        let failures = wait_all(compartment).unwrap();
        assert!(failures.is_empty());
    }

    #[test]
    fn wait_all_reports_failing_children() {
        let compartment = Uuid::new_v4();
        spawn(compartment, Command::new("false")).unwrap();
        let failures = wait_all(compartment).unwrap();
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn wait_all_on_unknown_compartment_is_empty() {
        let failures = wait_all(Uuid::new_v4()).unwrap();
        assert!(failures.is_empty());
    }
}
