//! On-demand external process lifecycle.
//!
//! Each `runOn*` hook is a scoped acquisition: start on its trigger,
//! release on the inverse trigger (or process exit). Environment variables
//! carry the path context into the child process the way a shell-launched
//! sidecar expects.

use std::process::{Child, Command};

use crate::error::{CoreError, Result};

/// A running on-demand command plus the context it needs to report on
/// itself (used by the path's tick to decide whether it's still alive).
pub struct RunningCommand {
    child: Child,
    label: &'static str,
}

impl RunningCommand {
    /// Spawn `command_line` through `sh -c`, injecting `path_name` (and any
    /// extra vars) into the child's environment.
    pub fn spawn(
        command_line: &str,
        label: &'static str,
        path_name: &str,
        extra_env: &[(&str, &str)],
    ) -> Result<Self> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd.env("MTX_PATH", path_name);
        for (k, v) in extra_env {
            cmd.env(k, v);
        }
        let child = cmd.spawn().map_err(|source| CoreError::CommandSpawn {
            command: command_line.to_string(),
            source,
        })?;
        Ok(Self { child, label })
    }

    /// Whether the child is still running. Reaps the exit status as a
    /// side effect when it has exited, per the "release resources on every
    /// exit path" discipline.
    pub fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_status)) => false,
            Ok(None) => true,
            Err(_) => false,
        }
    }

    pub fn stop(mut self) {
        if let Err(err) = self.child.kill() {
            if err.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!(label = self.label, error = %err, "failed to kill on-demand command");
            }
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawns_and_stops_a_command() {
        let mut running =
            RunningCommand::spawn("sleep 5", "runOnDemand", "mypath", &[]).unwrap();
        assert!(running.is_running());
        running.stop();
    }

    #[test]
    fn short_lived_command_reports_not_running() {
        let mut running = RunningCommand::spawn("true", "runOnInit", "mypath", &[]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(!running.is_running());
    }

    #[test]
    fn injects_path_name_env_var() {
        let dir = std::env::temp_dir().join(format!("streamcore-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let cmd = format!("echo -n $MTX_PATH > {}", dir.display());
        let mut running = RunningCommand::spawn(&cmd, "runOnInit", "mypath", &[]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        let contents = std::fs::read_to_string(&dir).unwrap_or_default();
        assert_eq!(contents, "mypath");
        running.stop();
        let _ = std::fs::remove_file(&dir);
    }
}
