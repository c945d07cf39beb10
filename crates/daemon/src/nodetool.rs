// Nodetool-based repair runner
//
// Drives the local node's repair through its management CLI. The command is
// configurable so deployments can point at a wrapper script.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use ringmend_core::domain::{NodeId, TableReference, TokenRange};
use ringmend_core::error::{AppError, Result};
use ringmend_core::port::{
    RepairConfiguration, RepairOutcome, RepairParallelism, RepairRunner, RepairType, TimeProvider,
};

pub struct NodetoolRepairRunner {
    command: String,
    time: Arc<dyn TimeProvider>,
}

impl NodetoolRepairRunner {
    pub fn new(command: impl Into<String>, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            command: command.into(),
            time,
        }
    }

    fn repair_args(table: &TableReference, range: &TokenRange, config: &RepairConfiguration) -> Vec<String> {
        let mut args = vec!["repair".to_string()];
        match config.repair_type {
            RepairType::Full => args.push("--full".to_string()),
            RepairType::Incremental => {}
        }
        match config.parallelism {
            RepairParallelism::Sequential => args.push("-seq".to_string()),
            RepairParallelism::DatacenterAware => args.push("-dcpar".to_string()),
            RepairParallelism::Parallel => {}
        }
        if config.validate {
            args.push("--validate".to_string());
        }
        args.extend([
            "-st".to_string(),
            range.start.to_string(),
            "-et".to_string(),
            range.end.to_string(),
            table.keyspace().to_string(),
            table.table().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl RepairRunner for NodetoolRepairRunner {
    async fn repair(
        &self,
        table: &TableReference,
        range: &TokenRange,
        _replicas: &[NodeId],
        config: &RepairConfiguration,
    ) -> Result<RepairOutcome> {
        let args = Self::repair_args(table, range, config);
        let started = self.time.now_millis();
        info!(table = %table, range = %range, "Starting range repair session");

        let child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Internal(format!("Failed to spawn {}: {e}", self.command)))?;

        let output = match timeout(config.action_timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| AppError::Internal(format!("Repair process failed: {e}")))?,
            Err(_) => {
                warn!(
                    table = %table,
                    range = %range,
                    timeout_secs = config.action_timeout.as_secs(),
                    "Range repair timed out"
                );
                return Ok(RepairOutcome::Failed);
            }
        };

        let duration_ms = self.time.now_millis() - started;
        if output.status.success() {
            info!(table = %table, range = %range, duration_ms, "Range repair session done");
            Ok(RepairOutcome::Repaired)
        } else {
            warn!(
                table = %table,
                range = %range,
                duration_ms,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Range repair session failed"
            );
            Ok(RepairOutcome::Failed)
        }
    }
}
