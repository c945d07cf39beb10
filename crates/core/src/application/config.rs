// Scheduler configuration

use std::time::Duration;

use crate::error::{AppError, Result};

/// Tunables of the on-demand scheduler itself. Repair-action parameters
/// live in `RepairConfiguration`.
#[derive(Debug, Clone)]
pub struct OnDemandSchedulerConfig {
    /// Period of the sweep that adopts persisted jobs (restart recovery and
    /// cluster-wide distribution both ride on it).
    pub sweep_interval: Duration,
}

impl Default for OnDemandSchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl OnDemandSchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(AppError::Config(
                "sweep_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
