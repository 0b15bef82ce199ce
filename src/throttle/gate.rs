//! Permission gate trait for abstracting admission control.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::throttler::RateThrottler;
use crate::error::Result;

/// Trait for anything that admits executions one at a time.
///
/// This lets workloads hold an `Arc<dyn PermissionGate>` without caring how
/// admission is decided.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Wait until one execution may proceed.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
impl PermissionGate for RateThrottler {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        self.wait_for_permission(cancel).await
    }
}
