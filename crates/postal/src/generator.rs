//! Worker ID partitioning across instances.
//!
//! Instance `i` of `n`, running `w` workers, owns IDs `i + n * k` for
//! `k in 0..w`. Every instance computes its share independently and the
//! shares are disjoint and together cover `0..n * w`.

use std::future::Future;

use herald_common::error::AppError;
use tokio::task::JoinHandle;

use crate::queue::WorkerId;

/// The worker IDs owned by one instance.
pub fn worker_ids(instance_index: u32, instance_count: u32, per_instance: u32) -> Vec<WorkerId> {
    (0..per_instance)
        .map(|local| WorkerId(instance_index + instance_count * local))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerGenerator {
    instance_index: u32,
    instance_count: u32,
    per_instance: u32,
}

impl WorkerGenerator {
    pub fn new(instance_index: u32, instance_count: u32, per_instance: u32) -> Result<Self, AppError> {
        if instance_count == 0 {
            return Err(AppError::Config("instance count must be at least 1".to_string()));
        }
        if instance_index >= instance_count {
            return Err(AppError::Config(format!(
                "instance index {instance_index} is out of range for {instance_count} instances"
            )));
        }
        if instance_count.checked_mul(per_instance).is_none() {
            return Err(AppError::Config(format!(
                "{instance_count} instances x {per_instance} workers overflows the worker ID space"
            )));
        }

        Ok(Self {
            instance_index,
            instance_count,
            per_instance,
        })
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        worker_ids(self.instance_index, self.instance_count, self.per_instance)
    }

    /// Build and spawn one task per owned worker ID.
    pub fn spawn<F, Fut>(&self, mut build: F) -> Vec<JoinHandle<()>>
    where
        F: FnMut(WorkerId) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ids = self.ids();
        tracing::info!(
            instance_index = self.instance_index,
            instance_count = self.instance_count,
            workers = ids.len(),
            first_worker = ids.first().map(|id| id.0),
            "Starting delivery workers"
        );

        ids.into_iter().map(|id| tokio::spawn(build(id))).collect()
    }
}
