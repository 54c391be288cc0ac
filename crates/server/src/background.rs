//! Background loops that only instance 0 runs.

use std::sync::Arc;
use std::time::Duration;

use herald_postal::gc::MessageGc;
use herald_postal::queue::{JobQueue, report_length};
use tokio::task::JoinHandle;

pub const QUEUE_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the message GC and the queue gauge on instance 0. Other instances
/// get no tasks.
pub fn spawn_singletons(
    instance_index: u32,
    gc: MessageGc,
    queue: Arc<dyn JobQueue>,
) -> Vec<JoinHandle<()>> {
    if instance_index != 0 {
        tracing::debug!(instance_index, "Not instance 0, skipping GC and queue gauge");
        return Vec::new();
    }

    vec![
        tokio::spawn(gc.run()),
        tokio::spawn(report_length(queue, QUEUE_REPORT_INTERVAL)),
    ]
}
