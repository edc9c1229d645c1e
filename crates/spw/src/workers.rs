//! 🧵 Background workers. Each one owns its state, gets spawned once, and
//! reports back through its `JoinHandle` when it is done.
//!
//! - `SealTimer` (pipeline/buffer.rs): seals batches on their interval.
//! - `DeliveryWorker` (pipeline/delivery_worker.rs): sink writes, retries, backups.
//! - `BatchConsumer` (consumer.rs): queue → pipeline, ack after hand-off.

use anyhow::Result;
use tokio::task::JoinHandle;

// A background worker, that does work. duh.
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}
