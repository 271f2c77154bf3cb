use spacesync_core::{
    config::QueueConfig,
    ids::OpId,
    operations::{Operation, OperationBatch, OperationPayload},
    Debouncer,
};
use spacesync_storage::{OperationStore, QueuedOperation};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::remote::RemoteApi;

/// Ordered outbound mutations, mirrored in the durable queue table.
///
/// Delivery is at-least-once: a batch is only trimmed after the remote
/// accepts it, and a failed batch is resent whole on the next attempt.
pub struct OperationQueue {
    pending: Vec<QueuedOperation>,
    flush: Debouncer<()>,
    online: bool,
    retry_interval_ms: i64,
    next_retry_at: Option<i64>,
    batches_sent: u64,
}

impl OperationQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            pending: Vec::new(),
            flush: Debouncer::new(config.flush_debounce_ms),
            online: true,
            retry_interval_ms: config.retry_interval_ms,
            next_retry_at: None,
            batches_sent: 0,
        }
    }

    /// Reloads whatever a previous session left in the durable queue and
    /// schedules a flush for it.
    pub fn open(
        store: &impl OperationStore,
        config: &QueueConfig,
        now: i64,
    ) -> Result<Self, EngineError> {
        let mut queue = Self::new(config);
        queue.pending = store.pending_operations()?;
        if !queue.pending.is_empty() {
            info!(pending = queue.pending.len(), "reloaded queued operations");
            queue.flush.schedule(now, ());
        }
        Ok(queue)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter().map(|queued| &queued.operation)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn batches_sent(&self) -> u64 {
        self.batches_sent
    }

    /// Appends an operation, persists it, and schedules a trailing flush.
    pub fn enqueue(
        &mut self,
        store: &mut impl OperationStore,
        payload: OperationPayload,
        now: i64,
    ) -> Result<OpId, EngineError> {
        let operation = Operation::new(payload, now);
        let seq = store.push_operation(&operation)?;
        let op_id = operation.op_id;
        debug!(op = operation.name(), seq, "queued operation");
        self.pending.push(QueuedOperation { seq, operation });
        self.flush.schedule(now, ());
        Ok(op_id)
    }

    /// Returns true when coming back online and there is something to send.
    pub fn set_online(&mut self, online: bool) -> bool {
        let reconnected = online && !self.online;
        self.online = online;
        reconnected && !self.pending.is_empty()
    }

    /// Sends the whole pending list as one ordered batch. Returns how many
    /// operations the remote accepted. On failure everything stays queued.
    pub fn flush(
        &mut self,
        store: &mut impl OperationStore,
        remote: &mut dyn RemoteApi,
        now: i64,
    ) -> Result<usize, EngineError> {
        self.flush.flush();
        if !self.online {
            debug!(pending = self.pending.len(), "offline, flush suppressed");
            return Ok(0);
        }
        let Some(last_seq) = self.pending.last().map(|queued| queued.seq) else {
            self.next_retry_at = None;
            return Ok(0);
        };

        let operations = self.pending.iter().map(|q| q.operation.clone()).collect();
        let batch = OperationBatch::new(operations)?;
        match remote.send_operations(&batch) {
            Ok(()) => {
                store.remove_operations_through(last_seq)?;
                let sent = self.pending.len();
                self.pending.clear();
                self.next_retry_at = None;
                self.batches_sent += 1;
                info!(sent, checksum = %batch.checksum_hex(), "flushed operations");
                Ok(sent)
            }
            Err(err) => {
                self.next_retry_at = Some(now + self.retry_interval_ms);
                warn!(pending = batch.len(), error = %err, "flush failed, keeping batch");
                Err(err.into())
            }
        }
    }

    /// Flushes when the debounce window or the retry interval has elapsed.
    pub fn tick(
        &mut self,
        store: &mut impl OperationStore,
        remote: &mut dyn RemoteApi,
        now: i64,
    ) -> Result<usize, EngineError> {
        let debounced = self.flush.poll(now).is_some();
        let retry_due = self.next_retry_at.is_some_and(|at| now >= at);
        if (debounced || retry_due) && self.online {
            return self.flush(store, remote, now);
        }
        if retry_due {
            self.next_retry_at = Some(now + self.retry_interval_ms);
        }
        Ok(0)
    }
}
