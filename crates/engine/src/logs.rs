//! Append-only log stream with per-Run push delivery.
//!
//! Lines are persisted first and published second. Both happen under a
//! per-Run lock, so subscribers observe lines in exactly the order the
//! store sequenced them, whatever `timestamp` the worker supplied.
//!
//! A Run's channel is closed for good when the Run finishes. Lines that
//! arrive afterwards (orphaned workers, platform notes) are stored but
//! never reopen it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use db::models::{LogLineRow, NewLogLine};
use db::RunStore;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::EngineError;

struct RunChannel {
    sender: broadcast::Sender<LogLineRow>,
    order: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Channels {
    open: HashMap<Uuid, Arc<RunChannel>>,
    closed: HashSet<Uuid>,
}

pub struct LogStream {
    store: Arc<dyn RunStore>,
    channels: Mutex<Channels>,
    capacity: usize,
}

impl LogStream {
    pub fn new(store: Arc<dyn RunStore>, capacity: usize) -> Self {
        Self {
            store,
            channels: Mutex::new(Channels::default()),
            capacity: capacity.max(1),
        }
    }

    /// Persist one line and push it to the Run's current subscribers.
    pub async fn append(&self, line: NewLogLine) -> Result<LogLineRow, EngineError> {
        let Some(channel) = self.channel(line.run_id) else {
            return Ok(self.store.append_log(line).await?);
        };
        let _order = channel.order.lock().await;
        let row = self.store.append_log(line).await?;
        // No subscribers is not an error.
        let _ = channel.sender.send(row.clone());
        Ok(row)
    }

    /// Receive every line appended to `run_id` from now on. For a closed
    /// Run the receiver reports the end of the stream straight away.
    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<LogLineRow> {
        match self.channel(run_id) {
            Some(channel) => channel.sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Stored lines in append order.
    pub async fn list(
        &self,
        run_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<Vec<LogLineRow>, EngineError> {
        Ok(self.store.list_logs(run_id, step_id).await?)
    }

    /// Drop the Run's channel for good. Subscribers drain what was already
    /// sent and then see the stream end.
    pub fn close(&self, run_id: Uuid) {
        let mut channels = self.channels.lock();
        channels.open.remove(&run_id);
        channels.closed.insert(run_id);
    }

    pub fn subscriber_count(&self, run_id: Uuid) -> usize {
        self.channels
            .lock()
            .open
            .get(&run_id)
            .map_or(0, |c| c.sender.receiver_count())
    }

    /// The Run's channel, created on first use; `None` once it was closed.
    fn channel(&self, run_id: Uuid) -> Option<Arc<RunChannel>> {
        let mut channels = self.channels.lock();
        if channels.closed.contains(&run_id) {
            return None;
        }
        let capacity = self.capacity;
        let channel = channels.open.entry(run_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(capacity);
            Arc::new(RunChannel {
                sender,
                order: tokio::sync::Mutex::new(()),
            })
        });
        Some(Arc::clone(channel))
    }
}
