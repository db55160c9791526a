//! Inbound event batching.
//!
//! All inbound traffic funnels through one bounded queue into a single
//! consumer, which is what serializes message handling. The consumer drains
//! whatever has accumulated and coalesces client submissions in the drain
//! into one batch, so a leader under write load appends many entries per
//! handling pass instead of one.
//!
//! Back-pressure is by blocking: producers await queue capacity, nothing is
//! dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::core::RaftEvent;
use crate::message::Message;
use crate::message::NewEntryBatch;
use crate::AppData;

/// Pump events from the inbound queue into the core, coalescing as they pass.
///
/// Runs until either side of the pipe is closed.
pub(crate) async fn run<D: AppData>(
    mut rx: mpsc::Receiver<RaftEvent<D>>,
    tx: mpsc::Sender<RaftEvent<D>>,
    max_batch: usize,
    wait: Duration,
) {
    loop {
        // The bounded wait keeps this loop responsive to shutdown even when
        // the queue has gone quiet.
        let first = match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(ev)) => ev,
            Ok(None) => {
                debug!("inbound queue closed, batcher shutting down");
                return;
            }
            Err(_) => continue,
        };

        let mut drained = vec![first];
        while drained.len() < max_batch {
            match rx.try_recv() {
                Ok(ev) => drained.push(ev),
                Err(_) => break,
            }
        }

        if drained.len() == 1 {
            // Cheap path, nothing to coalesce.
            if let Some(ev) = drained.pop() {
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
            continue;
        }

        for ev in coalesce(drained) {
            if tx.send(ev).await.is_err() {
                return;
            }
        }
    }
}

/// Coalesce every client submission in the drain into a single batch.
///
/// The batch takes the queue position of the first submission; all other
/// events keep their relative order. A drain with at most one submission is
/// passed through untouched.
pub(crate) fn coalesce<D: AppData>(events: Vec<RaftEvent<D>>) -> Vec<RaftEvent<D>> {
    let submissions = events
        .iter()
        .filter(|ev| matches!(ev, RaftEvent::Message(Message::NewEntry(_))))
        .count();
    if submissions <= 1 {
        return events;
    }

    let mut out = Vec::with_capacity(events.len() - submissions + 1);
    let mut batch: Option<NewEntryBatch<D>> = None;
    let mut batch_pos = 0;
    for ev in events {
        match ev {
            RaftEvent::Message(Message::NewEntry(req)) => match &mut batch {
                None => {
                    batch_pos = out.len();
                    batch = Some(NewEntryBatch {
                        cluster: req.cluster,
                        contents: vec![req.content],
                    });
                }
                Some(b) => b.contents.push(req.content),
            },
            other => out.push(other),
        }
    }
    if let Some(b) = batch {
        out.insert(batch_pos, RaftEvent::Message(Message::NewEntryBatch(b)));
    }
    out
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
