use crate::metadata::{ExtractOutcome, ExtractorRegistry};
use crate::metrics;
use crate::store::FileRecord;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A finalized canonical file waiting for metadata extraction.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub record: FileRecord,
    /// Absolute path of the file's bytes.
    pub path: PathBuf,
}

#[derive(Debug, Error)]
#[error("Metadata pipeline is shut down")]
pub struct PipelineClosed;

/// Bounded work queue plus a fixed pool of extraction workers.
///
/// `enqueue` applies backpressure when the queue is full and fails cleanly
/// once `shutdown` has begun. Shutdown drains items already accepted before
/// the workers stop.
pub struct MetadataPipeline {
    sender: Mutex<Option<mpsc::Sender<WorkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MetadataPipeline {
    pub fn start(registry: Arc<ExtractorRegistry>, capacity: usize, worker_count: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let worker_count = worker_count.max(1);
        let workers = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(worker_id, receiver.clone(), registry.clone()))
            })
            .collect();
        info!(workers = worker_count, capacity, "Metadata pipeline started");

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Default worker count: one per CPU core.
    pub fn default_worker_count() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub async fn enqueue(&self, item: WorkItem) -> Result<(), PipelineClosed> {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return Err(PipelineClosed);
        };
        sender.send(item).await.map_err(|_| PipelineClosed)?;
        metrics::PIPELINE_QUEUE_DEPTH.inc();
        Ok(())
    }

    /// Stops accepting work, waits for queued items to be processed and for
    /// all workers to exit.
    pub async fn shutdown(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            let _ = worker.await;
        }
        info!("Metadata pipeline drained and stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    registry: Arc<ExtractorRegistry>,
) {
    loop {
        // Hold the receiver lock only for the recv itself.
        let item = receiver.lock().await.recv().await;
        let Some(item) = item else {
            break;
        };
        metrics::PIPELINE_QUEUE_DEPTH.dec();
        process(&registry, &item).await;
    }
    debug!(worker_id, "Metadata worker stopped");
}

async fn process(registry: &ExtractorRegistry, item: &WorkItem) {
    if item.record.is_alias {
        metrics::record_pipeline_item("skipped");
        return;
    }
    let Some(extractor) = registry.get(item.record.kind) else {
        metrics::record_pipeline_item("skipped");
        return;
    };

    match extractor.extract(&item.record, &item.path).await {
        Ok(ExtractOutcome::Extracted) => {
            metrics::record_pipeline_item("processed");
            debug!(file = %item.record.id, kind = item.record.kind.as_str(), "Extracted metadata");
        }
        Ok(ExtractOutcome::Skipped(reason)) => {
            metrics::record_pipeline_item("skipped");
            debug!(file = %item.record.id, reason, "Skipped metadata extraction");
        }
        Err(e) => {
            metrics::record_pipeline_item("failed");
            error!(file = %item.record.id, "Metadata extraction failed: {e:#}");
        }
    }
}
