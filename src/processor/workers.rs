//! Bounded worker pool for per-file stages.
//!
//! Items are dispatched to blocking tasks in chunks and driven with
//! `buffer_unordered`, so at most `workers` chunks run at once. Results
//! come back unordered; callers key them by timestamp.

use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::task;
use tracing::{debug, error};

use crate::constants::MAX_CHUNK_SIZE;

/// Items per dispatched task: an even share per worker, capped
pub fn chunk_size(items: usize, workers: usize) -> usize {
    items.div_ceil(workers.max(1)).clamp(1, MAX_CHUNK_SIZE)
}

fn progress_bar(len: usize, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(message.to_string());
    pb
}

/// Run `work` over every item on the blocking pool.
///
/// A chunk whose task panics is logged and its results are lost; every
/// other result is returned.
pub async fn run_chunked<T, R, F>(items: Vec<T>, workers: usize, message: &str, work: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
{
    if items.is_empty() {
        return Vec::new();
    }

    let workers = workers.max(1);
    let size = chunk_size(items.len(), workers);
    let pb = progress_bar(items.len(), message);

    let mut chunks: Vec<Vec<T>> = Vec::new();
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        chunks.push(items.by_ref().take(size).collect());
    }
    debug!(
        "Dispatching {} chunks of up to {} items to {} workers",
        chunks.len(),
        size,
        workers
    );

    let work = Arc::new(work);
    let results = stream::iter(chunks)
        .map(|chunk| {
            let work = Arc::clone(&work);
            let pb = pb.clone();
            async move {
                task::spawn_blocking(move || {
                    chunk
                        .into_iter()
                        .map(|item| {
                            let result = work(item);
                            pb.inc(1);
                            result
                        })
                        .collect::<Vec<R>>()
                })
                .await
            }
        })
        .buffer_unordered(workers)
        .collect::<Vec<_>>()
        .await;

    pb.finish_with_message(format!("{} complete", message));

    let mut out = Vec::new();
    for result in results {
        match result {
            Ok(chunk) => out.extend(chunk),
            Err(e) => error!("Worker task failed: {}", e),
        }
    }
    out
}
