//! Concurrent Executor: bounded-concurrency fan-out over an indexable
//! array or a lazy stream of parameter sets (spec.md §4.8).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::DriverError;

/// Stream-mode's "object-mode byte-stream emitting parameter vectors"
/// (spec.md §4.8), generalized to an async pull source rather than a
/// Node-style `data`/`error`/`end` emitter.
#[async_trait::async_trait]
pub trait ParameterStream<P>: Send {
    async fn next(&mut self) -> Option<Result<P, DriverError>>;
}

#[async_trait::async_trait]
impl<P: Send> ParameterStream<P> for mpsc::Receiver<Result<P, DriverError>> {
    async fn next(&mut self) -> Option<Result<P, DriverError>> {
        self.recv().await
    }
}

/// One item's outcome: either an opaque successful result (only retained
/// when `collect_results` is set) or the error it failed with.
#[derive(Debug)]
pub enum ItemOutcome<T> {
    Ok(T),
    Err(DriverError),
}

/// `concurrencyLevel`/`raiseOnFirstError`/`collectResults`/`maxErrors`
/// (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub concurrency_level: usize,
    pub raise_on_first_error: bool,
    pub collect_results: bool,
    pub max_errors: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency_level: 100,
            raise_on_first_error: true,
            collect_results: false,
            max_errors: 100,
        }
    }
}

/// Aggregate outcome of one `execute_concurrent` call.
pub struct ResultGroup<T> {
    pub total_executed: usize,
    pub resolved_count: usize,
    pub failed_count: usize,
    pub errors: Vec<DriverError>,
    /// `Some` only when `collect_results` was set (spec.md §4.8
    /// "otherwise accessing that property throws" — modeled here as
    /// `None` rather than a panicking accessor).
    pub result_items: Option<Vec<Option<T>>>,
}

/// spec.md §4.8 `executeConcurrent`.
pub struct ConcurrentExecutor;

impl ConcurrentExecutor {
    /// Array mode: fans out `concurrency_level` workers, each pulling
    /// indices `worker + k*N` and executing them sequentially (spec.md
    /// §4.8 "Array mode").
    pub async fn execute_array<P, T, F, Fut>(
        parameters: Vec<P>,
        options: ExecutorOptions,
        op: F,
    ) -> ResultGroup<T>
    where
        P: Send + 'static,
        T: Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, DriverError>> + Send,
    {
        let n = options.concurrency_level.min(parameters.len().max(1));
        let parameters = Arc::new(Mutex::new(parameters.into_iter().map(Some).collect::<Vec<_>>()));
        let op = Arc::new(op);
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let resolved = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let results: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let len = parameters.lock().await.len();
            if options.collect_results {
                results.lock().await.resize_with(len, || None);
            }
        }

        let mut workers = Vec::with_capacity(n);
        for worker in 0..n {
            let parameters = Arc::clone(&parameters);
            let op = Arc::clone(&op);
            let cancelled = Arc::clone(&cancelled);
            let resolved = Arc::clone(&resolved);
            let failed = Arc::clone(&failed);
            let errors = Arc::clone(&errors);
            let results = Arc::clone(&results);
            let raise_on_first_error = options.raise_on_first_error;
            let collect_results = options.collect_results;
            let max_errors = options.max_errors;
            workers.push(tokio::spawn(async move {
                let mut k = worker;
                loop {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let item = {
                        let mut guard = parameters.lock().await;
                        match guard.get_mut(k) {
                            Some(slot) => slot.take(),
                            None => None,
                        }
                    };
                    let Some(param) = item else { break };
                    match op(param).await {
                        Ok(value) => {
                            resolved.fetch_add(1, Ordering::SeqCst);
                            if collect_results {
                                results.lock().await[k] = Some(value);
                            }
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::SeqCst);
                            let mut guard = errors.lock().await;
                            if guard.len() < max_errors {
                                guard.push(e);
                            }
                            if raise_on_first_error {
                                cancelled.store(true, Ordering::SeqCst);
                            }
                        }
                    }
                    k += n;
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }

        let resolved_count = resolved.load(Ordering::SeqCst);
        let failed_count = failed.load(Ordering::SeqCst);
        ResultGroup {
            total_executed: resolved_count + failed_count,
            resolved_count,
            failed_count,
            errors: std::mem::take(&mut *errors.lock().await),
            result_items: if options.collect_results {
                Some(std::mem::take(&mut *results.lock().await))
            } else {
                None
            },
        }
    }

    /// Stream mode: consumes parameter sets off `stream`, pausing
    /// submission once in-flight work reaches `concurrency_level` and
    /// resuming on each completion (spec.md §4.8 "Stream mode"). A stream
    /// error rejects the whole aggregate regardless of
    /// `raise_on_first_error`.
    pub async fn execute_stream<P, T, F, Fut, S>(
        mut stream: S,
        options: ExecutorOptions,
        op: F,
    ) -> Result<ResultGroup<T>, DriverError>
    where
        P: Send + 'static,
        T: Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, DriverError>> + Send,
        S: ParameterStream<P>,
    {
        let op = Arc::new(op);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let resolved = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let results: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(Vec::new()));
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<()>();

        let mut index = 0usize;
        loop {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            while in_flight.load(Ordering::SeqCst) >= options.concurrency_level {
                // Paused: wait for a completion signal before pulling more
                // items off the stream (spec.md §4.8 "pause the stream
                // when in-flight reaches concurrencyLevel").
                if completion_rx.recv().await.is_none() {
                    break;
                }
            }

            match stream.next().await {
                Some(Ok(param)) => {
                    let idx = index;
                    index += 1;
                    if options.collect_results {
                        let mut guard = results.lock().await;
                        if guard.len() <= idx {
                            guard.resize_with(idx + 1, || None);
                        }
                    }
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    let op = Arc::clone(&op);
                    let in_flight2 = Arc::clone(&in_flight);
                    let resolved2 = Arc::clone(&resolved);
                    let failed2 = Arc::clone(&failed);
                    let errors2 = Arc::clone(&errors);
                    let results2 = Arc::clone(&results);
                    let cancelled2 = Arc::clone(&cancelled);
                    let completion_tx2 = completion_tx.clone();
                    let raise_on_first_error = options.raise_on_first_error;
                    let collect_results = options.collect_results;
                    let max_errors = options.max_errors;
                    tokio::spawn(async move {
                        match op(param).await {
                            Ok(value) => {
                                resolved2.fetch_add(1, Ordering::SeqCst);
                                if collect_results {
                                    results2.lock().await[idx] = Some(value);
                                }
                            }
                            Err(e) => {
                                failed2.fetch_add(1, Ordering::SeqCst);
                                let mut guard = errors2.lock().await;
                                if guard.len() < max_errors {
                                    guard.push(e);
                                }
                                if raise_on_first_error {
                                    cancelled2.store(true, Ordering::SeqCst);
                                }
                            }
                        }
                        in_flight2.fetch_sub(1, Ordering::SeqCst);
                        let _ = completion_tx2.send(());
                    });
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        while in_flight.load(Ordering::SeqCst) > 0 {
            if completion_rx.recv().await.is_none() {
                break;
            }
        }

        let resolved_count = resolved.load(Ordering::SeqCst);
        let failed_count = failed.load(Ordering::SeqCst);
        Ok(ResultGroup {
            total_executed: resolved_count + failed_count,
            resolved_count,
            failed_count,
            errors: std::mem::take(&mut *errors.lock().await),
            result_items: if options.collect_results {
                Some(std::mem::take(&mut *results.lock().await))
            } else {
                None
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn array_mode_runs_every_item_exactly_once() {
        let params: Vec<u32> = (0..600).collect();
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let current_in_flight = Arc::new(AtomicUsize::new(0));
        let mif = Arc::clone(&max_in_flight);
        let cif = Arc::clone(&current_in_flight);
        let group = ConcurrentExecutor::execute_array(
            params,
            ExecutorOptions {
                concurrency_level: 100,
                ..Default::default()
            },
            move |p: u32| {
                let mif = Arc::clone(&mif);
                let cif = Arc::clone(&cif);
                async move {
                    let now = cif.fetch_add(1, Ordering::SeqCst) + 1;
                    mif.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    cif.fetch_sub(1, Ordering::SeqCst);
                    Ok::<u32, DriverError>(p)
                }
            },
        )
        .await;
        assert_eq!(group.total_executed, 600);
        assert_eq!(group.resolved_count, 600);
        assert!(group.errors.is_empty());
        assert!(max_in_flight.load(Ordering::SeqCst) <= 100);
    }

    #[tokio::test]
    async fn concurrency_level_clamps_to_parameter_count() {
        let params: Vec<u32> = (0..5).collect();
        let observed = Arc::new(AtomicU32::new(0));
        let o2 = Arc::clone(&observed);
        let group = ConcurrentExecutor::execute_array(
            params,
            ExecutorOptions {
                concurrency_level: 100,
                ..Default::default()
            },
            move |p: u32| {
                let o2 = Arc::clone(&o2);
                async move {
                    o2.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, DriverError>(p)
                }
            },
        )
        .await;
        assert_eq!(group.total_executed, 5);
        assert_eq!(observed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn raise_on_first_error_stops_new_submissions() {
        let params: Vec<u32> = (0..50).collect();
        let group = ConcurrentExecutor::execute_array(
            params,
            ExecutorOptions {
                concurrency_level: 5,
                raise_on_first_error: true,
                ..Default::default()
            },
            |p: u32| async move {
                if p == 0 {
                    Err(DriverError::ArgumentError("boom".into()))
                } else {
                    Ok::<u32, DriverError>(p)
                }
            },
        )
        .await;
        assert!(group.failed_count >= 1);
        assert!(group.total_executed < 50);
    }

    #[tokio::test]
    async fn stream_mode_drains_to_completion_and_resolves_in_flight() {
        let (tx, rx) = mpsc::channel::<Result<u32, DriverError>>(10);
        tokio::spawn(async move {
            for i in 0..20u32 {
                let _ = tx.send(Ok(i)).await;
            }
        });
        let group = ConcurrentExecutor::execute_stream(
            rx,
            ExecutorOptions {
                concurrency_level: 4,
                raise_on_first_error: false,
                ..Default::default()
            },
            |p: u32| async move { Ok::<u32, DriverError>(p) },
        )
        .await
        .unwrap();
        assert_eq!(group.total_executed, 20);
        assert_eq!(group.resolved_count, 20);
    }

    #[tokio::test]
    async fn stream_error_rejects_regardless_of_raise_on_first_error() {
        let (tx, rx) = mpsc::channel::<Result<u32, DriverError>>(10);
        tokio::spawn(async move {
            let _ = tx.send(Ok(1)).await;
            let _ = tx.send(Err(DriverError::ArgumentError("stream failed".into()))).await;
        });
        let result = ConcurrentExecutor::execute_stream(
            rx,
            ExecutorOptions {
                raise_on_first_error: false,
                ..Default::default()
            },
            |p: u32| async move { Ok::<u32, DriverError>(p) },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn collect_results_populates_result_items_by_index() {
        let params: Vec<u32> = vec![10, 20, 30];
        let group = ConcurrentExecutor::execute_array(
            params,
            ExecutorOptions {
                concurrency_level: 3,
                collect_results: true,
                raise_on_first_error: false,
                ..Default::default()
            },
            |p: u32| async move { Ok::<u32, DriverError>(p * 2) },
        )
        .await;
        let items = group.result_items.expect("collect_results was set");
        assert_eq!(items, vec![Some(20), Some(40), Some(60)]);
    }
}
