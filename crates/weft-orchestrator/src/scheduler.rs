use crate::probe::ResourceProbe;
use crate::task_queue::{has_cycle, QueuedTask, TaskQueue};
use crate::types::{work_fn, TaskSpec, TaskStatus, WorkFn};
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use weft_cache::Cache;
use weft_core::{ErrorCategory, EventBus, EventSubscription, WeftError, WeftResult};

/// Pressure above which the limit shrinks, in percent.
const SHRINK_ABOVE: f64 = 80.0;
/// Pressure below which the limit grows, in percent.
const GROW_BELOW: f64 = 50.0;
const SHRINK_FACTOR: f64 = 0.8;
const GROW_FACTOR: f64 = 1.2;

/// Scheduler configuration (the `[scheduler]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Starting concurrency limit.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Hard ceiling adaptive scaling never exceeds.
    #[serde(default = "default_ceiling")]
    pub max_concurrency_ceiling: usize,
    #[serde(default = "default_true")]
    pub adaptive: bool,
    #[serde(default = "default_adaptive_interval")]
    pub adaptive_interval_secs: u64,
    /// Default chunk size for [`Scheduler::process_batch`].
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_ceiling() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_adaptive_interval() -> u64 {
    10
}

fn default_batch_size() -> usize {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_concurrency_ceiling: default_ceiling(),
            adaptive: true,
            adaptive_interval_secs: default_adaptive_interval(),
            batch_size: default_batch_size(),
        }
    }
}

impl SchedulerConfig {
    pub fn adaptive_interval(&self) -> Duration {
        Duration::from_secs(self.adaptive_interval_secs.max(1))
    }
}

/// Scheduler notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Added {
        id: String,
        priority: i32,
    },
    /// The task's work started. `attempt` counts from 1.
    Executing {
        id: String,
        attempt: u32,
    },
    Completed {
        id: String,
        duration: Duration,
    },
    Failed {
        id: String,
        error: String,
        will_retry: bool,
    },
    ConcurrencyAdjusted {
        from: usize,
        to: usize,
        cpu_percent: f64,
        memory_percent: f64,
    },
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub running: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub concurrency_limit: usize,
    pub paused: bool,
}

/// Resolves with the task's terminal result.
///
/// Dropping the handle does not cancel the task.
pub struct TaskHandle {
    id: String,
    rx: oneshot::Receiver<WeftResult<Value>>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for TaskHandle {
    type Output = WeftResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WeftError::Scheduler(format!(
                "Task '{}' was dropped before finishing",
                self.id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Options for [`Scheduler::process_batch`].
pub struct BatchOptions<T> {
    /// Items per chunk. Defaults to the scheduler's `batch_size`.
    pub batch_size: Option<usize>,
    /// Cache key for an item. Only consulted when the scheduler has a cache.
    pub cache_key: Option<Arc<dyn Fn(&T) -> String + Send + Sync>>,
    pub cache_ttl: Option<Duration>,
    pub priority: i32,
    pub max_retries: u32,
}

impl<T> Default for BatchOptions<T> {
    fn default() -> Self {
        Self {
            batch_size: None,
            cache_key: None,
            cache_ttl: None,
            priority: 0,
            max_retries: 0,
        }
    }
}

impl<T> BatchOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_cache_key(mut self, key: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.cache_key = Some(Arc::new(key));
        self
    }
}

struct State {
    queue: TaskQueue,
    running: HashSet<String>,
    completed: HashSet<String>,
    /// Terminal failures with their reason.
    failed: HashMap<String, String>,
    limit: usize,
    paused: bool,
}

impl State {
    /// Pop ready tasks until the limit is saturated.
    fn collect_launches(&mut self) -> Vec<QueuedTask> {
        let mut launches = Vec::new();
        while !self.paused && self.running.len() < self.limit {
            let Some(task) = self.queue.take_next_ready(&self.completed) else {
                break;
            };
            self.running.insert(task.id().to_string());
            launches.push(task);
        }
        launches
    }

    fn is_known(&self, id: &str) -> bool {
        self.running.contains(id) || self.completed.contains(id) || self.queue.contains(id)
    }
}

/// Priority and dependency aware executor with a concurrency limit.
///
/// Tasks run on the Tokio runtime, so submissions must happen inside one.
/// A task becomes eligible once every dependency id is in the completed set;
/// among eligible tasks the highest priority runs first, ties broken by
/// submission order.
pub struct Scheduler {
    config: SchedulerConfig,
    state: Mutex<State>,
    events: EventBus<TaskEvent>,
    cache: Option<Arc<Cache>>,
    adaptive_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let ceiling = config.max_concurrency_ceiling.max(1);
        let limit = config.max_concurrency.clamp(1, ceiling);
        Self {
            config,
            state: Mutex::new(State {
                queue: TaskQueue::new(),
                running: HashSet::new(),
                completed: HashSet::new(),
                failed: HashMap::new(),
                limit,
                paused: false,
            }),
            events: EventBus::default(),
            cache: None,
            adaptive_loop: Mutex::new(None),
        }
    }

    /// Memoize batch work through `cache`.
    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    pub fn subscribe(&self) -> EventSubscription<TaskEvent> {
        self.events.subscribe()
    }

    pub fn concurrency_limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Queue one task and start whatever is now runnable.
    ///
    /// Fails if a task with the same id is pending, running, or completed. A
    /// task that depends on an already failed task resolves immediately with a
    /// dependency error.
    pub fn add(self: &Arc<Self>, spec: TaskSpec) -> WeftResult<TaskHandle> {
        let handle = {
            let mut state = self.state.lock();
            if state.is_known(&spec.id) {
                return Err(WeftError::Scheduler(format!(
                    "Task '{}' is already scheduled",
                    spec.id
                )));
            }
            self.admit(&mut state, spec)
        };
        self.drain();
        Ok(handle)
    }

    /// Queue a batch as a whole: nothing starts until every task is queued,
    /// so the batch is ordered by priority regardless of submission order.
    ///
    /// The batch is rejected without queueing anything if an id is duplicated
    /// or the dependency graph (including pending tasks) has a cycle.
    pub fn add_all(self: &Arc<Self>, specs: Vec<TaskSpec>) -> WeftResult<Vec<TaskHandle>> {
        let handles = {
            let mut state = self.state.lock();
            let mut seen = HashSet::new();
            for spec in &specs {
                if state.is_known(&spec.id) || !seen.insert(spec.id.as_str()) {
                    return Err(WeftError::Scheduler(format!(
                        "Task '{}' is already scheduled",
                        spec.id
                    )));
                }
            }
            let mut graph = state.queue.graph();
            for spec in &specs {
                graph.insert(spec.id.clone(), spec.dependencies.clone());
            }
            if has_cycle(&graph) {
                return Err(WeftError::Scheduler(
                    "Dependency cycle in submitted tasks".into(),
                ));
            }
            specs
                .into_iter()
                .map(|spec| self.admit(&mut state, spec))
                .collect::<Vec<_>>()
        };
        self.drain();
        Ok(handles)
    }

    fn admit(&self, state: &mut State, spec: TaskSpec) -> TaskHandle {
        let (tx, rx) = oneshot::channel();
        let id = spec.id.clone();
        let priority = spec.priority;
        state.failed.remove(&id);
        let mut task = state.queue.admit(spec, tx);

        if let Some(dep) = task
            .spec
            .dependencies
            .iter()
            .find(|d| state.failed.contains_key(*d))
            .cloned()
        {
            let message = format!("Dependency '{dep}' failed");
            warn!(task = %id, dependency = %dep, "Rejecting task whose dependency already failed");
            state.failed.insert(id.clone(), message.clone());
            task.resolve(Err(WeftError::categorized(ErrorCategory::Dependency, message)));
            return TaskHandle { id, rx };
        }

        debug!(task = %id, priority, "Task queued");
        state.queue.push(task);
        self.events.publish(TaskEvent::Added {
            id: id.clone(),
            priority,
        });
        TaskHandle { id, rx }
    }

    /// Stop starting new tasks. Running tasks continue.
    pub fn pause(&self) {
        self.state.lock().paused = true;
        debug!("Scheduler paused");
    }

    pub fn resume(self: &Arc<Self>) {
        self.state.lock().paused = false;
        debug!("Scheduler resumed");
        self.drain();
    }

    /// Treat `id` as already completed, releasing its dependents.
    pub fn mark_completed(self: &Arc<Self>, id: impl Into<String>) {
        self.state.lock().completed.insert(id.into());
        self.drain();
    }

    /// Drop the completed and failed records of every task whose id starts
    /// with `prefix`. Pending and running tasks are untouched.
    ///
    /// Returns how many records were dropped.
    pub fn forget(&self, prefix: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.completed.len() + state.failed.len();
        state.completed.retain(|id| !id.starts_with(prefix));
        state.failed.retain(|id, _| !id.starts_with(prefix));
        let dropped = before - state.completed.len() - state.failed.len();
        if dropped > 0 {
            debug!(prefix, dropped, "Forgot finished tasks");
        }
        dropped
    }

    /// Whether the pending tasks' dependency graph contains a cycle.
    pub fn has_cycle(&self) -> bool {
        self.state.lock().queue.has_cycle()
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        let state = self.state.lock();
        if state.running.contains(id) {
            Some(TaskStatus::Running)
        } else if state.completed.contains(id) {
            Some(TaskStatus::Completed)
        } else if let Some(reason) = state.failed.get(id) {
            Some(TaskStatus::Failed {
                reason: reason.clone(),
            })
        } else if state.queue.contains(id) {
            Some(TaskStatus::Pending)
        } else {
            None
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            running: state.running.len(),
            pending: state.queue.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            concurrency_limit: state.limit,
            paused: state.paused,
        }
    }

    fn drain(self: &Arc<Self>) {
        let launches = self.state.lock().collect_launches();
        for task in launches {
            self.launch(task);
        }
    }

    fn launch(self: &Arc<Self>, task: QueuedTask) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let attempt = task.retry_count + 1;
            let waited_ms = (chrono::Utc::now() - task.enqueued_at).num_milliseconds();
            debug!(task = %task.id(), attempt, waited_ms, "Executing task");
            scheduler.events.publish(TaskEvent::Executing {
                id: task.id().to_string(),
                attempt,
            });

            let started = Instant::now();
            let result = AssertUnwindSafe((task.spec.work)())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(WeftError::Scheduler(format!("Task '{}' panicked", task.id())))
                });
            scheduler.finish(task, result, started.elapsed());
        });
    }

    /// Settle a finished task.
    ///
    /// On success the freed slot is refilled from tasks that were already
    /// eligible before the task joins the completed set; its dependents start
    /// in the slots left over.
    fn finish(self: &Arc<Self>, mut task: QueuedTask, result: WeftResult<Value>, elapsed: Duration) {
        let id = task.id().to_string();
        let mut state = self.state.lock();
        state.running.remove(&id);

        let launches = match result {
            Ok(value) => {
                let mut launches = state.collect_launches();
                state.completed.insert(id.clone());
                launches.extend(state.collect_launches());
                drop(state);

                debug!(task = %id, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
                self.events.publish(TaskEvent::Completed {
                    id: id.clone(),
                    duration: elapsed,
                });
                task.resolve(Ok(value));
                launches
            }
            Err(e) if task.retry_count < task.spec.max_retries => {
                task.retry_count += 1;
                let attempt = task.retry_count;
                state.queue.push(task);
                let launches = state.collect_launches();
                drop(state);

                warn!(task = %id, attempt, error = %e, "Task failed, re-queued");
                self.events.publish(TaskEvent::Failed {
                    id,
                    error: e.to_string(),
                    will_retry: true,
                });
                launches
            }
            Err(e) => {
                let message = e.to_string();
                state.failed.insert(id.clone(), message.clone());
                let dependents = state.queue.remove_dependents_of(&id);
                let reason = format!("Dependency '{id}' failed");
                for dependent in &dependents {
                    state
                        .failed
                        .insert(dependent.id().to_string(), reason.clone());
                }
                let launches = state.collect_launches();
                drop(state);

                error!(
                    task = %id,
                    attempts = task.retry_count + 1,
                    error = %message,
                    abandoned = dependents.len(),
                    "Task failed"
                );
                self.events.publish(TaskEvent::Failed {
                    id: id.clone(),
                    error: message,
                    will_retry: false,
                });
                task.resolve(Err(e));
                for mut dependent in dependents {
                    self.events.publish(TaskEvent::Failed {
                        id: dependent.id().to_string(),
                        error: reason.clone(),
                        will_retry: false,
                    });
                    dependent.resolve(Err(WeftError::categorized(
                        ErrorCategory::Dependency,
                        reason.clone(),
                    )));
                }
                launches
            }
        };

        for task in launches {
            self.launch(task);
        }
    }

    /// Resize the concurrency limit from resource pressure (percentages).
    ///
    /// Either metric above 80% shrinks the limit by 0.8 (never below 1); both
    /// below 50% grow it by 1.2, at least by one, up to the ceiling. Does
    /// nothing unless adaptive scaling is enabled. Returns the new limit.
    pub fn adjust_concurrency(self: &Arc<Self>, cpu_percent: f64, memory_percent: f64) -> usize {
        let (from, to) = {
            let mut state = self.state.lock();
            let from = state.limit;
            if !self.config.adaptive {
                return from;
            }
            let ceiling = self.config.max_concurrency_ceiling.max(1);
            let to = if cpu_percent > SHRINK_ABOVE || memory_percent > SHRINK_ABOVE {
                ((from as f64 * SHRINK_FACTOR).floor() as usize).max(1)
            } else if cpu_percent < GROW_BELOW && memory_percent < GROW_BELOW {
                ((from as f64 * GROW_FACTOR).floor() as usize)
                    .max(from + 1)
                    .min(ceiling)
            } else {
                from
            };
            state.limit = to;
            (from, to)
        };

        if from != to {
            info!(from, to, cpu_percent, memory_percent, "Concurrency limit adjusted");
            self.events.publish(TaskEvent::ConcurrencyAdjusted {
                from,
                to,
                cpu_percent,
                memory_percent,
            });
            if to > from {
                self.drain();
            }
        }
        to
    }

    /// Sample `probe` every `interval` and feed it to
    /// [`adjust_concurrency`](Self::adjust_concurrency). Calling it again
    /// replaces the running loop. No-op when adaptive scaling is disabled.
    pub fn start_adaptive_scaling(self: &Arc<Self>, probe: Arc<dyn ResourceProbe>, interval: Duration) {
        if !self.config.adaptive {
            debug!("Adaptive scaling disabled");
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(scheduler) = weak.upgrade() else {
                    break;
                };
                let sample = probe.sample().await;
                scheduler.adjust_concurrency(sample.cpu_percent, sample.memory_percent);
            }
        });
        if let Some(previous) = self.adaptive_loop.lock().replace(handle) {
            previous.abort();
        }
        info!(interval_ms = interval.as_millis() as u64, "Adaptive scaling started");
    }

    /// Stop adaptive scaling. Queued and running tasks are unaffected.
    pub fn shutdown(&self) {
        if let Some(handle) = self.adaptive_loop.lock().take() {
            handle.abort();
            info!("Adaptive scaling stopped");
        }
    }

    /// Run `processor` over `items` in chunks of the batch size, one
    /// scheduled task per item, and return the results in input order.
    ///
    /// Chunks run one after another. When the scheduler has a cache and
    /// `options.cache_key` is set, each item's result is memoized under its
    /// key. The first failed item (in input order) fails the whole call once
    /// its chunk has settled.
    pub async fn process_batch<T, F, Fut>(
        self: &Arc<Self>,
        items: Vec<T>,
        processor: F,
        options: BatchOptions<T>,
    ) -> WeftResult<Vec<Value>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WeftResult<Value>> + Send + 'static,
    {
        let processor = Arc::new(processor);
        let batch_size = options.batch_size.unwrap_or(self.config.batch_size).max(1);
        let batch_id = Uuid::new_v4();
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        debug!(%batch_id, total, batch_size, "Processing batch");

        for (chunk_index, chunk) in items.chunks(batch_size).enumerate() {
            let mut handles = Vec::with_capacity(chunk.len());
            for (offset, item) in chunk.iter().enumerate() {
                let index = chunk_index * batch_size + offset;
                let work = self.batch_work(item.clone(), Arc::clone(&processor), &options);
                let spec = TaskSpec::new(format!("batch-{batch_id}-{index}"), work)
                    .with_priority(options.priority)
                    .with_max_retries(options.max_retries);
                handles.push(self.add(spec)?);
            }
            for result in join_all(handles).await {
                results.push(result?);
            }
        }
        Ok(results)
    }

    fn batch_work<T, F, Fut>(&self, item: T, processor: Arc<F>, options: &BatchOptions<T>) -> WorkFn
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WeftResult<Value>> + Send + 'static,
    {
        let cached = match (&self.cache, &options.cache_key) {
            (Some(cache), Some(key)) => Some((Arc::clone(cache), key(&item))),
            _ => None,
        };
        let ttl = options.cache_ttl;
        work_fn(move || {
            let item = item.clone();
            let processor = Arc::clone(&processor);
            let cached = cached.clone();
            async move {
                match cached {
                    Some((cache, key)) => {
                        cache
                            .get_or_compute(&key, ttl, || processor(item))
                            .await
                    }
                    None => processor(item).await,
                }
            }
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.adaptive_loop.get_mut().take() {
            handle.abort();
        }
    }
}
