//! Data-parallel fan-out over a query's matched entities.
//!
//! [`ParallelDispatcher`] splits an [`EntityView`] into one contiguous range
//! per worker and blocks until every range has been processed. The split is a
//! pure function of the view length and the worker count (see [`partition`]),
//! so the same inputs always produce the same chunks; only the order in which
//! chunks finish is unspecified.
//!
//! Chunks may:
//! - read any component store (shared borrows captured by the operation),
//! - write values of one store in place through [`dispatch_mut`](ParallelDispatcher::dispatch_mut),
//! - queue structural changes into their own [`CommandSegment`] through
//!   [`dispatch_with_commands`](ParallelDispatcher::dispatch_with_commands).
//!
//! Structural mutators need `&mut World`, which cannot coexist with the view
//! a dispatch runs over.

use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::command::{CommandLog, CommandSegment};
use crate::entity::EntityId;
use crate::query::EntityView;
use crate::storage::{dense_lookup, ComponentStore};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// One unit of work handed to a [`ParallelRunner`].
pub type Task<'s> = Box<dyn FnOnce() + Send + 's>;

/// Executes a batch of tasks on worker threads.
pub trait ParallelRunner: Send + Sync {
    /// Number of workers; the dispatcher creates this many chunks.
    fn worker_count(&self) -> usize;

    /// Run every task and return once all of them have finished.
    fn run<'s>(&self, tasks: Vec<Task<'s>>);
}

/// Worker pool settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Number of worker threads. `None` uses the available parallelism;
    /// `Some(0)` is treated as 1.
    pub worker_count: Option<usize>,
}

impl RunnerConfig {
    /// The worker count this config resolves to on the current machine.
    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1)
            })
            .max(1)
    }
}

/// A [`ParallelRunner`] backed by a dedicated rayon thread pool.
#[derive(Debug)]
pub struct DefaultParallelRunner {
    pool: rayon::ThreadPool,
}

impl DefaultParallelRunner {
    /// Build a pool sized from `config`.
    pub fn new(config: &RunnerConfig) -> Result<Self, EcsError> {
        let workers = config.resolved_worker_count();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("kestrel-worker-{i}"))
            .build()
            .map_err(|e| EcsError::RunnerUnavailable {
                details: e.to_string(),
            })?;
        debug!(workers, "parallel runner started");
        Ok(Self { pool })
    }
}

impl ParallelRunner for DefaultParallelRunner {
    fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn run<'s>(&self, tasks: Vec<Task<'s>>) {
        self.pool.scope(|scope| {
            for task in tasks {
                scope.spawn(move |_| task());
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

/// Split `[0, len)` into `workers` contiguous ranges.
///
/// Every range but the last has `len / workers` elements; the last one absorbs
/// the remainder. Ranges are disjoint and together cover `[0, len)` exactly
/// once. A `workers` of 0 is treated as 1.
pub fn partition(len: usize, workers: usize) -> impl Iterator<Item = Range<usize>> {
    let workers = workers.max(1);
    let chunk = len / workers;
    (0..workers).map(move |i| {
        let start = i * chunk;
        let end = if i + 1 == workers { len } else { start + chunk };
        start..end
    })
}

// ---------------------------------------------------------------------------
// ChunkMut
// ---------------------------------------------------------------------------

/// Exclusive access to the values of one component store, restricted to the
/// entities of a single dispatch chunk.
pub struct ChunkMut<'a, T> {
    entities: &'a [EntityId],
    values: *mut T,
    len: usize,
    sparse: &'a [u32],
    owners: &'a [EntityId],
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: a `ChunkMut` only ever hands out `&mut T` for the entities of its
// own chunk. Chunks come from one `EntityView`, whose entities are unique, and
// `partition` ranges are disjoint, so no two chunks reach the same value.
unsafe impl<T: Send> Send for ChunkMut<'_, T> {}

impl<'a, T> ChunkMut<'a, T> {
    /// The entities of this chunk.
    pub fn entities(&self) -> &'a [EntityId] {
        self.entities
    }

    /// Iterate `(entity, &mut value)` for the chunk's entities that carry a
    /// `T`. Entities without one are skipped.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut T)> + '_ {
        let values = self.values;
        let len = self.len;
        let sparse = self.sparse;
        let owners = self.owners;
        self.entities.iter().filter_map(move |&entity| {
            let dense = dense_lookup(sparse, owners, entity)?;
            debug_assert!(dense < len);
            // SAFETY: `dense < len` by the store's sparse-set invariant, the
            // store is exclusively borrowed for the whole dispatch, and each
            // entity appears once in the chunk, so every yielded reference
            // points at a distinct value.
            let value = unsafe { &mut *values.add(dense) };
            Some((entity, value))
        })
    }

    /// Call `f` on every `(entity, value)` pair of the chunk.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(EntityId, &mut T)) {
        for (entity, value) in self.iter_mut() {
            f(entity, value);
        }
    }
}

// ---------------------------------------------------------------------------
// ParallelDispatcher
// ---------------------------------------------------------------------------

/// Splits entity views across a [`ParallelRunner`].
///
/// Without a runner, or with a single-worker runner, every dispatch degrades
/// to one synchronous call on the full view.
#[derive(Clone, Default)]
pub struct ParallelDispatcher {
    runner: Option<Arc<dyn ParallelRunner>>,
}

impl std::fmt::Debug for ParallelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelDispatcher")
            .field("worker_count", &self.worker_count())
            .finish()
    }
}

impl ParallelDispatcher {
    /// A dispatcher over `runner`, or a sequential one for `None`.
    pub fn new(runner: Option<Arc<dyn ParallelRunner>>) -> Self {
        Self { runner }
    }

    /// A dispatcher that always runs on the calling thread.
    pub fn sequential() -> Self {
        Self { runner: None }
    }

    /// A dispatcher over a fresh [`DefaultParallelRunner`].
    pub fn from_config(config: &RunnerConfig) -> Result<Self, EcsError> {
        let runner = DefaultParallelRunner::new(config)?;
        Ok(Self::new(Some(Arc::new(runner))))
    }

    /// Number of chunks a dispatch is split into.
    pub fn worker_count(&self) -> usize {
        self.runner.as_ref().map_or(1, |r| r.worker_count().max(1))
    }

    fn parallel_runner(&self) -> Option<&dyn ParallelRunner> {
        self.runner.as_deref().filter(|r| r.worker_count() > 1)
    }

    /// Run `op` over disjoint sub-slices of `view`, one per worker.
    pub fn dispatch<F>(&self, view: EntityView<'_>, op: F)
    where
        F: Fn(&[EntityId]) + Sync,
    {
        let Some(runner) = self.parallel_runner() else {
            op(view.as_slice());
            return;
        };

        let op = &op;
        let entities = view.as_slice();
        let tasks: Vec<Task<'_>> = partition(entities.len(), runner.worker_count())
            .filter(|range| !range.is_empty())
            .map(|range| {
                let chunk = &entities[range];
                Box::new(move || op(chunk)) as Task<'_>
            })
            .collect();
        trace!(entities = entities.len(), chunks = tasks.len(), "dispatch");
        runner.run(tasks);
    }

    /// Like [`dispatch`](Self::dispatch), but chunk `i` also gets exclusive
    /// access to segment `i` of `log` for queuing structural changes.
    ///
    /// Segment order follows chunk order, so replaying `log` afterwards is
    /// deterministic regardless of which chunk finished first.
    pub fn dispatch_with_commands<F>(&self, view: EntityView<'_>, log: &mut CommandLog, op: F)
    where
        F: Fn(&[EntityId], &mut CommandSegment) + Sync,
    {
        let Some(runner) = self.parallel_runner() else {
            op(view.as_slice(), log.main());
            return;
        };

        let workers = runner.worker_count();
        let op = &op;
        let entities = view.as_slice();
        let tasks: Vec<Task<'_>> = partition(entities.len(), workers)
            .zip(log.segments_mut(workers).iter_mut())
            .filter(|(range, _)| !range.is_empty())
            .map(|(range, segment)| {
                let chunk = &entities[range];
                Box::new(move || op(chunk, segment)) as Task<'_>
            })
            .collect();
        trace!(entities = entities.len(), chunks = tasks.len(), "dispatch with commands");
        runner.run(tasks);
    }

    /// Run `op` over disjoint chunks of `view`, each with in-place write
    /// access to the chunk's values in `store`.
    ///
    /// The view must come from the same world as `store`; entities of the
    /// view without a `T` are skipped by [`ChunkMut::iter_mut`].
    pub fn dispatch_mut<T, F>(&self, view: EntityView<'_>, store: &mut ComponentStore<T>, op: F)
    where
        T: Send,
        F: Fn(ChunkMut<'_, T>) + Sync,
    {
        let (values, sparse, owners) = store.split_columns();
        let len = values.len();
        let base = values.as_mut_ptr();
        let entities = view.as_slice();
        let chunk = |range: Range<usize>| ChunkMut {
            entities: &entities[range],
            values: base,
            len,
            sparse,
            owners,
            _marker: PhantomData,
        };

        let Some(runner) = self.parallel_runner() else {
            op(chunk(0..entities.len()));
            return;
        };

        let op = &op;
        let tasks: Vec<Task<'_>> = partition(entities.len(), runner.worker_count())
            .filter(|range| !range.is_empty())
            .map(|range| {
                let chunk = chunk(range);
                Box::new(move || op(chunk)) as Task<'_>
            })
            .collect();
        trace!(entities = entities.len(), chunks = tasks.len(), "dispatch mut");
        runner.run(tasks);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
