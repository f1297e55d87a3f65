//! The processor contract.
//!
//! A [`Processor`] is one unit of per-tick work. It declares its fragment
//! access, its ordering constraints and the signals it consumes; the
//! [`Pipeline`](crate::schedule::Pipeline) turns those declarations into
//! stages and calls [`Processor::execute`] with an [`ExecutionContext`].
//!
//! The context is the processor's only window on the tick: read-only access
//! to the store through [`EntityQuery`](crate::query::EntityQuery), the
//! command buffer for structural changes, the signal queue for publishing,
//! and the signals delivered to this processor.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::access::{AccessSet, ExecutionMode};
use crate::command::CommandBuffer;
use crate::entity::EntityHandle;
use crate::query::EntityQuery;
use crate::signal::{SignalDelivery, SignalName, SignalQueue};
use crate::world::World;

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub trait Processor: Send {
    /// Unique name within a pipeline. Also used as the signal subscriber name
    /// and as `issued_by` on queued commands.
    fn name(&self) -> &str;

    /// Every fragment type this processor may touch, across all its queries.
    fn access(&self) -> AccessSet;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Parallel
    }

    /// Names of processors that must run in an earlier stage.
    fn run_after(&self) -> Vec<String> {
        Vec::new()
    }

    /// Names of processors that must run in a later stage. Lets an observer
    /// order itself ahead of a processor it does not own.
    fn run_before(&self) -> Vec<String> {
        Vec::new()
    }

    /// Signals this processor consumes. A processor with subscriptions only
    /// runs on ticks where at least one of them delivered something.
    fn subscriptions(&self) -> Vec<SignalName> {
        Vec::new()
    }

    fn execute(&mut self, ctx: &ExecutionContext<'_>);
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Everything a processor may use during one invocation.
pub struct ExecutionContext<'w> {
    world: &'w World,
    access: AccessSet,
    processor: String,
    commands: &'w CommandBuffer,
    signals: &'w SignalQueue,
    delivery: SignalDelivery,
    delta_seconds: f32,
    tick: u64,
    chunk_size: usize,
    parallel: bool,
    iterating: AtomicBool,
}

/// Per-invocation settings supplied by the pipeline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameParams {
    pub(crate) delta_seconds: f32,
    pub(crate) tick: u64,
    pub(crate) chunk_size: usize,
    pub(crate) parallel: bool,
}

impl<'w> ExecutionContext<'w> {
    pub(crate) fn new(
        world: &'w World,
        processor: &dyn Processor,
        commands: &'w CommandBuffer,
        signals: &'w SignalQueue,
        delivery: SignalDelivery,
        frame: FrameParams,
    ) -> Self {
        Self {
            world,
            access: processor.access(),
            processor: processor.name().to_owned(),
            commands,
            signals,
            delivery,
            delta_seconds: frame.delta_seconds,
            tick: frame.tick,
            chunk_size: frame.chunk_size.max(1),
            parallel: frame.parallel && processor.execution_mode() == ExecutionMode::Parallel,
            iterating: AtomicBool::new(false),
        }
    }

    pub fn commands(&self) -> &CommandBuffer {
        self.commands
    }

    pub fn signals(&self) -> &SignalQueue {
        self.signals
    }

    /// Signals delivered to this processor for this invocation.
    pub fn delivered(&self) -> &SignalDelivery {
        &self.delivery
    }

    pub fn delta_seconds(&self) -> f32 {
        self.delta_seconds
    }

    /// Index of the tick being run (0 for the first tick).
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn processor_name(&self) -> &str {
        &self.processor
    }

    pub fn access(&self) -> &AccessSet {
        &self.access
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether chunks of this invocation may run on several threads.
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Handle validity check. Entity slots never change during a stage.
    pub fn is_alive(&self, entity: EntityHandle) -> bool {
        self.world.is_alive(entity)
    }

    pub(crate) fn world(&self) -> &'w World {
        self.world
    }

    /// # Panics
    ///
    /// Panics if `query` needs access this processor did not declare.
    pub(crate) fn check_access(&self, query: &EntityQuery) {
        assert!(
            self.access.covers(query.access()),
            "processor '{}' ran a query outside its declared access: declared {:?}, query {:?}",
            self.processor,
            self.access,
            query.access()
        );
    }

    /// # Panics
    ///
    /// Panics if the processor is already iterating a query.
    pub(crate) fn begin_iteration(&self) -> IterationGuard<'_> {
        let acquired = self
            .iterating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        assert!(
            acquired,
            "processor '{}' started a query iteration while another one is running",
            self.processor
        );
        IterationGuard(&self.iterating)
    }
}

pub(crate) struct IterationGuard<'a>(&'a AtomicBool);

impl Drop for IterationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("processor", &self.processor)
            .field("tick", &self.tick)
            .field("delta_seconds", &self.delta_seconds)
            .field("parallel", &self.parallel)
            .field("delivered", &self.delivery.len())
            .finish()
    }
}
