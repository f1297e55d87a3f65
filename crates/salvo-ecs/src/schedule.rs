//! Access-conflict scheduling.
//!
//! The [`Pipeline`] owns the registered processors, the command buffer and
//! the signal queue, and runs one tick at a time:
//!
//! 1. flush commands queued from outside and dispatch pending signals;
//! 2. for each stage: run its processors (concurrently when there is more
//!    than one), then flush the command buffer and dispatch signals.
//!
//! Stages are computed once from the processors' declarations. Processors are
//! ordered topologically by their `run_after` and `run_before` edges (ties
//! broken by registration order) and packed greedily: a processor joins the current
//! stage only if it is parallel, conflicts with no member, and depends on no
//! member. Exclusive processors always get a stage of their own.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::access::{AccessSet, ExecutionMode};
use crate::command::{ApplyReport, Command, CommandBuffer};
use crate::processor::{ExecutionContext, FrameParams, Processor};
use crate::signal::{SignalDelivery, SignalName, SignalQueue};
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Configuration and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum rows per chunk.
    pub chunk_size: usize,
    /// When false, every stage and every chunk runs on the calling thread.
    pub parallel: bool,
    /// Size of a dedicated worker pool; `None` uses rayon's global pool.
    pub worker_threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 128,
            parallel: true,
            worker_threads: None,
        }
    }
}

/// What happened in one stage of a run.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    /// Processors that executed.
    pub processors: Vec<String>,
    /// Signal consumers that had nothing delivered and were not run.
    pub idle: Vec<String>,
    pub elapsed: Duration,
    pub flush_time: Duration,
    pub flush: ApplyReport,
}

/// Summary of one [`Pipeline::run`].
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    /// Every command applied during the run, in application order.
    pub commands: Vec<Command>,
    /// Signal handles routed to subscriber mailboxes.
    pub signals_routed: usize,
    pub total_time: Duration,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct Entry {
    name: String,
    access: AccessSet,
    mode: ExecutionMode,
    after: Vec<String>,
    before: Vec<String>,
    subscriptions: Vec<SignalName>,
    processor: Box<dyn Processor>,
}

/// Registered processors plus the per-tick plumbing they share.
pub struct Pipeline {
    config: PipelineConfig,
    pool: Option<rayon::ThreadPool>,
    entries: Vec<Entry>,
    stages: Option<Vec<Vec<usize>>>,
    commands: CommandBuffer,
    signals: SignalQueue,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, EcsError> {
        let pool = match config.worker_threads {
            Some(threads) if config.parallel => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("salvo-worker-{i}"))
                    .build()
                    .map_err(|e| EcsError::ThreadPool {
                        details: e.to_string(),
                    })?,
            ),
            _ => None,
        };
        Ok(Self {
            config,
            pool,
            entries: Vec::new(),
            stages: None,
            commands: CommandBuffer::new(),
            signals: SignalQueue::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Register a processor and subscribe it to its signals.
    ///
    /// Dependencies are checked when the schedule is built, so processors
    /// may be added in any order.
    pub fn add_processor(&mut self, processor: Box<dyn Processor>) -> Result<(), EcsError> {
        let name = processor.name().to_owned();
        if self.entries.iter().any(|e| e.name == name) {
            return Err(EcsError::DuplicateProcessor { name });
        }
        let subscriptions = processor.subscriptions();
        for signal in &subscriptions {
            self.signals.subscribe(*signal, &name);
        }
        self.entries.push(Entry {
            access: processor.access(),
            mode: processor.execution_mode(),
            after: processor.run_after(),
            before: processor.run_before(),
            subscriptions,
            name,
            processor,
        });
        self.stages = None;
        Ok(())
    }

    pub fn processor_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn commands(&self) -> &CommandBuffer {
        &self.commands
    }

    pub fn signals(&self) -> &SignalQueue {
        &self.signals
    }

    /// Mutable access for subscribing external observers.
    pub fn signals_mut(&mut self) -> &mut SignalQueue {
        &mut self.signals
    }

    /// Processor names per stage, building the schedule if needed.
    pub fn stage_names(&mut self) -> Result<Vec<Vec<String>>, EcsError> {
        let stages = self.schedule()?.clone();
        Ok(stages
            .iter()
            .map(|stage| stage.iter().map(|&i| self.entries[i].name.clone()).collect())
            .collect())
    }

    fn schedule(&mut self) -> Result<&Vec<Vec<usize>>, EcsError> {
        if self.stages.is_none() {
            let stages = build_stages(&self.entries)?;
            debug!(
                stages = stages.len(),
                processors = self.entries.len(),
                "pipeline schedule built"
            );
            self.stages = Some(stages);
        }
        Ok(self.stages.get_or_insert_with(Vec::new))
    }

    /// Apply queued commands and dispatch pending signals outside a run.
    pub fn flush(&mut self, world: &mut World) -> Vec<Command> {
        let applied = self.commands.apply(world);
        self.signals.dispatch(world);
        applied
    }

    /// Run every stage once.
    pub fn run(&mut self, world: &mut World, delta_seconds: f32, tick: u64) -> Result<RunReport, EcsError> {
        let run_start = Instant::now();
        let stages = self.schedule()?.clone();
        let frame = FrameParams {
            delta_seconds,
            tick,
            chunk_size: self.config.chunk_size,
            parallel: self.config.parallel,
        };

        let mut report = RunReport {
            commands: self.commands.apply(world),
            ..RunReport::default()
        };
        report.signals_routed += self.signals.dispatch(world);

        for (stage_index, stage) in stages.iter().enumerate() {
            let stage_start = Instant::now();
            let mut stage_report = StageReport::default();

            let mut jobs: HashMap<usize, SignalDelivery> = HashMap::new();
            for &idx in stage {
                let entry = &self.entries[idx];
                if entry.subscriptions.is_empty() {
                    jobs.insert(idx, SignalDelivery::default());
                    stage_report.processors.push(entry.name.clone());
                    continue;
                }
                let delivery = self.signals.take(&entry.name, world);
                if delivery.is_empty() {
                    stage_report.idle.push(entry.name.clone());
                } else {
                    jobs.insert(idx, delivery);
                    stage_report.processors.push(entry.name.clone());
                }
            }

            run_stage(
                &mut self.entries,
                jobs,
                world,
                &self.commands,
                &self.signals,
                self.pool.as_ref(),
                frame,
            );
            stage_report.elapsed = stage_start.elapsed();

            let flush_start = Instant::now();
            report.commands.extend(self.commands.apply(world));
            stage_report.flush = self.commands.last_apply_report().clone();
            report.signals_routed += self.signals.dispatch(world);
            stage_report.flush_time = flush_start.elapsed();

            debug!(
                tick,
                stage = stage_index,
                processors = ?stage_report.processors,
                idle = ?stage_report.idle,
                elapsed_us = stage_report.elapsed.as_micros() as u64,
                applied = stage_report.flush.applied,
                skipped = stage_report.flush.skipped,
                "stage complete"
            );
            report.stages.push(stage_report);
        }

        report.total_time = run_start.elapsed();
        Ok(report)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("processors", &self.processor_names())
            .field("stages", &self.stages)
            .finish()
    }
}

/// Execute one stage's processors against a shared borrow of the world.
fn run_stage(
    entries: &mut [Entry],
    mut jobs: HashMap<usize, SignalDelivery>,
    world: &World,
    commands: &CommandBuffer,
    signals: &SignalQueue,
    pool: Option<&rayon::ThreadPool>,
    frame: FrameParams,
) {
    let selected: Vec<(&mut Entry, SignalDelivery)> = entries
        .iter_mut()
        .enumerate()
        .filter_map(|(i, entry)| jobs.remove(&i).map(|d| (entry, d)))
        .collect();
    if selected.is_empty() {
        return;
    }

    let run_one = |entry: &mut Entry, delivery: SignalDelivery| {
        let ctx = ExecutionContext::new(
            world,
            entry.processor.as_ref(),
            commands,
            signals,
            delivery,
            frame,
        );
        entry.processor.execute(&ctx);
    };

    let exclusive = selected
        .iter()
        .any(|(entry, _)| entry.mode == ExecutionMode::Exclusive);
    if exclusive || !frame.parallel {
        for (entry, delivery) in selected {
            run_one(entry, delivery);
        }
        return;
    }

    let run_one = &run_one;
    let parallel = move || {
        if selected.len() == 1 {
            for (entry, delivery) in selected {
                run_one(entry, delivery);
            }
        } else {
            rayon::scope(|s| {
                for (entry, delivery) in selected {
                    s.spawn(move |_| run_one(entry, delivery));
                }
            });
        }
    };
    match pool {
        Some(pool) => pool.install(parallel),
        None => parallel(),
    }
}

/// Topologically order the processors and pack them into stages.
fn build_stages(entries: &[Entry]) -> Result<Vec<Vec<usize>>, EcsError> {
    let index: HashMap<&str, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.name.as_str(), i))
        .collect();

    let resolve = |entry: &Entry, name: &String| {
        index
            .get(name.as_str())
            .copied()
            .ok_or_else(|| EcsError::UnknownDependency {
                processor: entry.name.clone(),
                dependency: name.clone(),
            })
    };

    // deps[i] = processors that must run before i.
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, entry) in entries.iter().enumerate() {
        for name in &entry.after {
            deps[i].push(resolve(entry, name)?);
        }
        for name in &entry.before {
            deps[resolve(entry, name)?].push(i);
        }
    }

    // dependents[d] = processors that must run after d.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    let mut indegree = vec![0usize; entries.len()];
    for (i, list) in deps.iter().enumerate() {
        for &d in list {
            dependents[d].push(i);
            indegree[i] += 1;
        }
    }

    // Kahn's algorithm; the BTreeSet yields the lowest registration index
    // first, which keeps the order deterministic.
    let mut ready: BTreeSet<usize> = (0..entries.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(entries.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }
    if order.len() != entries.len() {
        let mut stuck: Vec<&str> = (0..entries.len())
            .filter(|i| !order.contains(i))
            .map(|i| entries[i].name.as_str())
            .collect();
        stuck.sort_unstable();
        return Err(EcsError::DependencyCycle {
            processors: stuck.join(", "),
        });
    }

    let mut stages: Vec<Vec<usize>> = Vec::new();
    let mut stage_of = vec![0usize; entries.len()];
    for i in order {
        let entry = &entries[i];
        let joins_last = stages.last().is_some_and(|stage| {
            let current = stages.len() - 1;
            entry.mode == ExecutionMode::Parallel
                && stage.iter().all(|&m| {
                    entries[m].mode == ExecutionMode::Parallel
                        && !entries[m].access.conflicts_with(&entry.access)
                })
                && deps[i].iter().all(|&d| stage_of[d] < current)
        });
        if joins_last {
            if let Some(stage) = stages.last_mut() {
                stage.push(i);
            }
        } else {
            stages.push(vec![i]);
        }
        stage_of[i] = stages.len() - 1;
    }
    Ok(stages)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct A;
    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct B;

    struct Stub {
        name: &'static str,
        access: AccessSet,
        mode: ExecutionMode,
        after: Vec<String>,
        before: Vec<String>,
    }

    impl Processor for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn access(&self) -> AccessSet {
            self.access.clone()
        }
        fn execution_mode(&self) -> ExecutionMode {
            self.mode
        }
        fn run_after(&self) -> Vec<String> {
            self.after.clone()
        }
        fn run_before(&self) -> Vec<String> {
            self.before.clone()
        }
        fn execute(&mut self, _ctx: &ExecutionContext<'_>) {}
    }

    fn stub(name: &'static str, access: AccessSet) -> Box<Stub> {
        Box::new(Stub {
            name,
            access,
            mode: ExecutionMode::Parallel,
            after: Vec::new(),
            before: Vec::new(),
        })
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(PipelineConfig::default()).unwrap()
    }

    #[test]
    fn non_conflicting_processors_share_a_stage() {
        let mut p = pipeline();
        p.add_processor(stub("read_a", AccessSet::new().read::<A>())).unwrap();
        p.add_processor(stub("read_a_too", AccessSet::new().read::<A>())).unwrap();
        p.add_processor(stub("write_b", AccessSet::new().write::<B>())).unwrap();
        assert_eq!(
            p.stage_names().unwrap(),
            vec![vec!["read_a", "read_a_too", "write_b"]]
        );
    }

    #[test]
    fn conflicting_processors_are_split() {
        let mut p = pipeline();
        p.add_processor(stub("write_a", AccessSet::new().write::<A>())).unwrap();
        p.add_processor(stub("read_a", AccessSet::new().read::<A>())).unwrap();
        assert_eq!(p.stage_names().unwrap(), vec![vec!["write_a"], vec!["read_a"]]);
    }

    #[test]
    fn dependencies_force_later_stage_and_order() {
        let mut p = pipeline();
        let mut late = stub("late", AccessSet::new().read::<B>());
        late.after = vec!["early".into()];
        p.add_processor(late).unwrap();
        p.add_processor(stub("early", AccessSet::new().read::<A>())).unwrap();
        assert_eq!(p.stage_names().unwrap(), vec![vec!["early"], vec!["late"]]);
    }

    #[test]
    fn run_before_places_processor_ahead_of_target() {
        let mut p = pipeline();
        p.add_processor(stub("target", AccessSet::new().read::<A>())).unwrap();
        let mut observer = stub("observer", AccessSet::new().read::<B>());
        observer.before = vec!["target".into()];
        p.add_processor(observer).unwrap();
        assert_eq!(p.stage_names().unwrap(), vec![vec!["observer"], vec!["target"]]);
    }

    #[test]
    fn run_before_and_run_after_can_sandwich_a_processor() {
        let mut p = pipeline();
        p.add_processor(stub("first", AccessSet::new())).unwrap();
        p.add_processor(stub("last", AccessSet::new())).unwrap();
        let mut middle = stub("middle", AccessSet::new());
        middle.after = vec!["first".into()];
        middle.before = vec!["last".into()];
        p.add_processor(middle).unwrap();
        assert_eq!(
            p.stage_names().unwrap(),
            vec![vec!["first"], vec!["middle"], vec!["last"]]
        );
    }

    #[test]
    fn exclusive_processor_runs_alone() {
        let mut p = pipeline();
        p.add_processor(stub("one", AccessSet::new())).unwrap();
        let mut ex = stub("exclusive", AccessSet::new());
        ex.mode = ExecutionMode::Exclusive;
        p.add_processor(ex).unwrap();
        p.add_processor(stub("two", AccessSet::new())).unwrap();
        assert_eq!(
            p.stage_names().unwrap(),
            vec![vec!["one"], vec!["exclusive"], vec!["two"]]
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut p = pipeline();
        p.add_processor(stub("same", AccessSet::new())).unwrap();
        assert!(matches!(
            p.add_processor(stub("same", AccessSet::new())),
            Err(EcsError::DuplicateProcessor { .. })
        ));
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let mut p = pipeline();
        let mut lonely = stub("lonely", AccessSet::new());
        lonely.after = vec!["missing".into()];
        p.add_processor(lonely).unwrap();
        assert!(matches!(
            p.stage_names(),
            Err(EcsError::UnknownDependency { .. })
        ));

        let mut p = pipeline();
        let mut eager = stub("eager", AccessSet::new());
        eager.before = vec!["missing".into()];
        p.add_processor(eager).unwrap();
        assert!(matches!(
            p.stage_names(),
            Err(EcsError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn cycles_are_reported() {
        let mut p = pipeline();
        let mut x = stub("x", AccessSet::new());
        x.after = vec!["y".into()];
        let mut y = stub("y", AccessSet::new());
        y.after = vec!["x".into()];
        p.add_processor(x).unwrap();
        p.add_processor(y).unwrap();
        let mut world = World::new();
        assert!(matches!(
            p.run(&mut world, 0.1, 0),
            Err(EcsError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn dedicated_pool_is_built_when_requested() {
        let p = Pipeline::new(PipelineConfig {
            worker_threads: Some(2),
            ..PipelineConfig::default()
        })
        .unwrap();
        assert!(p.pool.is_some());
    }
}
