//! Fixed-timestep tick loop.
//!
//! The [`TickLoop`] owns the [`World`] and the [`Pipeline`] and drives them
//! forward one fixed step at a time. Each tick:
//!
//! 1. Commands queued from outside are applied and pending signals dispatched.
//! 2. Every pipeline stage runs, followed by a command flush and a signal
//!    dispatch.
//! 3. The tick counter and simulation time advance.
//!
//! # Example
//!
//! ```
//! use salvo_engine::config::SimulationConfig;
//! use salvo_engine::tick::TickLoop;
//! use salvo_ecs::prelude::*;
//!
//! let mut tick_loop = TickLoop::new(World::new(), SimulationConfig::default()).unwrap();
//! tick_loop.run_ticks(10).unwrap();
//!
//! assert_eq!(tick_loop.tick_count(), 10);
//! assert!((tick_loop.sim_time() - 10.0 / 60.0).abs() < 1e-12);
//! ```

use std::time::Duration;

use salvo_ecs::command::{Command, CommandBuffer};
use salvo_ecs::processor::Processor;
use salvo_ecs::schedule::{Pipeline, RunReport};
use salvo_ecs::signal::SignalQueue;
use salvo_ecs::world::World;
use tracing::debug;

use crate::config::SimulationConfig;
use crate::EngineError;

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing diagnostics for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time per stage, with the processors that ran in it.
    pub stage_times: Vec<(Vec<String>, Duration)>,
    /// Total time for the tick (stages + command apply).
    pub total_time: Duration,
    /// Time spent applying commands between stages.
    pub command_apply_time: Duration,
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Index of the tick that ran (0 for the first).
    pub tick: u64,
    /// Every command applied during the tick, in application order.
    pub commands: Vec<Command>,
    pub signals_routed: usize,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

pub struct TickLoop {
    world: World,
    pipeline: Pipeline,
    tick_counter: u64,
    config: SimulationConfig,
    last_diagnostics: TickDiagnostics,
}

impl TickLoop {
    /// Create a loop at tick 0. Fails if the configuration is invalid or the
    /// worker pool cannot be built.
    pub fn new(world: World, config: SimulationConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let pipeline = Pipeline::new(config.pipeline())?;
        Ok(Self {
            world,
            pipeline,
            tick_counter: 0,
            config,
            last_diagnostics: TickDiagnostics::default(),
        })
    }

    /// Register a processor. Ordering constraints are checked on the next
    /// tick, once every processor is known.
    pub fn add_processor(&mut self, processor: Box<dyn Processor>) -> Result<(), EngineError> {
        self.pipeline.add_processor(processor)?;
        Ok(())
    }

    /// Execute one simulation tick.
    pub fn tick(&mut self) -> Result<TickReport, EngineError> {
        let tick = self.tick_counter;
        let RunReport {
            stages,
            commands,
            signals_routed,
            total_time,
        } = self
            .pipeline
            .run(&mut self.world, self.config.fixed_dt as f32, tick)?;

        self.tick_counter += 1;
        self.last_diagnostics = TickDiagnostics {
            command_apply_time: stages.iter().map(|s| s.flush_time).sum(),
            stage_times: stages
                .into_iter()
                .map(|s| (s.processors, s.elapsed))
                .collect(),
            total_time,
        };
        debug!(
            tick,
            commands = commands.len(),
            entities = self.world.entity_count(),
            total_us = total_time.as_micros() as u64,
            "tick complete"
        );

        Ok(TickReport {
            tick,
            commands,
            signals_routed,
        })
    }

    /// Run `count` ticks. Returns the total number of commands processed.
    pub fn run_ticks(&mut self, count: u64) -> Result<u64, EngineError> {
        let mut total_commands = 0u64;
        for _ in 0..count {
            total_commands += self.tick()?.commands.len() as u64;
        }
        Ok(total_commands)
    }

    // -- accessors ----------------------------------------------------------

    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// Computed as `tick_count * fixed_dt` so it never drifts.
    pub fn sim_time(&self) -> f64 {
        self.tick_counter as f64 * self.config.fixed_dt
    }

    pub fn fixed_dt(&self) -> f64 {
        self.config.fixed_dt
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Direct world access, for setup and tests. During simulation prefer
    /// [`commands`](Self::commands).
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Commands queued here are applied at the start of the next tick.
    pub fn commands(&self) -> &CommandBuffer {
        self.pipeline.commands()
    }

    pub fn signals(&self) -> &SignalQueue {
        self.pipeline.signals()
    }

    /// For subscribing external observers.
    pub fn signals_mut(&mut self) -> &mut SignalQueue {
        self.pipeline.signals_mut()
    }

    /// Processor names per stage.
    pub fn stage_names(&mut self) -> Result<Vec<Vec<String>>, EngineError> {
        Ok(self.pipeline.stage_names()?)
    }

    pub fn processor_names(&self) -> Vec<&str> {
        self.pipeline.processor_names()
    }

    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
