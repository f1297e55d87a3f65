//! Salvo ECS -- archetype fragment store with a conflict-aware parallel
//! processor pipeline.
//!
//! Entities are opaque generational handles. Their data lives in archetypes
//! (one per unique combination of fragment types and shared fragment
//! instances) as one column per fragment type. Shared fragments are
//! immutable, deduplicated by content, and referenced by handle from the
//! archetype key, so every entity in an archetype sees the same instance.
//!
//! Per-tick work is expressed as [`Processor`](processor::Processor)s. The
//! [`Pipeline`](schedule::Pipeline) packs processors whose declared
//! [`AccessSet`](access::AccessSet)s do not conflict into concurrent stages,
//! iterates chunks in parallel, and flushes the [`CommandBuffer`](command::CommandBuffer)
//! and [`SignalQueue`](signal::SignalQueue) between stages.
//!
//! # Quick Start
//!
//! ```
//! use salvo_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Position(f32);
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Speed(f32);
//!
//! struct Integrate;
//!
//! impl Processor for Integrate {
//!     fn name(&self) -> &str {
//!         "integrate"
//!     }
//!     fn access(&self) -> AccessSet {
//!         AccessSet::new().write::<Position>().read::<Speed>()
//!     }
//!     fn execute(&mut self, ctx: &ExecutionContext<'_>) {
//!         let dt = ctx.delta_seconds();
//!         EntityQuery::new()
//!             .write::<Position>()
//!             .read::<Speed>()
//!             .for_each_chunk(ctx, |chunk| {
//!                 let speeds = chunk.fragments::<Speed>();
//!                 for (p, s) in chunk.fragments_mut::<Position>().iter_mut().zip(speeds) {
//!                     p.0 += s.0 * dt;
//!                 }
//!             });
//!     }
//! }
//!
//! let mut world = World::new();
//! world.register_fragment::<Position>("position");
//! world.register_fragment::<Speed>("speed");
//! let e = world
//!     .spawn(FragmentBundle::new().with(Position(0.0)).with(Speed(2.0)))
//!     .unwrap();
//!
//! let mut pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
//! pipeline.add_processor(Box::new(Integrate)).unwrap();
//! pipeline.run(&mut world, 0.5, 0).unwrap();
//!
//! assert_eq!(world.get::<Position>(e), Some(&Position(1.0)));
//! ```

#![deny(unsafe_code)]

pub mod access;
#[allow(unsafe_code)]
pub mod archetype;
pub mod command;
pub mod entity;
pub mod fragment;
pub mod processor;
#[allow(unsafe_code)]
pub mod query;
pub mod schedule;
pub mod shared;
pub mod signal;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store and pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::EntityHandle },

    /// A fragment type was referenced that has not been registered.
    #[error("fragment type '{name}' not registered. Registered fragments: [{registered}]")]
    UnknownFragment { name: String, registered: String },

    /// A JSON value could not be decoded into the named fragment.
    #[error("failed to deserialize fragment '{fragment}': {details}")]
    FragmentDeserialization { fragment: String, details: String },

    /// A row did not match the columns of its archetype.
    #[error("fragment row does not fit archetype {archetype:?}: {details}")]
    FragmentTypeMismatch {
        archetype: archetype::ArchetypeId,
        details: String,
    },

    /// A shared fragment value could not be encoded for deduplication.
    #[error("failed to encode shared fragment '{fragment}': {details}")]
    SharedFragmentEncoding { fragment: String, details: String },

    #[error("processor '{name}' is already registered")]
    DuplicateProcessor { name: String },

    #[error("processor '{processor}' runs after unknown processor '{dependency}'")]
    UnknownDependency {
        processor: String,
        dependency: String,
    },

    /// Ordering edges (`run_after`, `run_before`) form a cycle among the listed processors.
    #[error("processor dependency cycle among [{processors}]")]
    DependencyCycle { processors: String },

    #[error("failed to build worker pool: {details}")]
    ThreadPool { details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::access::{AccessSet, ExecutionMode};
    pub use crate::archetype::{Archetype, ArchetypeId};
    pub use crate::command::{
        ApplyReport, CausalReason, Command, CommandBuffer, CommandKind, CommandOutcome,
    };
    pub use crate::entity::EntityHandle;
    pub use crate::fragment::{Fragment, FragmentRegistry, FragmentTypeId, SharedFragment};
    pub use crate::processor::{ExecutionContext, Processor};
    pub use crate::query::{ChunkView, EntityQuery, EntityView};
    pub use crate::schedule::{Pipeline, PipelineConfig, RunReport, StageReport};
    pub use crate::shared::SharedFragmentHandle;
    pub use crate::signal::{SignalDelivery, SignalName, SignalQueue};
    pub use crate::world::{FragmentBundle, World};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
