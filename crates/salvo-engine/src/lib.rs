//! Salvo Engine -- projectile simulation on top of [`salvo_ecs`].
//!
//! Projectiles are lightweight entities: a transform, a velocity, a force, a
//! slot for the last hit and a few weak references, plus shared fragments
//! describing the whole family. Two processors drive them:
//!
//! - [`ProjectileMovementProcessor`](movement::ProjectileMovementProcessor)
//!   integrates velocity, sweeps through the collision world in parallel
//!   chunks, and publishes `projectile.hit` for everything that hit;
//! - [`ProjectileHitProcessor`](hit::ProjectileHitProcessor) consumes that
//!   signal, applies damage through a [`DamageInterface`](damage::DamageInterface)
//!   and destroys the projectiles through the command buffer.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use glam::Vec3;
//! use salvo_engine::prelude::*;
//!
//! let mut tick_loop = TickLoop::new(World::new(), SimulationConfig::default()).unwrap();
//! let actors = ActorRegistry::shared();
//! install_projectile_pipeline(
//!     &mut tick_loop,
//!     ProjectileServices {
//!         collision: Arc::new(
//!             SimpleCollisionWorld::new().with(CollisionBody::plane(Vec3::Z, Vec3::ZERO)),
//!         ),
//!         gravity: Arc::new(ConstantGravity(Vec3::new(0.0, 0.0, -980.0))),
//!         actors: Arc::clone(&actors),
//!         damage: Box::new(DamageLedger::new()),
//!     },
//! )
//! .unwrap();
//!
//! let template =
//!     ProjectileTemplate::new(tick_loop.world_mut(), &ProjectileConfig::default()).unwrap();
//! let shot = template
//!     .spawn(
//!         tick_loop.world_mut(),
//!         SpawnParams {
//!             transform: Transform::from_position(Vec3::new(0.0, 0.0, 100.0)),
//!             velocity: Vec3::new(0.0, 0.0, -3000.0),
//!             ..SpawnParams::default()
//!         },
//!     )
//!     .unwrap();
//!
//! tick_loop.run_ticks(5).unwrap();
//! assert!(!tick_loop.world().is_alive(shot));
//! ```

#![deny(unsafe_code)]

pub mod actor;
pub mod collision;
pub mod config;
pub mod damage;
pub mod fragments;
pub mod hit;
pub mod movement;
#[cfg(feature = "rapier")]
pub mod rapier_backend;
pub mod spawn;
pub mod telemetry;
pub mod tick;

/// Re-export the ECS crate for convenience.
pub use salvo_ecs;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while building or running a simulation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ecs(#[from] salvo_ecs::EcsError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use salvo_ecs::prelude::*;

    pub use crate::actor::{ActorHandle, ActorRegistry, PrimitiveHandle, SharedActors};
    pub use crate::collision::{
        ChannelMask, CollisionBody, CollisionChannel, CollisionQuery, ConstantGravity,
        SimpleCollisionWorld, SweepHit, SweepQuery, SweepShape, WorldGravity,
    };
    pub use crate::config::{ConfigError, SimulationConfig};
    pub use crate::damage::{DamageError, DamageInterface, DamageLedger, DamageRequest};
    pub use crate::fragments::{
        ArchetypeDescription, CollisionIgnoreList, DamageDescriptor, DamageEffectId, Force,
        GravityScale, HitInfo, InstigatorOwner, Transform, Velocity,
    };
    pub use crate::hit::{ProjectileHitProcessor, HIT_PROCESSOR_NAME};
    pub use crate::movement::{ProjectileMovementProcessor, MOVEMENT_PROCESSOR_NAME, PROJECTILE_HIT};
    pub use crate::spawn::{
        install_projectile_pipeline, register_projectile_fragments, ProjectileConfig,
        ProjectileServices, ProjectileTemplate, SpawnParams,
    };
    pub use crate::tick::{TickDiagnostics, TickLoop, TickReport};
    pub use crate::EngineError;
}
