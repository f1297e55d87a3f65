//! Projectile fragments.
//!
//! Per-entity fragments change (or may change) per projectile; shared
//! fragments describe a whole family of projectiles and are deduplicated by
//! value in the store.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::actor::{ActorHandle, PrimitiveHandle};
use crate::collision::{CollisionChannel, SweepHit};

// ---------------------------------------------------------------------------
// Per-entity fragments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::from_position(Vec3::ZERO)
    }
}

/// Linear velocity in world units per second.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    pub value: Vec3,
}

/// Constant acceleration applied on top of gravity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Force {
    pub value: Vec3,
}

/// Last blocking hit, written by the movement processor on the tick it
/// collides.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HitInfo {
    pub hit: Option<SweepHit>,
}

/// Actors and primitives the projectile's sweeps pass through.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollisionIgnoreList {
    pub actors: SmallVec<[ActorHandle; 2]>,
    pub primitives: SmallVec<[PrimitiveHandle; 2]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InstigatorOwner {
    /// Who is responsible for the shot (pawn or controller).
    pub instigator: Option<ActorHandle>,
    /// What fired it (damage causer).
    pub owner: Option<ActorHandle>,
}

// ---------------------------------------------------------------------------
// Shared fragments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchetypeDescription {
    pub collision_channel: CollisionChannel,
    /// Sweep sphere radius; zero or less traces a line.
    pub sweep_radius: f32,
    pub rotation_follows_velocity: bool,
}

impl Default for ArchetypeDescription {
    fn default() -> Self {
        Self {
            collision_channel: CollisionChannel::Camera,
            sweep_radius: 0.0,
            rotation_follows_velocity: true,
        }
    }
}

/// Identifies a damage effect understood by the damage interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct DamageEffectId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DamageDescriptor {
    pub effect: DamageEffectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GravityScale {
    pub scale: f32,
}

impl Default for GravityScale {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

// ---------------------------------------------------------------------------
// Registered names
// ---------------------------------------------------------------------------

pub const TRANSFORM: &str = "transform";
pub const VELOCITY: &str = "velocity";
pub const FORCE: &str = "force";
pub const HIT_INFO: &str = "hit_info";
pub const COLLISION_IGNORE_LIST: &str = "collision_ignore_list";
pub const INSTIGATOR_OWNER: &str = "instigator_owner";
pub const ARCHETYPE_DESCRIPTION: &str = "archetype_description";
pub const DAMAGE_DESCRIPTOR: &str = "damage_descriptor";
pub const GRAVITY_SCALE: &str = "gravity_scale";
