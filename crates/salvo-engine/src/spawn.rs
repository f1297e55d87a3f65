//! Spawning projectiles and reading/writing their fragments by handle.
//!
//! A [`ProjectileTemplate`] resolves a [`ProjectileConfig`]'s shared fragments
//! once; every projectile spawned from it lands in the same archetype. The
//! free accessor functions mirror what gameplay code needs from outside the
//! pipeline: each checks the handle and does nothing on a stale one.

use std::sync::Arc;

use salvo_ecs::entity::EntityHandle;
use salvo_ecs::shared::SharedFragmentHandle;
use salvo_ecs::world::{FragmentBundle, World};
use salvo_ecs::EcsError;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::actor::{ActorHandle, PrimitiveHandle, SharedActors};
use crate::collision::{CollisionQuery, WorldGravity};
use crate::damage::DamageInterface;
use crate::fragments::{
    self, ArchetypeDescription, CollisionIgnoreList, DamageDescriptor, DamageEffectId, Force,
    GravityScale, HitInfo, InstigatorOwner, Transform, Velocity,
};
use crate::hit::ProjectileHitProcessor;
use crate::movement::ProjectileMovementProcessor;
use crate::tick::TickLoop;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register every projectile fragment. Safe to call more than once.
pub fn register_projectile_fragments(world: &mut World) {
    world.register_fragment::<Transform>(fragments::TRANSFORM);
    world.register_fragment::<Velocity>(fragments::VELOCITY);
    world.register_fragment::<Force>(fragments::FORCE);
    world.register_fragment::<HitInfo>(fragments::HIT_INFO);
    world.register_fragment::<CollisionIgnoreList>(fragments::COLLISION_IGNORE_LIST);
    world.register_fragment::<InstigatorOwner>(fragments::INSTIGATOR_OWNER);
    world.register_shared_fragment::<ArchetypeDescription>(fragments::ARCHETYPE_DESCRIPTION);
    world.register_shared_fragment::<DamageDescriptor>(fragments::DAMAGE_DESCRIPTOR);
    world.register_shared_fragment::<GravityScale>(fragments::GRAVITY_SCALE);
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// What a family of projectiles has in common.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectileConfig {
    pub description: ArchetypeDescription,
    pub damage_effect: DamageEffectId,
    pub gravity_scale: GravityScale,
}

/// Per-projectile spawn values.
#[derive(Debug, Clone, Default)]
pub struct SpawnParams {
    pub transform: Transform,
    pub velocity: glam::Vec3,
    pub force: glam::Vec3,
    pub instigator: Option<ActorHandle>,
    pub owner: Option<ActorHandle>,
    pub ignored_actors: SmallVec<[ActorHandle; 2]>,
    pub ignored_primitives: SmallVec<[PrimitiveHandle; 2]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectileTemplate {
    description: SharedFragmentHandle,
    damage: SharedFragmentHandle,
    gravity: SharedFragmentHandle,
}

impl ProjectileTemplate {
    /// Resolve (or create) the config's shared fragments. Registers the
    /// projectile fragments if needed.
    pub fn new(world: &mut World, config: &ProjectileConfig) -> Result<Self, EcsError> {
        register_projectile_fragments(world);
        Ok(Self {
            description: world.get_or_create_shared(config.description)?,
            damage: world.get_or_create_shared(DamageDescriptor {
                effect: config.damage_effect,
            })?,
            gravity: world.get_or_create_shared(config.gravity_scale)?,
        })
    }

    pub fn spawn(&self, world: &mut World, params: SpawnParams) -> Result<EntityHandle, EcsError> {
        world.spawn(self.bundle(params))
    }

    /// The full fragment bundle for one projectile.
    pub fn bundle(&self, params: SpawnParams) -> FragmentBundle {
        FragmentBundle::new()
            .with(params.transform)
            .with(Velocity {
                value: params.velocity,
            })
            .with(Force {
                value: params.force,
            })
            .with(HitInfo::default())
            .with(CollisionIgnoreList {
                actors: params.ignored_actors,
                primitives: params.ignored_primitives,
            })
            .with(InstigatorOwner {
                instigator: params.instigator,
                owner: params.owner,
            })
            .with_shared(self.description)
            .with_shared(self.damage)
            .with_shared(self.gravity)
    }
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

fn set<T: salvo_ecs::fragment::Fragment>(world: &mut World, entity: EntityHandle, value: T) -> bool {
    match world.get_mut::<T>(entity) {
        Some(slot) => {
            *slot = value;
            true
        }
        None => false,
    }
}

/// Whether `entity` is alive and carries the fragments the movement
/// processor needs.
pub fn is_projectile(world: &World, entity: EntityHandle) -> bool {
    world.has::<Transform>(entity)
        && world.has::<Velocity>(entity)
        && world.has::<Force>(entity)
        && world.has::<HitInfo>(entity)
        && world.has::<CollisionIgnoreList>(entity)
}

pub fn transform(world: &World, entity: EntityHandle) -> Option<Transform> {
    world.get::<Transform>(entity).copied()
}

pub fn set_transform(world: &mut World, entity: EntityHandle, transform: Transform) -> bool {
    set(world, entity, transform)
}

pub fn velocity(world: &World, entity: EntityHandle) -> Option<glam::Vec3> {
    world.get::<Velocity>(entity).map(|v| v.value)
}

pub fn set_velocity(world: &mut World, entity: EntityHandle, value: glam::Vec3) -> bool {
    set(world, entity, Velocity { value })
}

pub fn force(world: &World, entity: EntityHandle) -> Option<glam::Vec3> {
    world.get::<Force>(entity).map(|f| f.value)
}

pub fn set_force(world: &mut World, entity: EntityHandle, value: glam::Vec3) -> bool {
    set(world, entity, Force { value })
}

pub fn instigator_owner(world: &World, entity: EntityHandle) -> Option<InstigatorOwner> {
    world.get::<InstigatorOwner>(entity).copied()
}

pub fn set_instigator_owner(
    world: &mut World,
    entity: EntityHandle,
    instigator: Option<ActorHandle>,
    owner: Option<ActorHandle>,
) -> bool {
    set(world, entity, InstigatorOwner { instigator, owner })
}

pub fn ignored_actors(world: &World, entity: EntityHandle) -> Option<&[ActorHandle]> {
    world
        .get::<CollisionIgnoreList>(entity)
        .map(|l| l.actors.as_slice())
}

pub fn set_ignored_actors(world: &mut World, entity: EntityHandle, actors: &[ActorHandle]) -> bool {
    match world.get_mut::<CollisionIgnoreList>(entity) {
        Some(list) => {
            list.actors = SmallVec::from_slice(actors);
            true
        }
        None => false,
    }
}

pub fn ignored_primitives(world: &World, entity: EntityHandle) -> Option<&[PrimitiveHandle]> {
    world
        .get::<CollisionIgnoreList>(entity)
        .map(|l| l.primitives.as_slice())
}

pub fn set_ignored_primitives(
    world: &mut World,
    entity: EntityHandle,
    primitives: &[PrimitiveHandle],
) -> bool {
    match world.get_mut::<CollisionIgnoreList>(entity) {
        Some(list) => {
            list.primitives = SmallVec::from_slice(primitives);
            true
        }
        None => false,
    }
}

/// Destroy immediately. False if the handle was already stale.
pub fn destroy_projectile(world: &mut World, entity: EntityHandle) -> bool {
    world.destroy(entity).is_ok()
}

// ---------------------------------------------------------------------------
// Pipeline installation
// ---------------------------------------------------------------------------

/// The collaborators both projectile processors need.
pub struct ProjectileServices {
    pub collision: Arc<dyn CollisionQuery>,
    pub gravity: Arc<dyn WorldGravity>,
    pub actors: SharedActors,
    pub damage: Box<dyn DamageInterface>,
}

/// Register the projectile fragments plus the movement and hit processors
/// (hit after movement).
pub fn install_projectile_pipeline(
    tick_loop: &mut TickLoop,
    services: ProjectileServices,
) -> Result<(), EngineError> {
    register_projectile_fragments(tick_loop.world_mut());
    tick_loop.add_processor(Box::new(ProjectileMovementProcessor::new(
        services.collision,
        services.gravity,
        Arc::clone(&services.actors),
    )))?;
    tick_loop.add_processor(Box::new(ProjectileHitProcessor::new(
        services.damage,
        services.actors,
    )))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::actor::ActorRegistry;

    fn world_and_template() -> (World, ProjectileTemplate) {
        let mut world = World::new();
        let template = ProjectileTemplate::new(&mut world, &ProjectileConfig::default()).unwrap();
        (world, template)
    }

    #[test]
    fn spawn_fills_defaults() {
        let (mut world, template) = world_and_template();
        let e = template
            .spawn(
                &mut world,
                SpawnParams {
                    transform: Transform::from_position(Vec3::new(1.0, 2.0, 3.0)),
                    ..SpawnParams::default()
                },
            )
            .unwrap();
        assert!(is_projectile(&world, e));
        assert_eq!(velocity(&world, e), Some(Vec3::ZERO));
        assert_eq!(force(&world, e), Some(Vec3::ZERO));
        assert_eq!(transform(&world, e).map(|t| t.position), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(world.shared::<GravityScale>(e), Some(&GravityScale { scale: 1.0 }));
    }

    #[test]
    fn equal_configs_share_instances() {
        let mut world = World::new();
        let a = ProjectileTemplate::new(&mut world, &ProjectileConfig::default()).unwrap();
        let b = ProjectileTemplate::new(&mut world, &ProjectileConfig::default()).unwrap();
        let c = ProjectileTemplate::new(
            &mut world,
            &ProjectileConfig {
                gravity_scale: GravityScale { scale: 0.5 },
                ..ProjectileConfig::default()
            },
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.description, c.description);
        assert_ne!(a.gravity, c.gravity);

        let ea = a.spawn(&mut world, SpawnParams::default()).unwrap();
        let eb = b.spawn(&mut world, SpawnParams::default()).unwrap();
        assert!(Arc::ptr_eq(
            &world.shared_arc::<GravityScale>(ea).unwrap(),
            &world.shared_arc::<GravityScale>(eb).unwrap()
        ));
    }

    #[test]
    fn setters_report_stale_handles() {
        let (mut world, template) = world_and_template();
        let mut actors = ActorRegistry::new();
        let shooter = actors.spawn_actor("shooter");
        let e = template.spawn(&mut world, SpawnParams::default()).unwrap();

        assert!(set_velocity(&mut world, e, Vec3::X));
        assert!(set_force(&mut world, e, Vec3::Y));
        assert!(set_instigator_owner(&mut world, e, Some(shooter), None));
        assert!(set_ignored_actors(&mut world, e, &[shooter]));
        assert_eq!(ignored_actors(&world, e), Some(&[shooter][..]));
        assert_eq!(instigator_owner(&world, e).and_then(|io| io.instigator), Some(shooter));

        assert!(destroy_projectile(&mut world, e));
        assert!(!destroy_projectile(&mut world, e));
        assert!(!set_velocity(&mut world, e, Vec3::Z));
        assert!(!set_transform(&mut world, e, Transform::default()));
        assert!(!set_ignored_primitives(&mut world, e, &[]));
        assert_eq!(velocity(&world, e), None);
        assert!(!is_projectile(&world, e));
    }
}
