//! Projectile integration and swept collision.
//!
//! Every tick, for each projectile:
//!
//! 1. `velocity += (force + world_gravity * gravity_scale) * dt`
//! 2. sweep from the current position to `position + velocity * dt`
//! 3. on a blocking hit, stop at the sweep's stop location and remember the
//!    projectile; otherwise move to the predicted end
//! 4. optionally turn the rotation to face along the velocity
//!
//! Projectiles that hit are gathered from all chunks through a channel and
//! published once, sorted, as [`PROJECTILE_HIT`]. Nothing is destroyed here.

use std::sync::Arc;

use glam::{Quat, Vec3};
use salvo_ecs::access::AccessSet;
use salvo_ecs::entity::EntityHandle;
use salvo_ecs::processor::{ExecutionContext, Processor};
use salvo_ecs::query::EntityQuery;
use salvo_ecs::signal::SignalName;
use smallvec::SmallVec;
use tracing::debug;

use crate::actor::{ActorRegistry, SharedActors};
use crate::collision::{CollisionQuery, SweepQuery, SweepShape, WorldGravity};
use crate::fragments::{
    ArchetypeDescription, CollisionIgnoreList, Force, GravityScale, HitInfo, Transform, Velocity,
};

/// Published with every projectile that hit something this tick.
///
/// The hit processor destroys every delivered projectile in its own stage.
/// A processor that observes this signal must declare
/// `run_before(HIT_PROCESSOR_NAME)`, or it only ever sees stale handles.
/// External observers draining the queue after the tick get nothing.
pub const PROJECTILE_HIT: SignalName = SignalName::new("projectile.hit");

pub const MOVEMENT_PROCESSOR_NAME: &str = "projectile_movement";

// ---------------------------------------------------------------------------
// Kinematics
// ---------------------------------------------------------------------------

/// One explicit Euler step of the velocity.
#[inline]
pub fn integrate_velocity(velocity: Vec3, force: Vec3, gravity: Vec3, dt: f32) -> Vec3 {
    velocity + (force + gravity) * dt
}

/// Rotation whose +X axis points along `velocity`, with no roll.
///
/// Zero-length or non-finite velocities keep `previous`.
pub fn rotation_from_velocity(velocity: Vec3, previous: Quat) -> Quat {
    if !velocity.is_finite() || velocity.length_squared() <= f32::EPSILON {
        return previous;
    }
    let yaw = velocity.y.atan2(velocity.x);
    let pitch = velocity.z.atan2(velocity.truncate().length());
    Quat::from_rotation_z(yaw) * Quat::from_rotation_y(-pitch)
}

// ---------------------------------------------------------------------------
// ProjectileMovementProcessor
// ---------------------------------------------------------------------------

pub struct ProjectileMovementProcessor {
    collision: Arc<dyn CollisionQuery>,
    gravity: Arc<dyn WorldGravity>,
    actors: SharedActors,
    query: EntityQuery,
}

impl ProjectileMovementProcessor {
    pub fn new(
        collision: Arc<dyn CollisionQuery>,
        gravity: Arc<dyn WorldGravity>,
        actors: SharedActors,
    ) -> Self {
        let query = EntityQuery::new()
            .write::<Transform>()
            .write::<Velocity>()
            .write::<HitInfo>()
            .read::<Force>()
            .read::<CollisionIgnoreList>()
            .shared::<ArchetypeDescription>()
            .shared::<GravityScale>();
        Self {
            collision,
            gravity,
            actors,
            query,
        }
    }
}

/// Live entries of an ignore list, copied into a sweep query.
fn live_ignores(list: &CollisionIgnoreList, actors: &ActorRegistry, query: &mut SweepQuery) {
    query.ignored_actors.clear();
    query
        .ignored_actors
        .extend(list.actors.iter().copied().filter(|a| actors.is_alive(*a)));
    query.ignored_primitives.clear();
    query.ignored_primitives.extend(
        list.primitives
            .iter()
            .copied()
            .filter(|p| actors.is_primitive_alive(*p)),
    );
}

impl Processor for ProjectileMovementProcessor {
    fn name(&self) -> &str {
        MOVEMENT_PROCESSOR_NAME
    }

    fn access(&self) -> AccessSet {
        self.query.access().clone()
    }

    fn execute(&mut self, ctx: &ExecutionContext<'_>) {
        let dt = ctx.delta_seconds();
        let world_gravity = self.gravity.gravity_vector();
        let collision = self.collision.as_ref();
        let actors = self.actors.read();
        let registry: &ActorRegistry = &actors;
        let (hit_tx, hit_rx) = crossbeam_channel::unbounded::<EntityHandle>();

        self.query.for_each_chunk(ctx, |chunk| {
            let hit_tx = hit_tx.clone();
            let description = chunk.shared::<ArchetypeDescription>();
            let gravity = world_gravity * chunk.shared::<GravityScale>().scale;
            let shape = SweepShape::sphere(description.sweep_radius);

            let forces = chunk.fragments::<Force>();
            let ignores = chunk.fragments::<CollisionIgnoreList>();
            let transforms = chunk.fragments_mut::<Transform>();
            let velocities = chunk.fragments_mut::<Velocity>();
            let hit_infos = chunk.fragments_mut::<HitInfo>();

            let mut sweep = SweepQuery {
                shape,
                start: Vec3::ZERO,
                end: Vec3::ZERO,
                rotation: Quat::IDENTITY,
                channel: description.collision_channel,
                ignored_actors: SmallVec::new(),
                ignored_primitives: SmallVec::new(),
            };

            for (row, &entity) in chunk.entities().iter().enumerate() {
                let transform = &mut transforms[row];
                let velocity = &mut velocities[row].value;

                *velocity = integrate_velocity(*velocity, forces[row].value, gravity, dt);
                let predicted_end = transform.position + *velocity * dt;

                sweep.start = transform.position;
                sweep.end = predicted_end;
                sweep.rotation = transform.rotation;
                live_ignores(&ignores[row], registry, &mut sweep);

                let hit = collision.sweep(&sweep);
                match &hit {
                    Some(h) => {
                        transform.position = h.location;
                        // The receiver outlives every sender clone.
                        let _ = hit_tx.send(entity);
                    }
                    None => transform.position = predicted_end,
                }
                hit_infos[row].hit = hit;

                if description.rotation_follows_velocity {
                    transform.rotation = rotation_from_velocity(*velocity, transform.rotation);
                }
            }
        });
        drop(actors);
        drop(hit_tx);

        let mut hits: Vec<EntityHandle> = hit_rx.try_iter().collect();
        if hits.is_empty() {
            return;
        }
        hits.sort_unstable();
        hits.dedup();
        debug!(tick = ctx.tick(), hits = hits.len(), "projectiles hit");
        ctx.signals().publish(PROJECTILE_HIT, hits);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
