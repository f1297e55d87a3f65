//! rapier3d-backed collision queries.
//!
//! Static geometry lives in rapier's collider set; sweeps become ball shape
//! casts (or ray casts for line traces) through the [`QueryPipeline`]. Each
//! collider carries its owning actor/primitive and the channels it blocks.
//!
//! rapier3d is compiled with `enhanced-determinism`, so identical scenes give
//! identical hits across runs.
//!
//! Only built with the `rapier` feature:
//! `cargo test -p salvo-engine --features rapier`.

use std::collections::HashMap;

use glam::Vec3;
use rapier3d::parry::query::ShapeCastOptions;
use rapier3d::prelude::*;

use crate::actor::{ActorHandle, PrimitiveHandle};
use crate::collision::{ChannelMask, CollisionQuery, SweepHit, SweepQuery, SweepShape};

#[derive(Debug, Clone, Copy)]
struct ColliderOwner {
    actor: Option<ActorHandle>,
    primitive: Option<PrimitiveHandle>,
    channels: ChannelMask,
}

/// Static collision scene backed by rapier3d.
pub struct RapierCollisionWorld {
    bodies: RigidBodySet,
    colliders: ColliderSet,
    query_pipeline: QueryPipeline,
    owners: HashMap<ColliderHandle, ColliderOwner>,
}

fn to_vector(v: Vec3) -> Vector<Real> {
    vector![v.x, v.y, v.z]
}

fn to_vec3(v: &Vector<Real>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

impl RapierCollisionWorld {
    pub fn new() -> Self {
        Self {
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            query_pipeline: QueryPipeline::new(),
            owners: HashMap::new(),
        }
    }

    /// Insert a static collider. Call [`refresh`](Self::refresh) once the
    /// scene is built.
    pub fn add_collider(
        &mut self,
        collider: Collider,
        channels: ChannelMask,
        actor: Option<ActorHandle>,
        primitive: Option<PrimitiveHandle>,
    ) -> ColliderHandle {
        let handle = self.colliders.insert(collider);
        self.owners.insert(
            handle,
            ColliderOwner {
                actor,
                primitive,
                channels,
            },
        );
        handle
    }

    /// Rebuild the acceleration structure after colliders changed.
    pub fn refresh(&mut self) {
        self.query_pipeline.update(&self.colliders);
    }

    pub fn collider_count(&self) -> usize {
        self.colliders.len()
    }
}

impl Default for RapierCollisionWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl CollisionQuery for RapierCollisionWorld {
    fn sweep(&self, query: &SweepQuery) -> Option<SweepHit> {
        let delta = query.end - query.start;
        let accepts = |handle: ColliderHandle, _: &Collider| {
            self.owners.get(&handle).is_some_and(|o| {
                o.channels.blocks(query.channel) && !query.ignores(o.actor, o.primitive)
            })
        };
        let filter = QueryFilter::default().predicate(&accepts);

        let (handle, time, normal) = match query.shape {
            SweepShape::Line => {
                let ray = Ray::new(
                    point![query.start.x, query.start.y, query.start.z],
                    to_vector(delta),
                );
                let (handle, hit) = self.query_pipeline.cast_ray_and_get_normal(
                    &self.bodies,
                    &self.colliders,
                    &ray,
                    1.0,
                    true,
                    filter,
                )?;
                (handle, hit.time_of_impact, to_vec3(&hit.normal))
            }
            SweepShape::Sphere { radius } => {
                // The ball is never rotated, so its local frame is the world
                // frame and `normal1` (pointing out of the ball) is usable as is.
                let ball = Ball::new(radius);
                let origin = Isometry::translation(query.start.x, query.start.y, query.start.z);
                let (handle, hit) = self.query_pipeline.cast_shape(
                    &self.bodies,
                    &self.colliders,
                    &origin,
                    &to_vector(delta),
                    &ball,
                    ShapeCastOptions::with_max_time_of_impact(1.0),
                    filter,
                )?;
                (handle, hit.time_of_impact, -to_vec3(&hit.normal1))
            }
        };

        let owner = self.owners.get(&handle).copied();
        let location = query.start + delta * time;
        Some(SweepHit {
            location,
            impact_point: location - normal * query.shape.radius(),
            impact_normal: normal,
            actor: owner.and_then(|o| o.actor),
            primitive: owner.and_then(|o| o.primitive),
            trace_start: query.start,
            trace_end: query.end,
            time,
        })
    }
}
