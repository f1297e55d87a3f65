//! Collision queries against the physical world.
//!
//! The movement processor only sees the [`CollisionQuery`] trait: one swept
//! shape in, the first blocking hit (if any) out. [`SimpleCollisionWorld`] is
//! an analytic implementation over planes, spheres and axis-aligned boxes,
//! good enough for tests and the demo; a rapier-backed one lives behind the
//! `rapier` feature.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::actor::{ActorHandle, PrimitiveHandle};

/// Tolerance for "already touching" checks.
const CONTACT_EPSILON: f32 = 1.0e-4;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// Which trace channel a sweep runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CollisionChannel {
    #[default]
    Camera,
    Visibility,
    WorldStatic,
    WorldDynamic,
    Pawn,
    Projectile,
}

impl CollisionChannel {
    pub fn bit(self) -> u32 {
        1 << self as u32
    }
}

/// Set of channels a collider blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMask(u32);

impl ChannelMask {
    pub const ALL: ChannelMask = ChannelMask(u32::MAX);
    pub const NONE: ChannelMask = ChannelMask(0);

    pub fn with(self, channel: CollisionChannel) -> Self {
        Self(self.0 | channel.bit())
    }

    pub fn blocks(self, channel: CollisionChannel) -> bool {
        self.0 & channel.bit() != 0
    }
}

impl Default for ChannelMask {
    fn default() -> Self {
        Self::ALL
    }
}

// ---------------------------------------------------------------------------
// Queries and hits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SweepShape {
    /// Zero-thickness ray.
    Line,
    Sphere { radius: f32 },
}

impl SweepShape {
    /// A sphere of `radius`, or a line trace when the radius is not positive.
    pub fn sphere(radius: f32) -> Self {
        if radius > 0.0 && radius.is_finite() {
            SweepShape::Sphere { radius }
        } else {
            SweepShape::Line
        }
    }

    pub fn radius(self) -> f32 {
        match self {
            SweepShape::Line => 0.0,
            SweepShape::Sphere { radius } => radius,
        }
    }
}

/// One swept-shape trace.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepQuery {
    pub shape: SweepShape,
    pub start: Vec3,
    pub end: Vec3,
    pub rotation: Quat,
    pub channel: CollisionChannel,
    pub ignored_actors: SmallVec<[ActorHandle; 2]>,
    pub ignored_primitives: SmallVec<[PrimitiveHandle; 2]>,
}

impl SweepQuery {
    /// Whether a collider owned by `actor` / `primitive` must be skipped.
    pub fn ignores(&self, actor: Option<ActorHandle>, primitive: Option<PrimitiveHandle>) -> bool {
        actor.is_some_and(|a| self.ignored_actors.contains(&a))
            || primitive.is_some_and(|p| self.ignored_primitives.contains(&p))
    }
}

/// The first blocking surface along a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepHit {
    /// Where the swept shape's center stopped.
    pub location: Vec3,
    /// Contact point on the blocking surface.
    pub impact_point: Vec3,
    pub impact_normal: Vec3,
    pub actor: Option<ActorHandle>,
    pub primitive: Option<PrimitiveHandle>,
    pub trace_start: Vec3,
    pub trace_end: Vec3,
    /// Fraction of the path travelled before contact, in `[0, 1]`.
    pub time: f32,
}

/// Host collision service.
pub trait CollisionQuery: Send + Sync {
    fn sweep(&self, query: &SweepQuery) -> Option<SweepHit>;
}

/// Gravity of the world the projectiles fly in.
pub trait WorldGravity: Send + Sync {
    fn gravity_vector(&self) -> Vec3;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantGravity(pub Vec3);

impl WorldGravity for ConstantGravity {
    fn gravity_vector(&self) -> Vec3 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// SimpleCollisionWorld
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Collider {
    /// One-sided plane `normal · x = distance`; blocks from the normal side.
    Plane { normal: Vec3, distance: f32 },
    Sphere { center: Vec3, radius: f32 },
    Aabb { min: Vec3, max: Vec3 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollisionBody {
    pub collider: Collider,
    pub channels: ChannelMask,
    pub actor: Option<ActorHandle>,
    pub primitive: Option<PrimitiveHandle>,
}

impl CollisionBody {
    /// Plane through `point` facing `normal` (normalized here).
    pub fn plane(normal: Vec3, point: Vec3) -> Self {
        let normal = normal.normalize_or_zero();
        Self::new(Collider::Plane {
            normal,
            distance: normal.dot(point),
        })
    }

    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Self::new(Collider::Sphere {
            center,
            radius: radius.max(0.0),
        })
    }

    pub fn aabb(a: Vec3, b: Vec3) -> Self {
        Self::new(Collider::Aabb {
            min: a.min(b),
            max: a.max(b),
        })
    }

    fn new(collider: Collider) -> Self {
        Self {
            collider,
            channels: ChannelMask::ALL,
            actor: None,
            primitive: None,
        }
    }

    pub fn owned_by(mut self, actor: ActorHandle, primitive: Option<PrimitiveHandle>) -> Self {
        self.actor = Some(actor);
        self.primitive = primitive;
        self
    }

    pub fn blocking(mut self, channels: ChannelMask) -> Self {
        self.channels = channels;
        self
    }
}

/// Analytic collision world. Sweeps against every body and keep the earliest
/// contact; equal times resolve to the body added first.
#[derive(Debug, Clone, Default)]
pub struct SimpleCollisionWorld {
    bodies: Vec<CollisionBody>,
}

/// Contact time and the surface normal at contact.
type Contact = (f32, Vec3);

impl SimpleCollisionWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, body: CollisionBody) -> usize {
        self.bodies.push(body);
        self.bodies.len() - 1
    }

    pub fn with(mut self, body: CollisionBody) -> Self {
        self.add(body);
        self
    }

    pub fn bodies(&self) -> &[CollisionBody] {
        &self.bodies
    }
}

impl CollisionQuery for SimpleCollisionWorld {
    fn sweep(&self, query: &SweepQuery) -> Option<SweepHit> {
        let radius = query.shape.radius();
        let delta = query.end - query.start;

        let mut best: Option<(Contact, &CollisionBody)> = None;
        for body in &self.bodies {
            if !body.channels.blocks(query.channel) || query.ignores(body.actor, body.primitive) {
                continue;
            }
            let contact = match body.collider {
                Collider::Plane { normal, distance } => {
                    sweep_plane(query.start, delta, radius, normal, distance)
                }
                Collider::Sphere { center, radius: r } => {
                    sweep_sphere(query.start, delta, radius, center, r)
                }
                Collider::Aabb { min, max } => sweep_aabb(query.start, delta, radius, min, max),
            };
            if let Some(c) = contact {
                if best.map_or(true, |((t, _), _)| c.0 < t) {
                    best = Some((c, body));
                }
            }
        }

        best.map(|((time, normal), body)| {
            let location = query.start + delta * time;
            SweepHit {
                location,
                impact_point: location - normal * radius,
                impact_normal: normal,
                actor: body.actor,
                primitive: body.primitive,
                trace_start: query.start,
                trace_end: query.end,
                time,
            }
        })
    }
}

fn sweep_plane(start: Vec3, delta: Vec3, radius: f32, normal: Vec3, distance: f32) -> Option<Contact> {
    let gap = normal.dot(start) - distance;
    if gap < -radius {
        // Behind a one-sided plane.
        return None;
    }
    if gap <= radius + CONTACT_EPSILON {
        return Some((0.0, normal));
    }
    let approach = normal.dot(delta);
    if approach >= 0.0 {
        return None;
    }
    let t = (radius - gap) / approach;
    (t <= 1.0).then_some((t, normal))
}

fn sweep_sphere(start: Vec3, delta: Vec3, radius: f32, center: Vec3, sphere_radius: f32) -> Option<Contact> {
    let reach = radius + sphere_radius;
    let m = start - center;
    let c = m.length_squared() - reach * reach;
    if c <= 0.0 {
        let normal = m.try_normalize().unwrap_or_else(|| -delta.normalize_or_zero());
        return Some((0.0, normal));
    }
    let a = delta.length_squared();
    let b = m.dot(delta);
    if a == 0.0 || b >= 0.0 {
        return None;
    }
    let disc = b * b - a * c;
    if disc < 0.0 {
        return None;
    }
    let t = (-b - disc.sqrt()) / a;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let normal = (start + delta * t - center).normalize_or_zero();
    Some((t, normal))
}

/// Slab test against the box grown by `radius`. Conservative at the corners.
fn sweep_aabb(start: Vec3, delta: Vec3, radius: f32, min: Vec3, max: Vec3) -> Option<Contact> {
    let min = min - Vec3::splat(radius);
    let max = max + Vec3::splat(radius);
    if start.cmpge(min).all() && start.cmple(max).all() {
        return Some((0.0, -delta.normalize_or_zero()));
    }

    let mut t_enter = 0.0f32;
    let mut t_exit = 1.0f32;
    let mut normal = Vec3::ZERO;
    for axis in 0..3 {
        let (s, d) = (start[axis], delta[axis]);
        if d.abs() < f32::EPSILON {
            if s < min[axis] || s > max[axis] {
                return None;
            }
            continue;
        }
        let (mut near, mut far) = ((min[axis] - s) / d, (max[axis] - s) / d);
        let mut face = Vec3::ZERO;
        face[axis] = -d.signum();
        if near > far {
            std::mem::swap(&mut near, &mut far);
        }
        if near > t_enter {
            t_enter = near;
            normal = face;
        }
        t_exit = t_exit.min(far);
        if t_enter > t_exit {
            return None;
        }
    }
    Some((t_enter, normal))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorRegistry;

    fn query(start: Vec3, end: Vec3, radius: f32) -> SweepQuery {
        SweepQuery {
            shape: SweepShape::sphere(radius),
            start,
            end,
            rotation: Quat::IDENTITY,
            channel: CollisionChannel::Camera,
            ignored_actors: SmallVec::new(),
            ignored_primitives: SmallVec::new(),
        }
    }

    fn ground() -> SimpleCollisionWorld {
        SimpleCollisionWorld::new().with(CollisionBody::plane(Vec3::Z, Vec3::ZERO))
    }

    #[test]
    fn non_positive_radius_is_a_line() {
        assert_eq!(SweepShape::sphere(0.0), SweepShape::Line);
        assert_eq!(SweepShape::sphere(-1.0), SweepShape::Line);
        assert_eq!(SweepShape::sphere(2.0).radius(), 2.0);
    }

    #[test]
    fn line_hits_ground_plane() {
        let hit = ground()
            .sweep(&query(Vec3::new(0.0, 0.0, 10.0), Vec3::new(0.0, 0.0, -10.0), 0.0))
            .unwrap();
        assert!((hit.time - 0.5).abs() < 1e-6);
        assert_eq!(hit.location, Vec3::ZERO);
        assert_eq!(hit.impact_normal, Vec3::Z);
        assert_eq!(hit.trace_start, Vec3::new(0.0, 0.0, 10.0));
    }

    #[test]
    fn sphere_stops_one_radius_above_plane() {
        let hit = ground()
            .sweep(&query(Vec3::new(0.0, 0.0, 10.0), Vec3::new(0.0, 0.0, -10.0), 2.0))
            .unwrap();
        assert!((hit.location.z - 2.0).abs() < 1e-5);
        assert!(hit.impact_point.z.abs() < 1e-5);
    }

    #[test]
    fn moving_away_or_short_misses() {
        let world = ground();
        assert!(world
            .sweep(&query(Vec3::new(0.0, 0.0, 10.0), Vec3::new(0.0, 0.0, 20.0), 0.0))
            .is_none());
        assert!(world
            .sweep(&query(Vec3::new(0.0, 0.0, 10.0), Vec3::new(0.0, 0.0, 5.0), 0.0))
            .is_none());
    }

    #[test]
    fn sphere_target_reports_owner() {
        let mut actors = ActorRegistry::new();
        let target = actors.spawn_actor("target");
        let prim = actors.add_primitive(target);
        let world = SimpleCollisionWorld::new()
            .with(CollisionBody::sphere(Vec3::new(10.0, 0.0, 0.0), 1.0).owned_by(target, prim));
        let hit = world
            .sweep(&query(Vec3::ZERO, Vec3::new(20.0, 0.0, 0.0), 0.5))
            .unwrap();
        assert!((hit.location.x - 8.5).abs() < 1e-4);
        assert!((hit.impact_point.x - 9.0).abs() < 1e-4);
        assert_eq!(hit.impact_normal, Vec3::NEG_X);
        assert_eq!(hit.actor, Some(target));
        assert_eq!(hit.primitive, prim);
    }

    #[test]
    fn box_hit_uses_entering_face() {
        let world = SimpleCollisionWorld::new()
            .with(CollisionBody::aabb(Vec3::new(4.0, -1.0, -1.0), Vec3::new(6.0, 1.0, 1.0)));
        let hit = world
            .sweep(&query(Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0), 0.0))
            .unwrap();
        assert!((hit.location.x - 4.0).abs() < 1e-5);
        assert_eq!(hit.impact_normal, Vec3::NEG_X);
    }

    #[test]
    fn earliest_body_wins() {
        let world = SimpleCollisionWorld::new()
            .with(CollisionBody::sphere(Vec3::new(8.0, 0.0, 0.0), 1.0))
            .with(CollisionBody::sphere(Vec3::new(4.0, 0.0, 0.0), 1.0));
        let hit = world
            .sweep(&query(Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0), 0.0))
            .unwrap();
        assert!((hit.location.x - 3.0).abs() < 1e-4);
    }

    #[test]
    fn ignored_and_filtered_bodies_are_skipped() {
        let mut actors = ActorRegistry::new();
        let shooter = actors.spawn_actor("shooter");
        let world = SimpleCollisionWorld::new()
            .with(CollisionBody::sphere(Vec3::new(2.0, 0.0, 0.0), 1.0).owned_by(shooter, None))
            .with(
                CollisionBody::sphere(Vec3::new(5.0, 0.0, 0.0), 1.0)
                    .blocking(ChannelMask::NONE.with(CollisionChannel::Pawn)),
            );

        let mut q = query(Vec3::new(-2.0, 0.0, 0.0), Vec3::new(10.0, 0.0, 0.0), 0.0);
        q.ignored_actors.push(shooter);
        assert!(world.sweep(&q).is_none());

        q.channel = CollisionChannel::Pawn;
        let hit = world.sweep(&q).unwrap();
        assert!((hit.location.x - 4.0).abs() < 1e-4);
    }
}
