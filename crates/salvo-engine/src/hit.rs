//! Hit resolution: damage the hit target, then destroy the projectile.

use salvo_ecs::access::{AccessSet, ExecutionMode};
use salvo_ecs::command::CausalReason;
use salvo_ecs::processor::{ExecutionContext, Processor};
use salvo_ecs::query::EntityQuery;
use salvo_ecs::signal::SignalName;
use tracing::{debug, trace, warn};

use crate::actor::SharedActors;
use crate::damage::{DamageInterface, DamageRequest};
use crate::fragments::{DamageDescriptor, HitInfo, InstigatorOwner};
use crate::movement::{MOVEMENT_PROCESSOR_NAME, PROJECTILE_HIT};

pub const HIT_PROCESSOR_NAME: &str = "projectile_hit";

/// Consumes [`PROJECTILE_HIT`]. Every delivered projectile that is still alive
/// is destroyed, whether or not damage was applied.
pub struct ProjectileHitProcessor {
    damage: Box<dyn DamageInterface>,
    actors: SharedActors,
    mode: ExecutionMode,
    query: EntityQuery,
}

impl ProjectileHitProcessor {
    pub fn new(damage: Box<dyn DamageInterface>, actors: SharedActors) -> Self {
        Self {
            damage,
            actors,
            mode: ExecutionMode::Exclusive,
            query: EntityQuery::new()
                .read::<HitInfo>()
                .read::<InstigatorOwner>()
                .shared::<DamageDescriptor>(),
        }
    }

    /// Override the default exclusive stage, e.g. for a damage interface that
    /// is safe to call off the main thread.
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

impl Processor for ProjectileHitProcessor {
    fn name(&self) -> &str {
        HIT_PROCESSOR_NAME
    }

    fn access(&self) -> AccessSet {
        self.query.access().clone()
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    fn run_after(&self) -> Vec<String> {
        vec![MOVEMENT_PROCESSOR_NAME.to_owned()]
    }

    fn subscriptions(&self) -> Vec<SignalName> {
        vec![PROJECTILE_HIT]
    }

    fn execute(&mut self, ctx: &ExecutionContext<'_>) {
        let delivered = ctx.delivered().entities(PROJECTILE_HIT);
        let damage = &mut self.damage;

        // Resolve every request under the actor lock, then release it before
        // calling into the damage interface, which may need to write actors.
        let mut requests = Vec::with_capacity(delivered.len());
        {
            let actors = self.actors.read();
            self.query.for_each_entity(ctx, delivered, |projectile, view| {
                let (Some(hit_info), Some(io), Some(descriptor)) = (
                    view.get::<HitInfo>(),
                    view.get::<InstigatorOwner>(),
                    view.shared::<DamageDescriptor>(),
                ) else {
                    return;
                };
                let Some(hit) = hit_info.hit else {
                    trace!(%projectile, "no hit recorded, skipping damage");
                    return;
                };
                let target = hit
                    .actor
                    .filter(|a| actors.is_alive(*a))
                    .or_else(|| hit.primitive.and_then(|p| actors.resolve_primitive(p)));
                let Some(target) = target else {
                    trace!(%projectile, "hit target no longer exists");
                    return;
                };
                requests.push(DamageRequest {
                    projectile,
                    target,
                    descriptor: *descriptor,
                    instigator: io.instigator.filter(|a| actors.is_alive(*a)),
                    owner: io.owner.filter(|a| actors.is_alive(*a)),
                    location: hit.location,
                    impact_point: hit.impact_point,
                    impact_normal: hit.impact_normal,
                    origin: hit.trace_start,
                });
            });
        }

        let mut applied = 0usize;
        for request in &requests {
            let (projectile, target) = (request.projectile, request.target);
            if !damage.accepts_damage(target) {
                trace!(%projectile, ?target, "target does not accept damage");
                continue;
            }
            match damage.apply(request) {
                Ok(()) => applied += 1,
                Err(error) => warn!(%projectile, ?target, %error, "damage application failed"),
            }
        }

        let reason = CausalReason::Signal(PROJECTILE_HIT.to_string());
        let mut destroyed = 0usize;
        for &projectile in delivered {
            if ctx.is_alive(projectile) {
                ctx.commands()
                    .destroy(projectile, ctx.processor_name(), reason.clone());
                destroyed += 1;
            } else {
                trace!(%projectile, "hit projectile already gone");
            }
        }
        debug!(tick = ctx.tick(), applied, destroyed, "projectile hits resolved");
    }
}
