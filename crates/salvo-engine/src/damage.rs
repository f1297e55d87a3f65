//! The damage interface consumed by the hit processor, plus a health-table
//! implementation.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;
use parking_lot::Mutex;
use salvo_ecs::entity::EntityHandle;
use tracing::debug;

use crate::actor::ActorHandle;
use crate::fragments::{DamageDescriptor, DamageEffectId};

// ---------------------------------------------------------------------------
// Interface
// ---------------------------------------------------------------------------

/// One damage application, built from a projectile's hit.
#[derive(Debug, Clone, PartialEq)]
pub struct DamageRequest {
    pub projectile: EntityHandle,
    pub target: ActorHandle,
    pub descriptor: DamageDescriptor,
    pub instigator: Option<ActorHandle>,
    pub owner: Option<ActorHandle>,
    pub location: Vec3,
    pub impact_point: Vec3,
    pub impact_normal: Vec3,
    /// Where the hitting sweep started.
    pub origin: Vec3,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DamageError {
    #[error("actor {target:?} does not accept damage")]
    NotAccepted { target: ActorHandle },

    #[error("actor {target:?} is already defeated")]
    TargetDefeated { target: ActorHandle },

    #[error("unknown damage effect {effect:?}")]
    UnknownEffect { effect: DamageEffectId },
}

/// Host damage system.
///
/// Not required to be thread-safe; the hit processor calls it from a single
/// thread unless configured otherwise.
pub trait DamageInterface: Send {
    /// Capability check: can `target` receive damage at all?
    fn accepts_damage(&self, target: ActorHandle) -> bool;

    fn apply(&mut self, request: &DamageRequest) -> Result<(), DamageError>;
}

// ---------------------------------------------------------------------------
// DamageLedger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LedgerState {
    health: HashMap<ActorHandle, f32>,
    effects: HashMap<DamageEffectId, f32>,
    applied: Vec<DamageRequest>,
}

/// Health table keyed by actor. Clones share the same table, so a test can
/// keep one clone and hand another to the hit processor.
#[derive(Debug, Clone, Default)]
pub struct DamageLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl DamageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define how much health `effect` removes.
    pub fn with_effect(self, effect: DamageEffectId, amount: f32) -> Self {
        self.state.lock().effects.insert(effect, amount);
        self
    }

    /// Make `actor` damageable with the given health.
    pub fn set_health(&self, actor: ActorHandle, health: f32) {
        self.state.lock().health.insert(actor, health);
    }

    pub fn health(&self, actor: ActorHandle) -> Option<f32> {
        self.state.lock().health.get(&actor).copied()
    }

    /// Every successfully applied request, in order.
    pub fn applied(&self) -> Vec<DamageRequest> {
        self.state.lock().applied.clone()
    }

    pub fn applied_count(&self) -> usize {
        self.state.lock().applied.len()
    }
}

impl DamageInterface for DamageLedger {
    fn accepts_damage(&self, target: ActorHandle) -> bool {
        self.state.lock().health.contains_key(&target)
    }

    fn apply(&mut self, request: &DamageRequest) -> Result<(), DamageError> {
        let mut state = self.state.lock();
        let amount = *state
            .effects
            .get(&request.descriptor.effect)
            .ok_or(DamageError::UnknownEffect {
                effect: request.descriptor.effect,
            })?;
        let health = state
            .health
            .get_mut(&request.target)
            .ok_or(DamageError::NotAccepted {
                target: request.target,
            })?;
        if *health <= 0.0 {
            return Err(DamageError::TargetDefeated {
                target: request.target,
            });
        }
        *health -= amount;
        debug!(
            target = ?request.target,
            amount,
            remaining = *health,
            "damage applied"
        );
        state.applied.push(request.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
