//! Deferred structural mutations.
//!
//! While a stage runs, processors only hold `&World`, so anything that would
//! change the shape of the store (destroying an entity, adding or removing a
//! fragment) is queued on the [`CommandBuffer`] and applied in a single
//! threaded flush once the stage has finished. Submission takes `&self`, so
//! chunk callbacks running on different worker threads can queue commands
//! concurrently.
//!
//! Commands are applied in submission order. Commands aimed at a handle that
//! is no longer valid are skipped, never treated as errors: a projectile
//! destroyed by one processor and then by another is simply gone.
//!
//! Fragment values in commands are stored as [`serde_json::Value`] and decoded
//! through the world's registry on apply, so commands can name fragments the
//! issuing processor has no static type for.
//!
//! # Example
//!
//! ```
//! use salvo_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Fuse(f32);
//!
//! let mut world = World::new();
//! world.register_fragment::<Fuse>("fuse");
//! let entity = world.spawn(FragmentBundle::new().with(Fuse(2.0))).unwrap();
//!
//! let mut cmds = CommandBuffer::new();
//! cmds.set_fragment(entity, "fuse", serde_json::json!(0.5), "timer", CausalReason::GameRule("fuse_shortened".into()));
//! cmds.destroy(entity, "timer", CausalReason::Lifetime);
//! cmds.destroy(entity, "timer", CausalReason::Lifetime);
//!
//! let applied = cmds.apply(&mut world);
//! assert_eq!(applied.len(), 3);
//! assert!(!world.is_alive(entity));
//! assert_eq!(cmds.last_apply_report().skipped, 1);
//! ```

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entity::EntityHandle;
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// CausalReason
// ---------------------------------------------------------------------------

/// Why a command was issued. Logged with failures and kept on the applied
/// command for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CausalReason {
    /// Consequence of a delivered signal (e.g. `"projectile.hit"`).
    Signal(String),
    /// A gameplay rule (e.g. `"consumed_on_hit"`).
    GameRule(String),
    /// Lifetime expiry.
    Lifetime,
    /// Requested from outside the pipeline.
    External(String),
}

// ---------------------------------------------------------------------------
// CommandKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Insert or overwrite a fragment by registered name.
    SetFragment {
        fragment_name: String,
        value: serde_json::Value,
    },
    /// Remove a fragment by registered name.
    RemoveFragment { fragment_name: String },
    /// Destroy the entity.
    Destroy,
}

impl CommandKind {
    fn fragment_name(&self) -> Option<&str> {
        match self {
            CommandKind::SetFragment { fragment_name, .. }
            | CommandKind::RemoveFragment { fragment_name } => Some(fragment_name),
            CommandKind::Destroy => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// What happened to a command when it was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum CommandOutcome {
    /// Not applied yet.
    #[default]
    Pending,
    Applied,
    /// The target handle was stale; nothing happened.
    Skipped,
    /// The mutation was rejected (unknown fragment, bad value).
    Failed(String),
}

/// A single deferred mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub target: EntityHandle,
    pub kind: CommandKind,
    /// Name of the processor (or external caller) that queued it.
    pub issued_by: String,
    pub reason: CausalReason,
    /// Submission order within the flush.
    pub command_index: u32,
    #[serde(default)]
    pub outcome: CommandOutcome,
}

// ---------------------------------------------------------------------------
// ApplyReport
// ---------------------------------------------------------------------------

/// Summary of the last [`CommandBuffer::apply`] call.
///
/// `conflict_count` counts (entity, fragment) pairs targeted by more than one
/// set/remove in the same flush; the last one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub conflict_count: usize,
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Queue {
    commands: Vec<Command>,
    next_index: u32,
}

/// Thread-safe, append-only queue of deferred commands.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    queue: Mutex<Queue>,
    last_apply_report: ApplyReport,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fragment insert/overwrite. `value` is decoded on apply.
    pub fn set_fragment(
        &self,
        target: EntityHandle,
        fragment_name: &str,
        value: serde_json::Value,
        issued_by: &str,
        reason: CausalReason,
    ) {
        self.push(
            target,
            CommandKind::SetFragment {
                fragment_name: fragment_name.to_owned(),
                value,
            },
            issued_by,
            reason,
        );
    }

    pub fn remove_fragment(
        &self,
        target: EntityHandle,
        fragment_name: &str,
        issued_by: &str,
        reason: CausalReason,
    ) {
        self.push(
            target,
            CommandKind::RemoveFragment {
                fragment_name: fragment_name.to_owned(),
            },
            issued_by,
            reason,
        );
    }

    pub fn destroy(&self, target: EntityHandle, issued_by: &str, reason: CausalReason) {
        self.push(target, CommandKind::Destroy, issued_by, reason);
    }

    fn push(&self, target: EntityHandle, kind: CommandKind, issued_by: &str, reason: CausalReason) {
        let mut queue = self.queue.lock();
        let command_index = queue.next_index;
        queue.next_index += 1;
        queue.commands.push(Command {
            target,
            kind,
            issued_by: issued_by.to_owned(),
            reason,
            command_index,
            outcome: CommandOutcome::Pending,
        });
    }

    pub fn len(&self) -> usize {
        self.queue.lock().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().commands.is_empty()
    }

    /// Copy of the queued commands, in submission order.
    pub fn pending(&self) -> Vec<Command> {
        self.queue.lock().commands.clone()
    }

    /// Drop every queued command without applying it.
    pub fn clear(&mut self) {
        let queue = self.queue.get_mut();
        queue.commands.clear();
        queue.next_index = 0;
    }

    /// Report from the last [`apply`](Self::apply). All zero before the first.
    pub fn last_apply_report(&self) -> &ApplyReport {
        &self.last_apply_report
    }

    /// Apply every queued command in submission order and empty the buffer.
    ///
    /// Returns the commands with their [`CommandOutcome`] filled in. Stale
    /// targets are skipped quietly; other failures are logged as warnings
    /// and never stop the flush.
    pub fn apply(&mut self, world: &mut World) -> Vec<Command> {
        let mut commands = {
            let queue = self.queue.get_mut();
            queue.next_index = 0;
            std::mem::take(&mut queue.commands)
        };

        // --- Conflict detection ---
        let mut seen: HashMap<(EntityHandle, &str), Vec<u32>> = HashMap::new();
        for cmd in &commands {
            if let Some(name) = cmd.kind.fragment_name() {
                seen.entry((cmd.target, name))
                    .or_default()
                    .push(cmd.command_index);
            }
        }
        let mut conflict_count = 0;
        for ((entity, fragment), indices) in &seen {
            if indices.len() > 1 {
                conflict_count += 1;
                warn!(
                    entity = ?entity,
                    fragment = %fragment,
                    command_indices = ?indices,
                    "{} commands target the same entity and fragment in one flush (last write wins)",
                    indices.len()
                );
            }
        }
        drop(seen);

        // --- Apply loop ---
        let mut report = ApplyReport {
            conflict_count,
            ..ApplyReport::default()
        };
        for cmd in &mut commands {
            let result = match &cmd.kind {
                CommandKind::SetFragment {
                    fragment_name,
                    value,
                } => world.set_fragment_by_name(cmd.target, fragment_name, value),
                CommandKind::RemoveFragment { fragment_name } => {
                    world.remove_fragment_by_name(cmd.target, fragment_name)
                }
                CommandKind::Destroy => world.destroy(cmd.target),
            };
            cmd.outcome = match result {
                Ok(()) => {
                    report.applied += 1;
                    CommandOutcome::Applied
                }
                Err(EcsError::StaleEntity { entity }) => {
                    debug!(
                        command_index = cmd.command_index,
                        entity = ?entity,
                        issued_by = %cmd.issued_by,
                        "command target already gone, skipping"
                    );
                    report.skipped += 1;
                    CommandOutcome::Skipped
                }
                Err(e) => {
                    warn!(
                        command_index = cmd.command_index,
                        target = ?cmd.target,
                        issued_by = %cmd.issued_by,
                        reason = ?cmd.reason,
                        error = %e,
                        "command application failed"
                    );
                    report.failed += 1;
                    CommandOutcome::Failed(e.to_string())
                }
            };
        }

        self.last_apply_report = report;
        commands
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
