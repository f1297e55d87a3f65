//! End-to-end projectile scenarios through the tick loop: free flight,
//! blocked moves, damage against valid/invalid/stale targets, destruction and
//! `projectile.hit` delivery.

use std::sync::Arc;

use glam::Vec3;
use salvo_engine::prelude::*;
use salvo_engine::spawn;

const BLAST: DamageEffectId = DamageEffectId(3);
const DT: f32 = 0.1;

struct Harness {
    tick_loop: TickLoop,
    template: ProjectileTemplate,
}

fn config(gravity: Vec3) -> SimulationConfig {
    SimulationConfig {
        fixed_dt: DT as f64,
        world_gravity: gravity.to_array(),
        ..SimulationConfig::default()
    }
}

fn projectile_config(sweep_radius: f32) -> ProjectileConfig {
    ProjectileConfig {
        description: ArchetypeDescription {
            sweep_radius,
            ..ArchetypeDescription::default()
        },
        damage_effect: BLAST,
        ..ProjectileConfig::default()
    }
}

/// Movement and hit processors, as installed by the engine.
fn full_pipeline(
    collision: SimpleCollisionWorld,
    actors: SharedActors,
    ledger: DamageLedger,
    gravity: Vec3,
) -> Harness {
    let mut tick_loop = TickLoop::new(World::new(), config(gravity)).unwrap();
    install_projectile_pipeline(
        &mut tick_loop,
        ProjectileServices {
            collision: Arc::new(collision),
            gravity: Arc::new(ConstantGravity(gravity)),
            actors,
            damage: Box::new(ledger),
        },
    )
    .unwrap();
    let template = ProjectileTemplate::new(tick_loop.world_mut(), &projectile_config(0.0)).unwrap();
    Harness {
        tick_loop,
        template,
    }
}

/// Movement only, so projectiles that hit stay alive for inspection.
fn movement_only(
    collision: SimpleCollisionWorld,
    actors: SharedActors,
    gravity: Vec3,
    sweep_radius: f32,
) -> Harness {
    let mut tick_loop = TickLoop::new(World::new(), config(gravity)).unwrap();
    tick_loop
        .add_processor(Box::new(ProjectileMovementProcessor::new(
            Arc::new(collision),
            Arc::new(ConstantGravity(gravity)),
            actors,
        )))
        .unwrap();
    let template =
        ProjectileTemplate::new(tick_loop.world_mut(), &projectile_config(sweep_radius)).unwrap();
    Harness {
        tick_loop,
        template,
    }
}

fn fire(h: &mut Harness, from: Vec3, velocity: Vec3) -> EntityHandle {
    h.template
        .spawn(
            h.tick_loop.world_mut(),
            SpawnParams {
                transform: Transform::from_position(from),
                velocity,
                ..SpawnParams::default()
            },
        )
        .unwrap()
}

fn assert_close(actual: Vec3, expected: Vec3) {
    assert!(
        (actual - expected).length() < 1e-3,
        "expected {expected:?}, got {actual:?}"
    );
}

/// A shooter and a damageable target sphere of radius 1 at x = 10.
struct Range {
    actors: SharedActors,
    shooter: ActorHandle,
    target: ActorHandle,
    collision: SimpleCollisionWorld,
}

fn range() -> Range {
    let actors = ActorRegistry::shared();
    let (shooter, target, primitive) = {
        let mut registry = actors.write();
        let shooter = registry.spawn_actor("shooter");
        let target = registry.spawn_actor("target");
        let primitive = registry.add_primitive(target);
        (shooter, target, primitive)
    };
    let collision = SimpleCollisionWorld::new()
        .with(CollisionBody::sphere(Vec3::new(10.0, 0.0, 0.0), 1.0).owned_by(target, primitive));
    Range {
        actors,
        shooter,
        target,
        collision,
    }
}

fn fire_at_target(h: &mut Harness, shooter: ActorHandle) -> EntityHandle {
    h.template
        .spawn(
            h.tick_loop.world_mut(),
            SpawnParams {
                velocity: Vec3::new(200.0, 0.0, 0.0),
                instigator: Some(shooter),
                owner: Some(shooter),
                ..SpawnParams::default()
            },
        )
        .unwrap()
}

// ---------------------------------------------------------------------------
// Free flight
// ---------------------------------------------------------------------------

#[test]
fn free_fall_integrates_velocity_then_position() {
    let gravity = Vec3::new(0.0, 0.0, -10.0);
    let mut h = full_pipeline(
        SimpleCollisionWorld::new(),
        ActorRegistry::shared(),
        DamageLedger::new(),
        gravity,
    );
    let start = Vec3::new(0.0, 0.0, 100.0);
    let shot = fire(&mut h, start, Vec3::new(10.0, 0.0, 0.0));

    h.tick_loop.tick().unwrap();

    let world = h.tick_loop.world();
    let velocity = spawn::velocity(world, shot).unwrap();
    assert_close(velocity, Vec3::new(10.0, 0.0, -1.0));
    let transform = spawn::transform(world, shot).unwrap();
    assert_close(transform.position, start + velocity * DT);
    assert_close(transform.rotation * Vec3::X, velocity.normalize());
    assert!(world.get::<HitInfo>(shot).unwrap().hit.is_none());
}

#[test]
fn free_fall_over_many_ticks_matches_euler_steps() {
    let gravity = Vec3::new(0.0, 0.0, -10.0);
    let mut h = full_pipeline(
        SimpleCollisionWorld::new(),
        ActorRegistry::shared(),
        DamageLedger::new(),
        gravity,
    );
    let mut position = Vec3::new(-5.0, 3.0, 500.0);
    let mut velocity = Vec3::new(4.0, -2.0, 30.0);
    let shot = fire(&mut h, position, velocity);

    for _ in 0..20 {
        velocity += gravity * DT;
        position += velocity * DT;
    }
    h.tick_loop.run_ticks(20).unwrap();

    let world = h.tick_loop.world();
    assert_close(spawn::velocity(world, shot).unwrap(), velocity);
    assert_close(spawn::transform(world, shot).unwrap().position, position);
}

#[test]
fn gravity_scale_is_per_family() {
    let gravity = Vec3::new(0.0, 0.0, -10.0);
    let mut h = movement_only(SimpleCollisionWorld::new(), ActorRegistry::shared(), gravity, 0.0);
    let floaty = ProjectileTemplate::new(
        h.tick_loop.world_mut(),
        &ProjectileConfig {
            gravity_scale: GravityScale { scale: 0.0 },
            ..ProjectileConfig::default()
        },
    )
    .unwrap();
    let heavy = ProjectileTemplate::new(
        h.tick_loop.world_mut(),
        &ProjectileConfig {
            gravity_scale: GravityScale { scale: 2.0 },
            ..ProjectileConfig::default()
        },
    )
    .unwrap();
    let a = floaty.spawn(h.tick_loop.world_mut(), SpawnParams::default()).unwrap();
    let b = heavy.spawn(h.tick_loop.world_mut(), SpawnParams::default()).unwrap();
    let c = heavy
        .spawn(
            h.tick_loop.world_mut(),
            SpawnParams {
                force: Vec3::new(0.0, 0.0, 20.0),
                ..SpawnParams::default()
            },
        )
        .unwrap();

    h.tick_loop.tick().unwrap();

    let world = h.tick_loop.world();
    assert_close(spawn::velocity(world, a).unwrap(), Vec3::ZERO);
    assert_close(spawn::velocity(world, b).unwrap(), Vec3::new(0.0, 0.0, -2.0));
    // Force cancels the doubled gravity.
    assert_close(spawn::velocity(world, c).unwrap(), Vec3::ZERO);
}

// ---------------------------------------------------------------------------
// Blocked moves
// ---------------------------------------------------------------------------

#[test]
fn blocked_move_stops_at_sweep_location() {
    let ground = SimpleCollisionWorld::new().with(CollisionBody::plane(Vec3::Z, Vec3::ZERO));
    let mut h = movement_only(ground, ActorRegistry::shared(), Vec3::ZERO, 0.5);
    let shot = fire(&mut h, Vec3::new(3.0, 4.0, 10.0), Vec3::new(0.0, 0.0, -200.0));

    h.tick_loop.tick().unwrap();

    let world = h.tick_loop.world();
    let hit = world.get::<HitInfo>(shot).unwrap().hit.unwrap();
    // The sphere's center stops one radius above the surface.
    assert_close(hit.location, Vec3::new(3.0, 4.0, 0.5));
    assert_close(hit.impact_point, Vec3::new(3.0, 4.0, 0.0));
    assert_eq!(hit.impact_normal, Vec3::Z);
    assert_eq!(hit.trace_start, Vec3::new(3.0, 4.0, 10.0));
    assert_eq!(spawn::transform(world, shot).unwrap().position, hit.location);
}

#[test]
fn ignored_actor_is_passed_through() {
    let r = range();
    let mut h = movement_only(r.collision, Arc::clone(&r.actors), Vec3::ZERO, 0.0);
    let shot = h
        .template
        .spawn(
            h.tick_loop.world_mut(),
            SpawnParams {
                velocity: Vec3::new(200.0, 0.0, 0.0),
                ignored_actors: smallvec::smallvec![r.target],
                ..SpawnParams::default()
            },
        )
        .unwrap();

    h.tick_loop.tick().unwrap();

    let world = h.tick_loop.world();
    assert!(world.get::<HitInfo>(shot).unwrap().hit.is_none());
    assert_close(spawn::transform(world, shot).unwrap().position, Vec3::new(20.0, 0.0, 0.0));
}

#[test]
fn non_blocking_channel_is_passed_through() {
    let wall = SimpleCollisionWorld::new().with(
        CollisionBody::aabb(Vec3::new(5.0, -5.0, -5.0), Vec3::new(6.0, 5.0, 5.0))
            .blocking(ChannelMask::NONE.with(CollisionChannel::Pawn)),
    );
    let mut h = movement_only(wall, ActorRegistry::shared(), Vec3::ZERO, 0.0);
    let shot = fire(&mut h, Vec3::ZERO, Vec3::new(100.0, 0.0, 0.0));

    h.tick_loop.tick().unwrap();

    let world = h.tick_loop.world();
    assert!(world.get::<HitInfo>(shot).unwrap().hit.is_none());
    assert_close(spawn::transform(world, shot).unwrap().position, Vec3::new(10.0, 0.0, 0.0));
}

// ---------------------------------------------------------------------------
// Hit resolution
// ---------------------------------------------------------------------------

#[test]
fn hit_on_valid_target_applies_damage_and_destroys() {
    let r = range();
    let ledger = DamageLedger::new().with_effect(BLAST, 30.0);
    ledger.set_health(r.target, 100.0);
    let mut h = full_pipeline(r.collision, Arc::clone(&r.actors), ledger.clone(), Vec3::ZERO);
    let shot = fire_at_target(&mut h, r.shooter);

    let report = h.tick_loop.tick().unwrap();

    assert!(!h.tick_loop.world().is_alive(shot));
    assert_eq!(ledger.health(r.target), Some(70.0));

    let applied = ledger.applied();
    assert_eq!(applied.len(), 1);
    let request = &applied[0];
    assert_eq!(request.projectile, shot);
    assert_eq!(request.target, r.target);
    assert_eq!(request.descriptor.effect, BLAST);
    assert_eq!(request.instigator, Some(r.shooter));
    assert_eq!(request.owner, Some(r.shooter));
    assert_eq!(request.origin, Vec3::ZERO);
    assert_close(request.location, Vec3::new(9.0, 0.0, 0.0));
    assert_close(request.impact_point, Vec3::new(9.0, 0.0, 0.0));
    assert_close(request.impact_normal, Vec3::NEG_X);

    let destroys: Vec<&Command> = report
        .commands
        .iter()
        .filter(|c| c.kind == CommandKind::Destroy)
        .collect();
    assert_eq!(destroys.len(), 1);
    assert_eq!(destroys[0].target, shot);
    assert_eq!(destroys[0].issued_by, HIT_PROCESSOR_NAME);
    assert_eq!(
        destroys[0].reason,
        CausalReason::Signal("projectile.hit".into())
    );
    assert_eq!(destroys[0].outcome, CommandOutcome::Applied);
}

#[test]
fn hit_via_primitive_resolves_owning_actor() {
    let actors = ActorRegistry::shared();
    let (target, primitive) = {
        let mut registry = actors.write();
        let target = registry.spawn_actor("tower");
        (target, registry.add_primitive(target).unwrap())
    };
    // The collider only knows its primitive.
    let mut body = CollisionBody::sphere(Vec3::new(10.0, 0.0, 0.0), 1.0);
    body.primitive = Some(primitive);
    let collision = SimpleCollisionWorld::new().with(body);

    let ledger = DamageLedger::new().with_effect(BLAST, 10.0);
    ledger.set_health(target, 50.0);
    let mut h = full_pipeline(collision, actors, ledger.clone(), Vec3::ZERO);
    let shot = fire(&mut h, Vec3::ZERO, Vec3::new(200.0, 0.0, 0.0));

    h.tick_loop.tick().unwrap();

    assert!(!h.tick_loop.world().is_alive(shot));
    assert_eq!(ledger.health(target), Some(40.0));
}

#[test]
fn target_without_damage_capability_is_skipped_but_projectile_destroyed() {
    let r = range();
    // No health entry: the ledger does not accept damage for the target.
    let ledger = DamageLedger::new().with_effect(BLAST, 30.0);
    let mut h = full_pipeline(r.collision, Arc::clone(&r.actors), ledger.clone(), Vec3::ZERO);
    let shot = fire_at_target(&mut h, r.shooter);

    h.tick_loop.tick().unwrap();

    assert!(!h.tick_loop.world().is_alive(shot));
    assert_eq!(ledger.applied_count(), 0);
    assert_eq!(ledger.health(r.target), None);
}

#[test]
fn stale_target_reference_is_skipped_but_projectile_destroyed() {
    let r = range();
    let ledger = DamageLedger::new().with_effect(BLAST, 30.0);
    ledger.set_health(r.target, 100.0);
    let mut h = full_pipeline(r.collision, Arc::clone(&r.actors), ledger.clone(), Vec3::ZERO);
    let shot = fire_at_target(&mut h, r.shooter);

    // The collider still reports the old owner; both its handles are stale.
    assert!(r.actors.write().destroy_actor(r.target));
    h.tick_loop.tick().unwrap();

    assert!(!h.tick_loop.world().is_alive(shot));
    assert_eq!(ledger.applied_count(), 0);
    assert_eq!(ledger.health(r.target), Some(100.0));
}

#[test]
fn stale_instigator_is_reported_as_none() {
    let r = range();
    let ledger = DamageLedger::new().with_effect(BLAST, 30.0);
    ledger.set_health(r.target, 100.0);
    let mut h = full_pipeline(r.collision, Arc::clone(&r.actors), ledger.clone(), Vec3::ZERO);
    fire_at_target(&mut h, r.shooter);

    r.actors.write().destroy_actor(r.shooter);
    h.tick_loop.tick().unwrap();

    let applied = ledger.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].instigator, None);
    assert_eq!(applied[0].owner, None);
}

#[test]
fn failed_damage_still_destroys_projectile() {
    let r = range();
    // Health but no effect table entry: apply() fails with UnknownEffect.
    let ledger = DamageLedger::new();
    ledger.set_health(r.target, 100.0);
    let mut h = full_pipeline(r.collision, Arc::clone(&r.actors), ledger.clone(), Vec3::ZERO);
    let shot = fire_at_target(&mut h, r.shooter);

    h.tick_loop.tick().unwrap();

    assert!(!h.tick_loop.world().is_alive(shot));
    assert_eq!(ledger.health(r.target), Some(100.0));
    assert_eq!(ledger.applied_count(), 0);
}

/// Kills whatever it damages by removing the actor from the registry.
struct Lethal {
    actors: SharedActors,
    killed: Arc<parking_lot::Mutex<Vec<ActorHandle>>>,
}

impl DamageInterface for Lethal {
    fn accepts_damage(&self, target: ActorHandle) -> bool {
        self.actors.read().is_alive(target)
    }

    fn apply(&mut self, request: &DamageRequest) -> Result<(), DamageError> {
        if !self.actors.write().destroy_actor(request.target) {
            return Err(DamageError::TargetDefeated {
                target: request.target,
            });
        }
        self.killed.lock().push(request.target);
        Ok(())
    }
}

#[test]
fn damage_interface_may_write_actors_while_applying() {
    let r = range();
    let killed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut tick_loop = TickLoop::new(World::new(), config(Vec3::ZERO)).unwrap();
    install_projectile_pipeline(
        &mut tick_loop,
        ProjectileServices {
            collision: Arc::new(r.collision),
            gravity: Arc::new(ConstantGravity(Vec3::ZERO)),
            actors: Arc::clone(&r.actors),
            damage: Box::new(Lethal {
                actors: Arc::clone(&r.actors),
                killed: Arc::clone(&killed),
            }),
        },
    )
    .unwrap();
    let template = ProjectileTemplate::new(tick_loop.world_mut(), &projectile_config(0.0)).unwrap();
    let mut h = Harness {
        tick_loop,
        template,
    };
    // Two shots land on the same target in one tick; only the first kills.
    let first = fire_at_target(&mut h, r.shooter);
    let second = fire_at_target(&mut h, r.shooter);

    h.tick_loop.tick().unwrap();

    assert_eq!(*killed.lock(), vec![r.target]);
    assert!(!r.actors.read().is_alive(r.target));
    assert!(r.actors.read().is_alive(r.shooter));
    let world = h.tick_loop.world();
    assert!(!world.is_alive(first));
    assert!(!world.is_alive(second));
}

// ---------------------------------------------------------------------------
// Signals and destruction
// ---------------------------------------------------------------------------

fn ground_volley(h: &mut Harness) -> (Vec<EntityHandle>, Vec<EntityHandle>) {
    let mut hitting = Vec::new();
    let mut missing = Vec::new();
    for i in 0..8 {
        let from = Vec3::new(i as f32 * 10.0, 0.0, 10.0);
        if i % 3 == 0 {
            missing.push(fire(h, from, Vec3::new(0.0, 0.0, 50.0)));
        } else {
            hitting.push(fire(h, from, Vec3::new(0.0, 0.0, -500.0)));
        }
    }
    (hitting, missing)
}

#[test]
fn hit_signal_carries_exactly_the_hitting_projectiles() {
    let ground = SimpleCollisionWorld::new().with(CollisionBody::plane(Vec3::Z, Vec3::ZERO));
    let mut h = movement_only(ground, ActorRegistry::shared(), Vec3::ZERO, 0.0);
    h.tick_loop.signals_mut().subscribe(PROJECTILE_HIT, "observer");
    let (mut hitting, missing) = ground_volley(&mut h);

    h.tick_loop.tick().unwrap();

    let world = h.tick_loop.world();
    let delivery = h.tick_loop.signals().take("observer", world);
    hitting.sort();
    assert_eq!(delivery.entities(PROJECTILE_HIT), hitting.as_slice());
    for shot in &hitting {
        assert!(world.get::<HitInfo>(*shot).unwrap().hit.is_some());
        assert!(spawn::transform(world, *shot).unwrap().position.z.abs() < 1e-4);
    }
    for shot in &missing {
        assert!(world.get::<HitInfo>(*shot).unwrap().hit.is_none());
    }
}

#[test]
fn every_delivered_projectile_is_destroyed_in_the_same_tick() {
    let ground = SimpleCollisionWorld::new().with(CollisionBody::plane(Vec3::Z, Vec3::ZERO));
    let mut h = full_pipeline(ground, ActorRegistry::shared(), DamageLedger::new(), Vec3::ZERO);
    h.tick_loop.signals_mut().subscribe(PROJECTILE_HIT, "observer");
    let (hitting, missing) = ground_volley(&mut h);

    let report = h.tick_loop.tick().unwrap();

    let world = h.tick_loop.world();
    assert!(hitting.iter().all(|e| !world.is_alive(*e)));
    assert!(missing.iter().all(|e| world.is_alive(*e)));
    assert_eq!(world.entity_count(), missing.len());
    assert_eq!(
        report
            .commands
            .iter()
            .filter(|c| c.outcome == CommandOutcome::Applied)
            .count(),
        hitting.len()
    );
    // Handles destroyed before the observer drains are filtered out.
    assert!(h.tick_loop.signals().take("observer", world).is_empty());

    let diag = h.tick_loop.last_diagnostics();
    assert_eq!(diag.stage_times.len(), 2);
    assert_eq!(diag.stage_times[1].0, vec![HIT_PROCESSOR_NAME]);
}

/// Records the live hit handles it is handed, ahead of the hit processor.
struct ImpactRecorder {
    seen: Arc<parking_lot::Mutex<Vec<EntityHandle>>>,
}

impl Processor for ImpactRecorder {
    fn name(&self) -> &str {
        "impact_recorder"
    }

    fn access(&self) -> AccessSet {
        AccessSet::new().read::<HitInfo>()
    }

    fn run_after(&self) -> Vec<String> {
        vec![MOVEMENT_PROCESSOR_NAME.to_owned()]
    }

    fn run_before(&self) -> Vec<String> {
        vec![HIT_PROCESSOR_NAME.to_owned()]
    }

    fn subscriptions(&self) -> Vec<SignalName> {
        vec![PROJECTILE_HIT]
    }

    fn execute(&mut self, ctx: &ExecutionContext<'_>) {
        let mut seen = self.seen.lock();
        seen.extend(
            ctx.delivered()
                .entities(PROJECTILE_HIT)
                .iter()
                .copied()
                .filter(|e| ctx.is_alive(*e)),
        );
    }
}

#[test]
fn hit_observer_ordered_before_hit_processor_sees_live_projectiles() {
    let ground = SimpleCollisionWorld::new().with(CollisionBody::plane(Vec3::Z, Vec3::ZERO));
    let mut h = full_pipeline(ground, ActorRegistry::shared(), DamageLedger::new(), Vec3::ZERO);
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    h.tick_loop
        .add_processor(Box::new(ImpactRecorder {
            seen: Arc::clone(&seen),
        }))
        .unwrap();
    let (mut hitting, _) = ground_volley(&mut h);

    assert_eq!(
        h.tick_loop.stage_names().unwrap(),
        vec![
            vec![MOVEMENT_PROCESSOR_NAME.to_owned()],
            vec!["impact_recorder".to_owned()],
            vec![HIT_PROCESSOR_NAME.to_owned()],
        ]
    );

    h.tick_loop.tick().unwrap();

    hitting.sort();
    assert_eq!(*seen.lock(), hitting);
    let world = h.tick_loop.world();
    assert!(hitting.iter().all(|e| !world.is_alive(*e)));
}

#[test]
fn hit_processor_is_idle_without_hits() {
    let mut h = full_pipeline(
        SimpleCollisionWorld::new(),
        ActorRegistry::shared(),
        DamageLedger::new(),
        Vec3::ZERO,
    );
    fire(&mut h, Vec3::ZERO, Vec3::X);

    let report = h.tick_loop.tick().unwrap();

    assert!(report.commands.is_empty());
    let diag = h.tick_loop.last_diagnostics();
    assert_eq!(diag.stage_times[0].0, vec![MOVEMENT_PROCESSOR_NAME]);
    assert!(diag.stage_times[1].0.is_empty());
}

#[test]
fn double_destroy_is_a_no_op_and_keeps_neighbours_intact() {
    let mut h = movement_only(SimpleCollisionWorld::new(), ActorRegistry::shared(), Vec3::ZERO, 0.0);
    let shots: Vec<EntityHandle> = (0..4)
        .map(|i| fire(&mut h, Vec3::new(i as f32, 0.0, 0.0), Vec3::ZERO))
        .collect();

    let world = h.tick_loop.world_mut();
    assert!(spawn::destroy_projectile(world, shots[1]));
    assert!(!spawn::destroy_projectile(world, shots[1]));
    assert!(!spawn::set_velocity(world, shots[1], Vec3::X));

    // Deferred destroys: the second one finds a stale handle.
    let reason = CausalReason::External("cleanup".into());
    h.tick_loop.commands().destroy(shots[0], "test", reason.clone());
    h.tick_loop.commands().destroy(shots[0], "test", reason);
    let report = h.tick_loop.tick().unwrap();
    let outcomes: Vec<&CommandOutcome> = report.commands.iter().map(|c| &c.outcome).collect();
    assert_eq!(outcomes, [&CommandOutcome::Applied, &CommandOutcome::Skipped]);

    let world = h.tick_loop.world();
    assert_eq!(world.entity_count(), 2);
    assert_eq!(
        spawn::transform(world, shots[2]).unwrap().position,
        Vec3::new(2.0, 0.0, 0.0)
    );
    assert_eq!(
        spawn::transform(world, shots[3]).unwrap().position,
        Vec3::new(3.0, 0.0, 0.0)
    );
}
