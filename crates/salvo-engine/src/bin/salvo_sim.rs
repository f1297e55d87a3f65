//! Headless projectile run: scatter a volley over a ground plane with a few
//! damageable targets, tick it for a while, and log what happened.
//!
//! Usage: `salvo-sim [config.json] [projectiles] [ticks] [seed]`

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use salvo_engine::prelude::*;
use salvo_engine::telemetry;
use tracing::info;

const TARGET_COUNT: usize = 8;
const TARGET_HEALTH: f32 = 100.0;
const ROCKET: DamageEffectId = DamageEffectId(1);

fn parse_arg<T: std::str::FromStr>(args: &[String], index: usize, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match args.get(index) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid argument #{index}: {raw:?}")),
        None => Ok(default),
    }
}

fn main() -> Result<()> {
    telemetry::init_tracing("info");

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1).filter(|a| a.as_str() != "-") {
        Some(path) => SimulationConfig::from_path(path)
            .with_context(|| format!("loading simulation config from {path}"))?,
        None => SimulationConfig::default(),
    };
    let projectiles: usize = parse_arg(&args, 2, 10_000)?;
    let ticks: u64 = parse_arg(&args, 3, 240)?;
    let seed: u64 = parse_arg(&args, 4, 7)?;

    let mut rng = Pcg64::seed_from_u64(seed);

    // -- scene ---------------------------------------------------------------

    let actors = ActorRegistry::shared();
    let ledger = DamageLedger::new().with_effect(ROCKET, 25.0);
    let mut collision =
        SimpleCollisionWorld::new().with(CollisionBody::plane(Vec3::Z, Vec3::ZERO));
    let mut targets = Vec::with_capacity(TARGET_COUNT);
    {
        let mut registry = actors.write();
        for i in 0..TARGET_COUNT {
            let target = registry.spawn_actor(&format!("target-{i}"));
            let primitive = registry.add_primitive(target);
            let center = Vec3::new(
                rng.gen_range(-2000.0..2000.0),
                rng.gen_range(-2000.0..2000.0),
                rng.gen_range(100.0..400.0),
            );
            collision.add(CollisionBody::sphere(center, 150.0).owned_by(target, primitive));
            ledger.set_health(target, TARGET_HEALTH);
            targets.push(target);
        }
    }
    let shooter = actors.write().spawn_actor("shooter");

    let gravity = ConstantGravity(config.gravity());
    let mut tick_loop =
        TickLoop::new(World::new(), config).context("building the tick loop")?;
    install_projectile_pipeline(
        &mut tick_loop,
        ProjectileServices {
            collision: Arc::new(collision),
            gravity: Arc::new(gravity),
            actors: Arc::clone(&actors),
            damage: Box::new(ledger.clone()),
        },
    )
    .context("installing the projectile pipeline")?;

    // -- volley --------------------------------------------------------------

    let bullets = ProjectileTemplate::new(
        tick_loop.world_mut(),
        &ProjectileConfig {
            damage_effect: ROCKET,
            ..ProjectileConfig::default()
        },
    )?;
    let grenades = ProjectileTemplate::new(
        tick_loop.world_mut(),
        &ProjectileConfig {
            description: ArchetypeDescription {
                sweep_radius: 10.0,
                ..ArchetypeDescription::default()
            },
            damage_effect: ROCKET,
            gravity_scale: GravityScale { scale: 1.5 },
        },
    )?;

    for i in 0..projectiles {
        let template = if i % 4 == 0 { &grenades } else { &bullets };
        let position = Vec3::new(
            rng.gen_range(-2500.0..2500.0),
            rng.gen_range(-2500.0..2500.0),
            rng.gen_range(200.0..1500.0),
        );
        let velocity = Vec3::new(
            rng.gen_range(-800.0..800.0),
            rng.gen_range(-800.0..800.0),
            rng.gen_range(-600.0..300.0),
        );
        template.spawn(
            tick_loop.world_mut(),
            SpawnParams {
                transform: Transform::from_position(position),
                velocity,
                instigator: Some(shooter),
                owner: Some(shooter),
                ignored_actors: smallvec::smallvec![shooter],
                ..SpawnParams::default()
            },
        )?;
    }
    let stages = tick_loop.stage_names()?;
    info!(
        projectiles,
        archetypes = tick_loop.world().archetype_count(),
        ?stages,
        "volley spawned"
    );

    // -- run -----------------------------------------------------------------

    let started = Instant::now();
    let mut destroyed = 0usize;
    for _ in 0..ticks {
        let report = tick_loop.tick()?;
        destroyed += report
            .commands
            .iter()
            .filter(|c| c.kind == CommandKind::Destroy && c.outcome == CommandOutcome::Applied)
            .count();
        if tick_loop.world().entity_count() == 0 {
            break;
        }
    }
    let elapsed = started.elapsed();

    let defeated = targets
        .iter()
        .filter(|t| ledger.health(**t).is_some_and(|h| h <= 0.0))
        .count();
    info!(
        ticks = tick_loop.tick_count(),
        sim_time = tick_loop.sim_time(),
        wall_ms = elapsed.as_millis() as u64,
        destroyed,
        in_flight = tick_loop.world().entity_count(),
        damage_events = ledger.applied_count(),
        defeated,
        "simulation finished"
    );
    Ok(())
}
