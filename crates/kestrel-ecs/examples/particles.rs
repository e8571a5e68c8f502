//! Particle drift demo -- moves a cloud of particles every tick and recycles
//! the ones that leave the arena through a command log.
//!
//! Run with:
//!   RUST_LOG=info cargo run --release --example particles -p kestrel-ecs
//!
//! The same seeded cloud is simulated once on the calling thread and once on
//! the worker pool; both runs report the same checksum.

use std::time::Instant;

use kestrel_ecs::prelude::*;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use tracing::{info, warn};

const PARTICLES: usize = 50_000;
const TICKS: usize = 120;
const ARENA: f32 = 100.0;
const SEED: u64 = 0x5eed;

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Speed {
    x: f32,
    y: f32,
}

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

fn spawn_cloud(world: &mut World, rng: &mut Pcg64, count: usize) -> Result<(), EcsError> {
    for _ in 0..count {
        let e = world.create_entity()?;
        world.set_component(
            e,
            Position {
                x: rng.gen_range(-ARENA..ARENA),
                y: rng.gen_range(-ARENA..ARENA),
            },
        )?;
        world.set_component(
            e,
            Speed {
                x: rng.gen_range(-1.0..1.0),
                y: rng.gen_range(-1.0..1.0),
            },
        )?;
    }
    Ok(())
}

/// Advance every mover by its speed, writing positions in place.
fn integrate(
    world: &mut World,
    movers: QueryId,
    dispatcher: &ParallelDispatcher,
) -> Result<(), EcsError> {
    let (positions, rest) = world.split_store_mut::<Position>()?;
    let speeds = rest.store::<Speed>()?;
    dispatcher.dispatch_mut(rest.view(movers), positions, |mut chunk| {
        chunk.for_each_mut(|entity, pos| {
            if let Some(speed) = speeds.get(entity) {
                pos.x += speed.x;
                pos.y += speed.y;
            }
        });
    });
    Ok(())
}

/// Replace every particle outside the arena with one at the origin heading
/// back the way it came. Returns how many were replaced.
fn recycle(
    world: &mut World,
    movers: QueryId,
    dispatcher: &ParallelDispatcher,
    log: &mut CommandLog,
) -> Result<usize, EcsError> {
    let registry = world.registry();
    let positions = world.store::<Position>()?;
    let speeds = world.store::<Speed>()?;
    dispatcher.dispatch_with_commands(world.view(movers), log, |chunk, segment| {
        for &entity in chunk {
            let (Some(pos), Some(speed)) = (positions.get(entity), speeds.get(entity)) else {
                continue;
            };
            if pos.x.abs() <= ARENA && pos.y.abs() <= ARENA {
                continue;
            }
            let old = segment.record(entity);
            let fresh = segment.create_entity();
            let queued = segment
                .destroy(old)
                .and_then(|()| segment.set(registry, fresh, Position { x: 0.0, y: 0.0 }))
                .and_then(|_| {
                    segment.set(
                        registry,
                        fresh,
                        Speed {
                            x: -speed.x,
                            y: -speed.y,
                        },
                    )
                });
            if let Err(err) = queued {
                warn!(%entity, %err, "could not queue recycle");
            }
        }
    });
    let report = log.replay(world)?;
    Ok(report.created)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

fn run(label: &str, dispatcher: &ParallelDispatcher) -> Result<(), EcsError> {
    let mut world = World::with_config(WorldConfig {
        initial_capacity: PARTICLES,
        max_entities: None,
    });
    world.register_pod_component::<Position>("position")?;
    world.register_pod_component::<Speed>("speed")?;
    let movers = world.query(QueryDesc::new().with::<Position>().with::<Speed>())?;

    let mut rng = Pcg64::seed_from_u64(SEED);
    spawn_cloud(&mut world, &mut rng, PARTICLES)?;

    let mut log = CommandLog::new();
    let mut recycled = 0;
    let start = Instant::now();
    for _ in 0..TICKS {
        integrate(&mut world, movers, dispatcher)?;
        recycled += recycle(&mut world, movers, dispatcher, &mut log)?;
    }
    let elapsed = start.elapsed();

    let checksum: f64 = world
        .store::<Position>()?
        .values()
        .iter()
        .map(|p| f64::from(p.x) + f64::from(p.y))
        .sum();
    info!(
        mode = label,
        workers = dispatcher.worker_count(),
        ticks = TICKS,
        entities = world.entity_count(),
        recycled,
        elapsed_ms = elapsed.as_millis() as u64,
        checksum,
        "run finished"
    );
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    run("sequential", &ParallelDispatcher::sequential())?;
    run("parallel", &ParallelDispatcher::from_config(&RunnerConfig::default())?)?;
    Ok(())
}
