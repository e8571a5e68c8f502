//! Property tests for command-log replay.
//!
//! The same operation sequence is applied once through direct world calls and
//! once recorded into a [`CommandLog`] and replayed. Both worlds must end in
//! the same state.

use kestrel_ecs::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Health(u32);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Label(String);

#[derive(Debug, Clone)]
enum CmdOp {
    Create,
    Destroy(usize),
    SetHealth(usize, u32),
    /// Reuse the payload of the last `SetHealth` on another entity.
    SetSameHealth(usize),
    SetLabel(usize, u8),
    RemoveHealth(usize),
    RemoveLabel(usize),
}

fn cmd_op_strategy() -> impl Strategy<Value = CmdOp> {
    prop_oneof![
        2 => Just(CmdOp::Create),
        1 => (0..32usize).prop_map(CmdOp::Destroy),
        3 => (0..32usize, any::<u32>()).prop_map(|(i, v)| CmdOp::SetHealth(i, v)),
        1 => (0..32usize).prop_map(CmdOp::SetSameHealth),
        1 => (0..32usize, any::<u8>()).prop_map(|(i, v)| CmdOp::SetLabel(i, v)),
        1 => (0..32usize).prop_map(CmdOp::RemoveHealth),
        1 => (0..32usize).prop_map(CmdOp::RemoveLabel),
    ]
}

fn setup_world(initial: usize) -> (World, Vec<EntityId>) {
    let mut world = World::new();
    world.register_pod_component::<Health>("health").unwrap();
    world.register_component::<Label>("label").unwrap();
    let entities = (0..initial).map(|_| world.create_entity().unwrap()).collect();
    (world, entities)
}

/// Apply `ops` directly; failures on stale handles are skipped like replay does.
fn apply_direct(world: &mut World, initial: &[EntityId], ops: &[CmdOp]) {
    let mut logical: Vec<EntityId> = initial.to_vec();
    let mut last_health: Option<u32> = None;
    for op in ops {
        let pick = |i: usize| logical[i % logical.len()];
        match *op {
            CmdOp::Create => logical.push(world.create_entity().unwrap()),
            _ if logical.is_empty() => {}
            CmdOp::Destroy(i) => {
                let _ = world.destroy_entity(pick(i));
            }
            CmdOp::SetHealth(i, v) => {
                let _ = world.set_component(pick(i), Health(v));
                last_health = Some(v);
            }
            CmdOp::SetSameHealth(i) => {
                if let Some(v) = last_health {
                    let _ = world.set_component(pick(i), Health(v));
                }
            }
            CmdOp::SetLabel(i, v) => {
                let _ = world.set_component(pick(i), Label(format!("label-{v}")));
            }
            CmdOp::RemoveHealth(i) => {
                let _ = world.remove_component::<Health>(pick(i));
            }
            CmdOp::RemoveLabel(i) => {
                let _ = world.remove_component::<Label>(pick(i));
            }
        }
    }
}

/// Record `ops` into `log` without touching `world`.
fn record(world: &World, initial: &[EntityId], ops: &[CmdOp], log: &mut CommandLog) {
    let registry = world.registry();
    let segment = log.main();
    let mut logical: Vec<EntityRecord> = initial.iter().map(|&e| segment.record(e)).collect();
    let mut last_health: Option<PayloadRef<Health>> = None;
    for op in ops {
        let pick = |i: usize| logical[i % logical.len()];
        match *op {
            CmdOp::Create => logical.push(segment.create_entity()),
            _ if logical.is_empty() => {}
            CmdOp::Destroy(i) => segment.destroy(pick(i)).unwrap(),
            CmdOp::SetHealth(i, v) => {
                last_health = Some(segment.set(registry, pick(i), Health(v)).unwrap());
            }
            CmdOp::SetSameHealth(i) => {
                if let Some(payload) = last_health {
                    segment.set_same_as(registry, pick(i), payload).unwrap();
                }
            }
            CmdOp::SetLabel(i, v) => segment
                .set_boxed(registry, pick(i), Label(format!("label-{v}")))
                .unwrap(),
            CmdOp::RemoveHealth(i) => segment.remove::<Health>(registry, pick(i)).unwrap(),
            CmdOp::RemoveLabel(i) => segment.remove::<Label>(registry, pick(i)).unwrap(),
        }
    }
}

fn snapshot(world: &World) -> (usize, Vec<(EntityId, u32)>, Vec<(EntityId, String)>) {
    let mut health: Vec<(EntityId, u32)> = world
        .store::<Health>()
        .unwrap()
        .iter()
        .map(|(e, h)| (e, h.0))
        .collect();
    health.sort();
    let mut labels: Vec<(EntityId, String)> = world
        .store::<Label>()
        .unwrap()
        .iter()
        .map(|(e, l)| (e, l.0.clone()))
        .collect();
    labels.sort();
    (world.entity_count(), health, labels)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1_000))]

    #[test]
    fn replay_matches_direct_application(
        initial in 0..6usize,
        ops in prop::collection::vec(cmd_op_strategy(), 1..40),
    ) {
        let (mut direct, direct_initial) = setup_world(initial);
        apply_direct(&mut direct, &direct_initial, &ops);

        let (mut replayed, replay_initial) = setup_world(initial);
        let mut log = CommandLog::new();
        record(&replayed, &replay_initial, &ops, &mut log);
        let recorded = log.len();
        let report = log.replay(&mut replayed).unwrap();

        prop_assert_eq!(snapshot(&direct), snapshot(&replayed));
        prop_assert_eq!(report.applied + report.failed, recorded);
        prop_assert!(log.is_empty());
    }

    #[test]
    fn create_then_set_spawns_exactly_one_entity(value in any::<u32>(), extra in 0..4usize) {
        let (mut world, _) = setup_world(extra);
        let q = world.query(QueryDesc::new().with::<Health>()).unwrap();
        let mut log = CommandLog::new();
        let segment = log.main();
        let rec = segment.create_entity();
        segment.set(world.registry(), rec, Health(value)).unwrap();
        let report = log.replay(&mut world).unwrap();

        prop_assert_eq!(report.created, 1);
        prop_assert_eq!(world.entity_count(), extra + 1);
        prop_assert_eq!(world.query_len(q), 1);
        let spawned = world.view(q)[0];
        prop_assert_eq!(world.get_component::<Health>(spawned).unwrap(), &Health(value));
    }

    #[test]
    fn replay_is_deterministic(ops in prop::collection::vec(cmd_op_strategy(), 1..30)) {
        let run = |ops: &[CmdOp]| {
            let (mut world, initial) = setup_world(3);
            let mut log = CommandLog::new();
            record(&world, &initial, ops, &mut log);
            let report = log.replay(&mut world).unwrap();
            (report, snapshot(&world))
        };
        prop_assert_eq!(run(&ops), run(&ops));
    }
}
