//! Property tests for parallel dispatch.

use std::sync::{Mutex, OnceLock};

use kestrel_ecs::dispatch::partition;
use kestrel_ecs::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Counter(u32);

#[derive(Debug, Clone, PartialEq)]
struct Marker;

fn shared_pool() -> &'static ParallelDispatcher {
    static POOL: OnceLock<ParallelDispatcher> = OnceLock::new();
    POOL.get_or_init(|| {
        ParallelDispatcher::from_config(&RunnerConfig {
            worker_count: Some(4),
        })
        .unwrap()
    })
}

/// Build a world with `n` counters, marking the entities whose flag is set.
fn world_with(flags: &[bool]) -> (World, QueryId) {
    let mut world = World::new();
    world.register_pod_component::<Counter>("counter").unwrap();
    for &marked in flags {
        let e = world.create_entity().unwrap();
        world.set_component(e, Counter(0)).unwrap();
        if marked {
            world.set_component(e, Marker).unwrap();
        }
    }
    let q = world.query(QueryDesc::new().with::<Marker>()).unwrap();
    (world, q)
}

#[test]
fn partition_covers_range_exactly_once() {
    for len in 0..2000 {
        for workers in 1..64 {
            let ranges: Vec<_> = partition(len, workers).collect();
            assert_eq!(ranges.len(), workers);
            let mut next = 0;
            for (i, range) in ranges.iter().enumerate() {
                assert_eq!(range.start, next, "gap before chunk {i} ({len}/{workers})");
                if i + 1 < workers {
                    assert_eq!(range.len(), len / workers);
                }
                next = range.end;
            }
            assert_eq!(next, len);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn dispatch_visits_every_matched_entity_once(flags in prop::collection::vec(any::<bool>(), 0..600)) {
        let (world, q) = world_with(&flags);
        let seen = Mutex::new(Vec::new());
        shared_pool().dispatch(world.view(q), |chunk| {
            seen.lock().unwrap().extend_from_slice(chunk);
        });
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        let mut expected = world.view(q).to_vec();
        expected.sort();
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn dispatch_mut_touches_only_matched_values(flags in prop::collection::vec(any::<bool>(), 0..600)) {
        let (mut world, q) = world_with(&flags);
        let (counters, rest) = world.split_store_mut::<Counter>().unwrap();
        shared_pool().dispatch_mut(rest.view(q), counters, |mut chunk| {
            chunk.for_each_mut(|_, counter| counter.0 += 1);
        });

        let counters = world.store::<Counter>().unwrap();
        for (entity, counter) in counters.iter() {
            let expected = u32::from(world.has_component::<Marker>(entity));
            prop_assert_eq!(counter.0, expected);
        }
    }

    #[test]
    fn parallel_and_sequential_commands_agree(flags in prop::collection::vec(any::<bool>(), 0..300)) {
        let run = |dispatcher: &ParallelDispatcher| {
            let (mut world, q) = world_with(&flags);
            let mut log = CommandLog::new();
            let registry = world.registry();
            dispatcher.dispatch_with_commands(world.view(q), &mut log, |chunk, segment| {
                for &entity in chunk {
                    let rec = segment.record(entity);
                    segment.remove::<Marker>(registry, rec).unwrap();
                    let spawned = segment.create_entity();
                    segment.set(registry, spawned, Counter(entity.index())).unwrap();
                }
            });
            let report = log.replay(&mut world).unwrap();
            let mut spawned: Vec<u32> = world
                .store::<Counter>()
                .unwrap()
                .iter()
                .map(|(_, c)| c.0)
                .collect();
            spawned.sort();
            (report.created, report.failed, world.query_len(q), spawned)
        };

        let marked = flags.iter().filter(|&&f| f).count();
        let sequential = run(&ParallelDispatcher::sequential());
        prop_assert_eq!(sequential.0, marked);
        prop_assert_eq!(sequential.1, 0);
        prop_assert_eq!(sequential.2, 0);
        prop_assert_eq!(sequential, run(shared_pool()));
    }
}
