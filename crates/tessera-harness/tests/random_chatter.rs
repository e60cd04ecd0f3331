//! Randomized conversations: whoever talks, in whatever rhythm, a connected
//! group ends up with the same transcript and nothing unacknowledged.

use std::time::Duration;

use proptest::prelude::*;
use tessera_harness::{
    World, WorldConfig,
    oracle::{all_consistent, all_of, payloads_delivered, sub_sessions_agree, transcripts_converged},
};

const NAMES: [&str; 3] = ["alice", "bob", "carol"];

fn formed(seed: u64) -> World {
    let mut world = World::new(WorldConfig { seed, ..WorldConfig::default() });
    for name in NAMES {
        world.add_member(name);
    }
    world.enter_channel(NAMES[0]);
    world.run_for(Duration::from_millis(100));
    for name in &NAMES[1..] {
        world.enter_channel(name);
    }
    world.run_for(Duration::from_millis(100));
    world.change_membership(NAMES[0], &NAMES[1..], &[]).unwrap();
    world.run_for(Duration::from_secs(2));
    world
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_chatter_converges(
        seed in any::<u64>(),
        turns in prop::collection::vec((0..NAMES.len(), 0u64..250), 1..12),
    ) {
        let mut world = formed(seed);

        for (index, (speaker, pause)) in turns.iter().enumerate() {
            world.send(NAMES[*speaker], format!("turn {index}").as_bytes()).unwrap();
            world.run_for(Duration::from_millis(*pause));
        }
        world.run_for(Duration::from_secs(3));

        for name in NAMES {
            prop_assert_eq!(world.payloads(name).len(), turns.len(), "{}", name);
        }
        let oracle = all_of(vec![
            sub_sessions_agree(),
            transcripts_converged(),
            payloads_delivered(),
            all_consistent(),
        ]);
        prop_assert_eq!(oracle(&world), Ok(()));
    }
}
