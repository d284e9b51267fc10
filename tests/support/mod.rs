use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shardkit_rs::test_support::Fixture;
use shardkit_rs::IDS_PER_SHARD;

/// Two servers, three shards, shard 10 as default.
#[allow(dead_code)]
pub fn two_server_fixture() -> Fixture {
    Fixture::new(&[("db1", &[10, 20]), ("db2", &[30])], Some(10))
}

/// Three servers with uneven shard counts, shard 1 as default.
#[allow(dead_code)]
pub fn three_server_fixture() -> Fixture {
    Fixture::new(&[("db1", &[1, 2]), ("db2", &[3]), ("db3", &[4, 5])], Some(1))
}

/// Local ids spread across the whole local range, both signs.
#[allow(dead_code)]
pub fn random_local_ids(seed: u64, count: usize) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ids: Vec<i64> = (0..count)
        .map(|_| rng.random_range(-(IDS_PER_SHARD - 1)..IDS_PER_SHARD))
        .collect();
    ids.extend([0, 1, -1, IDS_PER_SHARD - 1, -(IDS_PER_SHARD - 1)]);
    ids
}
