//! Round-trip, determinism, and boundary coverage across all four
//! strategies, driven by seeded snapshot sequences.

use rand::{RngExt, SeedableRng, rngs::StdRng};
use statediff::{
    DedupMode, Deduplicator, DiffHeader, TreeDeduplicator, TreePolicy, deduplicator_for,
};

/// Build a snapshot sequence: each snapshot mutates a few random chunks
/// and copies one chunk span to another offset, so both temporal and
/// spatial redundancy show up.
fn snapshot_sequence(
    seed: u64,
    len: usize,
    chunk_size: usize,
    count: usize,
) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut current = vec![0u8; len];
    rng.fill(&mut current[..]);
    let mut snapshots = vec![current.clone()];
    for _ in 1..count {
        let chunks = len.div_ceil(chunk_size).max(1);
        for _ in 0..3 {
            let chunk = rng.random_range(0..chunks);
            let lo = chunk * chunk_size;
            let hi = len.min(lo + chunk_size);
            rng.fill(&mut current[lo..hi]);
        }
        if chunks > 1 {
            let src = rng.random_range(0..chunks);
            let dst = rng.random_range(0..chunks);
            let bytes = current[src * chunk_size..len.min((src + 1) * chunk_size)].to_vec();
            let dst_lo = dst * chunk_size;
            let dst_hi = len.min(dst_lo + bytes.len());
            current[dst_lo..dst_hi].copy_from_slice(&bytes[..dst_hi - dst_lo]);
        }
        snapshots.push(current.clone());
    }
    snapshots
}

fn checkpoint_all(
    dedup: &mut dyn Deduplicator,
    snapshots: &[Vec<u8>],
) -> Vec<Vec<u8>> {
    snapshots
        .iter()
        .enumerate()
        .map(|(i, snap)| {
            let (diff, stats) = dedup.checkpoint(snap, i == 0).expect("checkpoint");
            assert_eq!(stats.diff_bytes(), diff.len() as u64);
            diff
        })
        .collect()
}

fn assert_all_targets_restore(
    dedup: &dyn Deduplicator,
    diffs: &[Vec<u8>],
    snapshots: &[Vec<u8>],
) {
    for (j, snap) in snapshots.iter().enumerate() {
        let restored = dedup.restart(diffs, j as u32).expect("restart");
        assert_eq!(&restored, snap, "target {j}");
    }
}

#[test]
fn test_random_sequences_roundtrip_every_mode() {
    for mode in [
        DedupMode::Full,
        DedupMode::Basic,
        DedupMode::List,
        DedupMode::Tree,
    ] {
        for seed in 0..3u64 {
            let snapshots = snapshot_sequence(seed, 8 * 64, 64, 5);
            let mut dedup = deduplicator_for(mode, 64).expect("dedup");
            let diffs = checkpoint_all(dedup.as_mut(), &snapshots);
            assert_all_targets_restore(dedup.as_ref(), &diffs, &snapshots);
        }
    }
}

#[test]
fn test_partial_tree_roundtrip() {
    // A prime region length: the chunk count is odd, the bottom tree
    // level is partial, and the tail chunk is short.
    for mode in [DedupMode::Basic, DedupMode::List, DedupMode::Tree] {
        let snapshots = snapshot_sequence(11, 97, 16, 4);
        let mut dedup = deduplicator_for(mode, 16).expect("dedup");
        let diffs = checkpoint_all(dedup.as_mut(), &snapshots);
        assert_all_targets_restore(dedup.as_ref(), &diffs, &snapshots);
    }
}

#[test]
fn test_low_root_policy_roundtrip() {
    let snapshots = snapshot_sequence(5, 32 * 32, 32, 5);
    let mut dedup = TreeDeduplicator::with_policy(32, TreePolicy::LowRoot).expect("dedup");
    let diffs = checkpoint_all(&mut dedup, &snapshots);
    assert_all_targets_restore(&dedup, &diffs, &snapshots);
}

#[test]
fn test_diffs_are_deterministic() {
    let snapshots = snapshot_sequence(9, 16 * 32, 32, 4);
    for policy in [TreePolicy::LowOffset, TreePolicy::LowRoot] {
        let mut a = TreeDeduplicator::with_policy(32, policy).expect("dedup");
        let mut b = TreeDeduplicator::with_policy(32, policy).expect("dedup");
        let diffs_a = checkpoint_all(&mut a, &snapshots);
        let diffs_b = checkpoint_all(&mut b, &snapshots);
        assert_eq!(diffs_a, diffs_b);
    }
    let mut a = deduplicator_for(DedupMode::List, 32).expect("dedup");
    let mut b = deduplicator_for(DedupMode::List, 32).expect("dedup");
    assert_eq!(
        checkpoint_all(a.as_mut(), &snapshots),
        checkpoint_all(b.as_mut(), &snapshots)
    );
}

/// No emitted node of a tree diff is an ancestor of another.
#[test]
fn test_emitted_nodes_form_an_antichain() {
    let snapshots = snapshot_sequence(13, 16 * 16, 16, 4);
    let mut dedup = TreeDeduplicator::new(16).expect("dedup");
    let diffs = checkpoint_all(&mut dedup, &snapshots);
    for diff in &diffs {
        let header = DiffHeader::decode(diff).expect("header");
        let u32_at = |offset: usize| {
            u32::from_le_bytes(diff[offset..offset + 4].try_into().expect("in bounds"))
        };
        let mut nodes: Vec<u32> = (0..header.distinct_size as usize)
            .map(|k| u32_at(header.distinct_offset() + 4 * k))
            .collect();
        nodes.extend(
            (0..header.num_repeats() as usize).map(|k| u32_at(header.repeats_offset() + 8 * k)),
        );
        let emitted: std::collections::HashSet<u32> = nodes.iter().copied().collect();
        assert_eq!(emitted.len(), nodes.len(), "duplicate emitted node");
        for &node in &nodes {
            let mut n = node;
            while n > 0 {
                n = (n - 1) / 2;
                assert!(
                    !emitted.contains(&n),
                    "node {n} is an ancestor of emitted node {node}"
                );
            }
        }
    }
}

#[test]
fn test_unique_baseline_emits_single_root() {
    // Every chunk distinct: the whole tree is one first-occurrence
    // region rooted at node 0.
    let data: Vec<u8> = (0u32..256).flat_map(|i| i.to_le_bytes()).collect();
    let mut dedup = TreeDeduplicator::new(64).expect("dedup");
    let (d0, stats) = dedup.checkpoint(&data, true).expect("checkpoint");
    let header = DiffHeader::decode(&d0).expect("header");
    assert_eq!(header.distinct_size, 1);
    assert_eq!(header.num_repeats(), 0);
    assert_eq!(stats.data_bytes, data.len() as u64);
    assert_eq!(dedup.restart(&[d0], 0).expect("restart"), data);
}

#[test]
fn test_empty_region() {
    for mode in [
        DedupMode::Full,
        DedupMode::Basic,
        DedupMode::List,
        DedupMode::Tree,
    ] {
        let mut dedup = deduplicator_for(mode, 16).expect("dedup");
        let (d0, _) = dedup.checkpoint(b"", true).expect("checkpoint");
        let (d1, _) = dedup.checkpoint(b"", false).expect("checkpoint");
        let restored = dedup.restart(&[d0, d1], 1).expect("restart");
        assert!(restored.is_empty(), "{mode}");
    }
}

#[test]
fn test_region_smaller_than_chunk() {
    for mode in [
        DedupMode::Full,
        DedupMode::Basic,
        DedupMode::List,
        DedupMode::Tree,
    ] {
        let mut dedup = deduplicator_for(mode, 4096).expect("dedup");
        let snapshots: Vec<Vec<u8>> = vec![b"tiny".to_vec(), b"tiny".to_vec(), b"TINY".to_vec()];
        let diffs = checkpoint_all(dedup.as_mut(), &snapshots);
        assert_all_targets_restore(dedup.as_ref(), &diffs, &snapshots);
    }
}

#[test]
fn test_basic_mode_cannot_exploit_spatial_redundancy() {
    let mut dedup = deduplicator_for(DedupMode::Basic, 4).expect("dedup");
    dedup.checkpoint(b"XXXXYYYY", true).expect("checkpoint");
    let (d1, stats) = dedup.checkpoint(b"YYYYXXXX", false).expect("checkpoint");
    // Both chunks changed at their offsets, so both are stored again.
    assert_eq!(stats.distinct_entries, 2);
    assert_eq!(stats.data_bytes, 8);
    let header = DiffHeader::decode(&d1).expect("header");
    assert_eq!(header.window_size, 0);
}

#[test]
fn test_list_mode_exploits_spatial_redundancy() {
    let mut dedup = deduplicator_for(DedupMode::List, 4).expect("dedup");
    let (d0, _) = dedup.checkpoint(b"XXXXYYYY", true).expect("checkpoint");
    let (d1, stats) = dedup.checkpoint(b"YYYYXXXX", false).expect("checkpoint");
    // Both chunks are repeats of the baseline's chunks; no payload.
    assert_eq!(stats.distinct_entries, 0);
    assert_eq!(stats.repeat_entries, 2);
    assert_eq!(stats.data_bytes, 0);
    let restored = dedup.restart(&[d0, d1], 1).expect("restart");
    assert_eq!(restored, b"YYYYXXXX");
}

#[test]
fn test_checkpoint_to_files_and_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let snapshots = snapshot_sequence(21, 12 * 32, 32, 4);
    let mut dedup = TreeDeduplicator::new(32).expect("dedup");
    let paths: Vec<std::path::PathBuf> = snapshots
        .iter()
        .enumerate()
        .map(|(i, snap)| {
            let path = dir.path().join(format!("chkpt.{i}.diff"));
            dedup
                .checkpoint_to_file(snap, &path, i == 0)
                .expect("checkpoint to file");
            path
        })
        .collect();
    for (j, snap) in snapshots.iter().enumerate() {
        let restored = dedup
            .restart_from_files(&paths, j as u32)
            .expect("restart from files");
        assert_eq!(&restored, snap, "target {j}");
    }
}

#[test]
fn test_full_mode_diff_is_header_plus_region() {
    let mut dedup = deduplicator_for(DedupMode::Full, 16).expect("dedup");
    let data = b"0123456789abcdef0123";
    let (d0, stats) = dedup.checkpoint(data, true).expect("checkpoint");
    let header = DiffHeader::decode(&d0).expect("header");
    assert!(header.is_baseline());
    assert_eq!(stats.data_bytes, data.len() as u64);
    assert_eq!(&d0[header.payload_offset()..], data);
}
