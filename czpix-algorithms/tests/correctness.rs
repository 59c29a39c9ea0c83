#![allow(clippy::uninlined_format_args)]
use approx::assert_relative_eq;
use czpix_algorithms::{FloodFillClustering, FloodFillConfig};
use czpix_core::calibration::{uniform_record, Calibration};
use czpix_core::{FrameBuffer, FramesMut, PixelGrid};
use std::collections::HashSet;

const N_COLS: usize = 8;
const N_PIXELS: usize = 64;

fn calibration(slope: f32, offset: f32) -> Calibration {
    Calibration::from_record(uniform_record(N_PIXELS, slope, offset, 10.0), None, N_PIXELS, 10.0)
        .unwrap()
}

fn engine(extended_mode: bool, n_threads: usize) -> FloodFillClustering {
    FloodFillClustering::new(
        PixelGrid::new(N_COLS, N_PIXELS),
        FloodFillConfig { extended_mode },
        n_threads,
    )
    .unwrap()
}

/// Deterministic pseudo-random frame with sparse hot spots.
fn noisy_frame(seed: u64) -> Vec<u16> {
    let mut x = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (0..N_PIXELS)
        .map(|_| {
            x = x
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let r = (x >> 33) % 100;
            match r {
                0..=69 => (r % 10) as u16,
                70..=89 => 10 + (r % 8) as u16,
                _ => 20 + r as u16,
            }
        })
        .collect()
}

#[test]
fn test_single_hot_pixel_yields_one_cluster() {
    let grid = PixelGrid::new(4, 16);
    let engine = FloodFillClustering::new(grid, FloodFillConfig::default(), 1).unwrap();
    let calibration =
        Calibration::from_record(uniform_record(16, 0.5, 1.0, 10.0), None, 16, 2.0).unwrap();

    let mut frame = vec![3u16; 16];
    frame[9] = 40;
    let mut state = engine.create_state();
    let clusters = engine.cluster_frame(&frame, &calibration, 77, &mut state);

    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].frame_id, 77);
    assert_eq!(clusters[0].pixel_ids, vec![9]);
    assert_eq!(clusters[0].adus, vec![40]);
    assert_relative_eq!(clusters[0].energies[0], 21.0);
}

#[test]
fn test_single_hot_pixel_extended_takes_full_ring() {
    let grid = PixelGrid::new(4, 16);
    let engine =
        FloodFillClustering::new(grid, FloodFillConfig { extended_mode: true }, 1).unwrap();
    let calibration =
        Calibration::from_record(uniform_record(16, 1.0, 0.0, 10.0), None, 16, 2.0).unwrap();

    let mut frame = vec![0u16; 16];
    frame[5] = 40;
    let mut state = engine.create_state();
    let clusters = engine.cluster_frame(&frame, &calibration, 0, &mut state);

    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].pixel_ids[0], 5);
    let ids: HashSet<u32> = clusters[0].pixel_ids.iter().copied().collect();
    assert_eq!(ids, HashSet::from([0, 1, 2, 4, 5, 6, 8, 9, 10]));
}

#[test]
fn test_extended_rings_may_overlap_diagonal_neighbours() {
    let grid = PixelGrid::new(4, 16);
    let calibration =
        Calibration::from_record(uniform_record(16, 1.0, 0.0, 10.0), None, 16, 2.0).unwrap();
    let mut frame = vec![0u16; 16];
    frame[0] = 40;
    frame[5] = 40;

    let core = FloodFillClustering::new(grid, FloodFillConfig::default(), 1).unwrap();
    let mut state = core.create_state();
    let cores = core.cluster_frame(&frame, &calibration, 0, &mut state);
    assert_eq!(cores.len(), 2);
    assert_eq!(cores[0].pixel_ids, vec![0]);
    assert_eq!(cores[1].pixel_ids, vec![5]);

    let extended =
        FloodFillClustering::new(grid, FloodFillConfig { extended_mode: true }, 1).unwrap();
    let mut state = extended.create_state();
    let clusters = extended.cluster_frame(&frame, &calibration, 0, &mut state);
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0].pixel_ids, vec![0, 1, 4, 5]);
    assert_eq!(clusters[1].pixel_ids, vec![5, 4, 6, 1, 9, 0, 2, 8, 10]);

    // each seed also sits in the other cluster's ring
    let first: HashSet<u32> = clusters[0].pixel_ids.iter().copied().collect();
    let second: HashSet<u32> = clusters[1].pixel_ids.iter().copied().collect();
    let shared: HashSet<u32> = first.intersection(&second).copied().collect();
    assert_eq!(shared, HashSet::from([0, 1, 4, 5]));
}

#[test]
fn test_no_wraparound_across_rows() {
    let engine = engine(false, 1);
    let mut frame = vec![0u16; N_PIXELS];
    frame[N_COLS - 1] = 50;
    frame[N_COLS] = 50;
    let mut state = engine.create_state();
    let clusters = engine.cluster_frame(&frame, &calibration(1.0, 0.0), 0, &mut state);
    assert_eq!(clusters.len(), 2, "row-edge pixels must not be adjacent");
}

#[test]
fn test_pre_marked_pixels_never_join() {
    let engine = engine(false, 1);
    let mut frame = vec![0u16; N_PIXELS];
    frame[10] = 50;
    // below primary: pre-marked, must not join even though adjacent
    frame[11] = 9;
    // beyond the sub-threshold pixel, above primary but not connected
    frame[12] = 50;
    let mut state = engine.create_state();
    let clusters = engine.cluster_frame(&frame, &calibration(1.0, 0.0), 0, &mut state);
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0].pixel_ids, vec![10]);
    assert_eq!(clusters[1].pixel_ids, vec![12]);
}

#[test]
fn test_invalid_pixels_never_join() {
    let engine = engine(false, 1);
    let mut record = uniform_record(N_PIXELS, 1.0, 0.0, 10.0);
    let mut flags = vec![1u8; N_PIXELS];
    flags[11] = 0;
    record.pixels_isvalids = Some(flags);
    let calibration = Calibration::from_record(record, None, N_PIXELS, 10.0).unwrap();

    let mut frame = vec![0u16; N_PIXELS];
    frame[10] = 50;
    frame[11] = 500;
    let mut state = engine.create_state();
    let clusters = engine.cluster_frame(&frame, &calibration, 0, &mut state);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].pixel_ids, vec![10]);
}

#[test]
fn test_region_below_secondary_is_rejected() {
    let engine = engine(false, 1);
    let mut frame = vec![0u16; N_PIXELS];
    // primary 10, secondary 20: a region of 15s is grown but not admitted
    frame[20] = 15;
    frame[21] = 15;
    frame[40] = 25;
    let mut state = engine.create_state();
    let clusters = engine.cluster_frame(&frame, &calibration(1.0, 0.0), 0, &mut state);

    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].pixel_ids, vec![40]);
    let stats = state.statistics();
    assert_eq!(stats.regions_found, 2);
    assert_eq!(stats.regions_rejected, 1);
}

#[test]
fn test_all_zero_frame_yields_nothing() {
    let engine = engine(true, 1);
    let frame = vec![0u16; N_PIXELS];
    let mut state = engine.create_state();
    assert!(engine
        .cluster_frame(&frame, &calibration(1.0, 0.0), 0, &mut state)
        .is_empty());
}

#[test]
fn test_cluster_properties_on_noisy_frames() {
    let calibration = calibration(0.8, -12.0);
    let plain = engine(false, 1);
    let extended = engine(true, 1);

    for seed in 0..50 {
        let frame = noisy_frame(seed);
        let mut state = plain.create_state();
        let clusters = plain.cluster_frame(&frame, &calibration, 0, &mut state);

        let mut seen = HashSet::new();
        for cluster in &clusters {
            for &pixel in &cluster.pixel_ids {
                assert!(seen.insert(pixel), "pixel {} in two clusters", pixel);
            }
            assert!(cluster
                .iter()
                .any(|(p, adu, _)| calibration.passes_secondary(p as usize, adu)));
            assert!(cluster.energies.iter().all(|&e| e >= 0.0));
        }

        let mut state = extended.create_state();
        let dilated = extended.cluster_frame(&frame, &calibration, 0, &mut state);
        assert_eq!(dilated.len(), clusters.len());
        for (core, ring) in clusters.iter().zip(&dilated) {
            assert_eq!(&ring.pixel_ids[..core.len()], &core.pixel_ids[..]);
            let unique: HashSet<_> = ring.pixel_ids.iter().collect();
            assert_eq!(unique.len(), ring.len());
            assert!(ring.energies.iter().all(|&e| e >= 0.0));
        }
    }
}

#[test]
fn test_chunk_matches_sequential_order() {
    let n_frames = 37;
    let mut buffer = FrameBuffer::new(1, 40, N_PIXELS);
    {
        let mut parts = buffer.split_for_workers(&[0..n_frames]).unwrap();
        let part: &mut FramesMut<'_> = &mut parts[0];
        for slot in 0..n_frames {
            part.frame_mut(0, slot)
                .copy_from_slice(&noisy_frame(slot as u64));
        }
    }
    let calibration = calibration(1.0, 0.0);

    let sequential = engine(false, 1);
    let mut state = sequential.create_state();
    let mut expected = Vec::new();
    for slot in 0..n_frames {
        expected.extend(sequential.cluster_frame(
            buffer.frame(0, slot),
            &calibration,
            1000 + slot as u32,
            &mut state,
        ));
    }

    let parallel = engine(false, 4);
    let result = parallel
        .cluster_chunk(buffer.crystal_frames(0), n_frames, &calibration, 1000)
        .unwrap();

    assert_eq!(result.clusters, expected);
    assert_eq!(result.statistics.frames_processed, n_frames);
    assert_eq!(result.statistics.clusters_emitted, expected.len());
    assert!(result
        .clusters
        .windows(2)
        .all(|w| w[0].frame_id <= w[1].frame_id));
}

#[test]
fn test_chunk_rejects_bad_ranges() {
    let buffer = FrameBuffer::new(1, 4, N_PIXELS);
    let engine = engine(false, 2);
    let calibration = calibration(1.0, 0.0);
    assert!(engine
        .cluster_chunk(buffer.crystal_frames(0), 5, &calibration, 0)
        .is_err());
    assert!(engine
        .cluster_chunk(buffer.crystal_frames(0), 2, &calibration, u32::MAX)
        .is_err());

    let small = Calibration::from_record(uniform_record(16, 1.0, 0.0, 1.0), None, 16, 1.0).unwrap();
    assert!(engine
        .cluster_chunk(buffer.crystal_frames(0), 1, &small, 0)
        .is_err());
}
