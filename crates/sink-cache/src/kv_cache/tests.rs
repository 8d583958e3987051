use super::{
    BoundedKeyValueCache, CacheState, EvictedSegment, EvictionLog, EvictionReason,
    LayoutDescriptor,
};
use crate::core::{CacheError, CacheWarning, StreamingConfig};
use candle_core::{Device, Tensor};
use static_assertions::{assert_impl_all, assert_not_impl_any};
use std::sync::{Arc, Mutex};

const HEADS: usize = 2;
const HEAD_DIM: usize = 3;

/// Tensor whose slot `i` along `seq_dim` is filled with `ids[i]`.
///
/// `seq_dim` 1 builds `[1, n, HEAD_DIM]`; 2 builds `[1, HEADS, n, HEAD_DIM]`;
/// 3 builds `[1, HEADS, HEAD_DIM, n]`.
fn tokens(ids: &[usize], seq_dim: usize) -> Tensor {
    let n = ids.len();
    let data: Vec<f32> = ids.iter().map(|&i| i as f32).collect();
    let flat = Tensor::from_vec(data, n, &Device::Cpu).unwrap();
    match seq_dim {
        1 => flat
            .reshape((1, n, 1))
            .unwrap()
            .broadcast_as((1, n, HEAD_DIM))
            .unwrap()
            .contiguous()
            .unwrap(),
        2 => flat
            .reshape((1, 1, n, 1))
            .unwrap()
            .broadcast_as((1, HEADS, n, HEAD_DIM))
            .unwrap()
            .contiguous()
            .unwrap(),
        3 => flat
            .reshape((1, 1, 1, n))
            .unwrap()
            .broadcast_as((1, HEADS, HEAD_DIM, n))
            .unwrap()
            .contiguous()
            .unwrap(),
        other => panic!("unsupported test seq_dim {other}"),
    }
}

/// Read back the ids stored along `seq_dim`.
fn ids(t: &Tensor, seq_dim: usize) -> Vec<usize> {
    let last = t.rank() - 1;
    let moved = if seq_dim == last {
        t.clone()
    } else {
        t.transpose(seq_dim, last).unwrap().contiguous().unwrap()
    };
    let n = moved.dim(last).unwrap();
    moved.flatten_all().unwrap().to_vec1::<f32>().unwrap()[..n]
        .iter()
        .map(|&v| v as usize)
        .collect()
}

fn config(start: usize, recent: usize, layout: LayoutDescriptor) -> StreamingConfig {
    StreamingConfig::new(start, recent, layout).unwrap()
}

fn push(cache: &mut CacheState, new_ids: &[usize]) {
    let (kd, vd) = (cache.config().key_seq_dim(), cache.config().value_seq_dim());
    for layer in 0..cache.num_layers() {
        cache
            .append(layer, &tokens(new_ids, kd), &tokens(new_ids, vd))
            .unwrap();
    }
}

fn layer_ids(cache: &CacheState, layer: usize) -> (Vec<usize>, Vec<usize>) {
    let cfg = cache.config();
    let entry = cache.layer(layer).expect("layer populated");
    (
        ids(&entry.key, cfg.key_seq_dim()),
        ids(&entry.value, cfg.value_seq_dim()),
    )
}

fn assert_all_layers(cache: &CacheState, expected: &[usize]) {
    for layer in 0..cache.num_layers() {
        let (k, v) = layer_ids(cache, layer);
        assert_eq!(k, expected, "layer {layer} keys");
        assert_eq!(v, expected, "layer {layer} values");
    }
}

fn filled(start: usize, recent: usize, layers: usize, len: usize) -> CacheState {
    let config = config(start, recent, LayoutDescriptor::Standard);
    let mut cache = CacheState::new(config, layers).unwrap();
    let all: Vec<usize> = (0..len).collect();
    push(&mut cache, &all);
    cache
}

#[test]
fn streaming_one_token_at_a_time_keeps_sinks_and_tail() {
    let mut cache = CacheState::new(config(4, 6, LayoutDescriptor::Standard), 2).unwrap();
    for token in 0..20 {
        cache.evict_for_space(1).unwrap();
        push(&mut cache, &[token]);
        assert!(cache.seq_len().unwrap() <= cache.cache_size());
    }
    assert_eq!(cache.seq_len().unwrap(), 10);
    assert_all_layers(&cache, &[0, 1, 2, 3, 14, 15, 16, 17, 18, 19]);
}

#[test]
fn trim_after_each_append_matches_evict_for_space() {
    let mut cache = CacheState::new(config(4, 6, LayoutDescriptor::Standard), 2).unwrap();
    for token in 0..20 {
        push(&mut cache, &[token]);
        cache.trim().unwrap();
    }
    assert_all_layers(&cache, &[0, 1, 2, 3, 14, 15, 16, 17, 18, 19]);
    let stats = cache.stats();
    assert_eq!(stats.trims, 10);
    assert_eq!(stats.tokens_evicted, 10);
}

#[test]
fn evict_for_space_keeps_sinks_and_newest_window_entry() {
    let mut cache = filled(4, 6, 2, 10);
    let outcome = cache.evict_for_space(5).unwrap();
    assert_eq!(outcome.removed, 5);
    assert_eq!(outcome.retained, 5);
    assert_eq!(outcome.warning, None);
    assert_all_layers(&cache, &[0, 1, 2, 3, 9]);
}

#[test]
fn evict_for_space_is_noop_when_room_exists() {
    let mut cache = filled(4, 6, 1, 7);
    let outcome = cache.evict_for_space(3).unwrap();
    assert!(outcome.is_noop());
    assert_eq!(outcome.retained, 7);
    assert_eq!(cache.stats().space_evictions, 0);
}

#[test]
fn evict_for_space_below_cache_size_drops_only_what_is_needed() {
    let mut cache = filled(4, 6, 1, 8);
    let outcome = cache.evict_for_space(5).unwrap();
    assert_eq!(outcome.removed, 3);
    assert_all_layers(&cache, &[0, 1, 2, 3, 7]);
}

#[test]
fn oversized_request_discards_whole_window_with_warning() {
    let mut cache = filled(4, 6, 2, 10);
    let outcome = cache.evict_for_space(8).unwrap();
    assert_eq!(outcome.retained, 4);
    assert_eq!(
        outcome.warning,
        Some(CacheWarning::Capacity {
            requested: 8,
            recent_size: 6
        })
    );
    assert_all_layers(&cache, &[0, 1, 2, 3]);
    assert_eq!(cache.stats().capacity_warnings, 1);
}

#[test]
fn evict_range_can_cut_into_sink_zone() {
    let mut cache = filled(4, 6, 2, 10);
    let outcome = cache.evict_range(2, 8).unwrap();
    assert_eq!(outcome.retained, 4);
    assert_eq!(
        outcome.warning,
        Some(CacheWarning::SinkZoneEvicted {
            begin: 2,
            end: 8,
            start_size: 4
        })
    );
    assert_all_layers(&cache, &[0, 1, 8, 9]);
    // The cache does not re-declare its sink zone on its own.
    assert_eq!(cache.start_size(), 4);
}

#[test]
fn start_size_is_redeclared_within_retained_entries() {
    let mut cache = filled(4, 6, 2, 10);
    cache.evict_range(2, 8).unwrap();

    let err = cache.set_start_size(5).unwrap_err();
    assert!(matches!(err, CacheError::InvalidConfig(_)), "{err}");
    let err = cache.set_start_size(usize::MAX).unwrap_err();
    assert!(matches!(err, CacheError::InvalidConfig(_)), "{err}");
    assert_eq!(cache.start_size(), 4);

    cache.set_start_size(2).unwrap();
    assert_eq!(cache.cache_size(), 8);
    push(&mut cache, &[10, 11, 12, 13, 14, 15]);
    cache.trim().unwrap();
    assert_all_layers(&cache, &[0, 1, 10, 11, 12, 13, 14, 15]);
}

#[test]
fn evict_range_inside_window_has_no_warning() {
    let mut cache = filled(4, 6, 1, 10);
    let outcome = cache.evict_range(5, 7).unwrap();
    assert_eq!(outcome.warning, None);
    assert_all_layers(&cache, &[0, 1, 2, 3, 4, 7, 8, 9]);
}

#[test]
fn invalid_evict_range_is_rejected_without_mutation() {
    let mut cache = filled(4, 6, 2, 10);
    for (begin, end) in [(3, 3), (5, 2), (8, 11)] {
        let err = cache.evict_range(begin, end).unwrap_err();
        assert!(
            matches!(err, CacheError::OutOfRange { len: 10, .. }),
            "{begin}..{end}: {err}"
        );
        assert!(!err.is_fatal());
    }
    assert_eq!(cache.seq_len().unwrap(), 10);
    assert_eq!(cache.stats().range_evictions, 0);
}

#[test]
fn trim_is_idempotent() {
    let mut cache = filled(4, 6, 2, 15);
    let first = cache.trim().unwrap();
    assert_eq!(first.removed, 5);
    assert_all_layers(&cache, &[0, 1, 2, 3, 9, 10, 11, 12, 13, 14]);
    let second = cache.trim().unwrap();
    assert!(second.is_noop());
    assert_all_layers(&cache, &[0, 1, 2, 3, 9, 10, 11, 12, 13, 14]);
}

#[test]
fn zero_sinks_degrade_to_plain_window() {
    let mut cache = filled(0, 3, 1, 5);
    cache.trim().unwrap();
    assert_all_layers(&cache, &[2, 3, 4]);

    cache.evict_for_space(5).unwrap();
    assert!(cache.is_empty());
    assert_eq!(cache.seq_len().unwrap(), 0);

    push(&mut cache, &[7, 8]);
    assert_all_layers(&cache, &[7, 8]);
}

#[test]
fn transposed_layout_slices_keys_and_values_on_their_own_axes() {
    let mut cache = CacheState::new(config(2, 3, LayoutDescriptor::TransposedValue), 2).unwrap();
    push(&mut cache, &[0, 1, 2, 3, 4, 5, 6]);
    let entry = cache.layer(0).unwrap();
    assert_eq!(entry.key.dims(), &[1, HEADS, HEAD_DIM, 7]);
    assert_eq!(entry.value.dims(), &[1, HEADS, 7, HEAD_DIM]);

    cache.trim().unwrap();
    assert_all_layers(&cache, &[0, 1, 4, 5, 6]);
    let entry = cache.layer(1).unwrap();
    assert_eq!(entry.key.dims(), &[1, HEADS, HEAD_DIM, 5]);
    assert_eq!(entry.value.dims(), &[1, HEADS, 5, HEAD_DIM]);
}

#[test]
fn custom_layout_handles_rank_three_caches() {
    let layout = LayoutDescriptor::Custom {
        key_seq_dim: 1,
        value_seq_dim: 1,
    };
    let mut cache = CacheState::new(config(1, 2, layout), 1).unwrap();
    for token in 0..6 {
        cache.evict_for_space(1).unwrap();
        push(&mut cache, &[token]);
    }
    assert_all_layers(&cache, &[0, 4, 5]);
}

#[test]
fn eviction_sink_sees_each_layer_with_original_range() {
    let log = EvictionLog::new();
    let mut cache = filled(4, 6, 2, 10).with_eviction_sink(log.clone());
    cache.evict_for_space(5).unwrap();

    let records = log.records();
    assert_eq!(records.len(), 2);
    for (layer, record) in records.iter().enumerate() {
        let segment = &record.segment;
        assert_eq!(segment.layer, layer);
        assert_eq!(segment.range, 4..9);
        assert_eq!(segment.reason, EvictionReason::MakeSpace);
        assert_eq!(ids(&segment.key, 2), vec![4, 5, 6, 7, 8]);
        assert_eq!(ids(&segment.value, 2), vec![4, 5, 6, 7, 8]);
    }
}

#[test]
fn closures_work_as_eviction_sinks() {
    let seen: Arc<Mutex<Vec<(usize, std::ops::Range<usize>)>>> = Arc::default();
    let sink_seen = Arc::clone(&seen);
    let mut cache = filled(4, 6, 1, 12);
    cache.set_eviction_sink(move |segment: &EvictedSegment| {
        sink_seen
            .lock()
            .unwrap()
            .push((segment.layer, segment.range.clone()));
    });
    cache.trim().unwrap();
    cache.evict_range(0, 1).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(0, 4..6), (0, 0..1)]);

    assert!(cache.clear_eviction_sink().is_some());
    cache.evict_range(0, 1).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn diverging_layers_are_fatal_and_leave_cache_untouched() {
    let log = EvictionLog::new();
    let mut cache = CacheState::new(config(1, 2, LayoutDescriptor::Standard), 2)
        .unwrap()
        .with_eviction_sink(log.clone());
    cache.append(0, &tokens(&[0, 1, 2, 3], 2), &tokens(&[0, 1, 2, 3], 2)).unwrap();
    cache.append(1, &tokens(&[0, 1, 2], 2), &tokens(&[0, 1, 2], 2)).unwrap();

    let err = cache.trim().unwrap_err();
    assert!(err.is_fatal(), "{err}");
    assert!(matches!(
        err,
        CacheError::ShapeMismatch {
            layer: 1,
            expected: 4,
            found: 3,
            ..
        }
    ));
    assert!(cache.seq_len().is_err());
    assert!(log.is_empty());
    assert_eq!(layer_ids(&cache, 0).0, vec![0, 1, 2, 3]);
}

#[test]
fn key_value_length_disagreement_is_rejected_on_append() {
    let mut cache = CacheState::new(config(1, 2, LayoutDescriptor::Standard), 1).unwrap();
    let err = cache
        .append(0, &tokens(&[0, 1], 2), &tokens(&[0], 2))
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::ShapeMismatch {
            tensor: "value",
            expected: 2,
            found: 1,
            ..
        }
    ));
    assert!(cache.is_empty());
}

#[test]
fn unknown_layer_is_rejected() {
    let mut cache = CacheState::new(config(1, 2, LayoutDescriptor::Standard), 2).unwrap();
    let err = cache
        .append(2, &tokens(&[0], 2), &tokens(&[0], 2))
        .unwrap_err();
    assert!(matches!(err, CacheError::UnknownLayer { layer: 2, layers: 2 }));
}

#[test]
fn memory_usage_tracks_retained_entries() {
    let mut cache = filled(2, 2, 2, 6);
    // 2 layers * (key + value) * 6 slots * HEADS * HEAD_DIM * 4 bytes
    assert_eq!(cache.memory_usage(), 2 * 2 * 6 * HEADS * HEAD_DIM * 4);
    cache.trim().unwrap();
    assert_eq!(cache.memory_usage(), 2 * 2 * 4 * HEADS * HEAD_DIM * 4);
    cache.clear();
    assert_eq!(cache.memory_usage(), 0);
    assert!(cache.is_empty());
}

#[test]
fn zero_layers_is_invalid() {
    let err = CacheState::new(StreamingConfig::default(), 0).unwrap_err();
    assert!(matches!(err, CacheError::InvalidConfig(_)));
}

#[test]
fn concurrency_traits_documented() {
    assert_impl_all!(CacheState: Send);
    assert_not_impl_any!(CacheState: Sync);
    assert_impl_all!(EvictionLog: Send, Sync, Clone);
}
