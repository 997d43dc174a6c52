mod common;

use common::{image, init_logger, small_config};
use ndarray::Array4;
use seg_berry::prelude::*;
use std::sync::Arc;

const PASSES: usize = 100;

#[test]
fn test_repeated_eval_passes_leave_no_residue() {
    init_logger();
    let model = UNet::new(&small_config().with_attention(AttentionKind::Scse)).unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let x = image((1, 3, 32, 32), &ledger);
    let baseline = ledger.snapshot();

    let expected = model.forward(&x, false).unwrap().into_array();
    assert_eq!(expected.dim(), (1, 1, 32, 32));
    for _ in 1..PASSES {
        let y = model.forward(&x, false).unwrap();
        assert_eq!(y.view(), expected.view());
    }

    let end = ledger.snapshot();
    assert!(end.is_balanced_with(&baseline), "{end:?} vs {baseline:?}");
    assert_eq!(end.leaked_bytes_since(&baseline), 0);
    assert!(end.allocations_since(&baseline) >= PASSES);
    assert!(end.peak_bytes > baseline.live_bytes);
}

#[test]
fn test_train_passes_leave_no_residue() {
    let model = UNet::new(&small_config().with_decoder(
        DecoderConfig::default()
            .with_channels(vec![16, 16, 8, 8, 4])
            .with_center(true),
    ))
    .unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let x = image((2, 3, 32, 32), &ledger);
    let baseline = ledger.snapshot();
    for _ in 0..10 {
        model.forward(&x, true).unwrap().release();
    }
    assert!(ledger.snapshot().is_balanced_with(&baseline));
}

#[test]
fn test_failed_pass_releases_intermediates() {
    let model = UNet::new(&small_config()).unwrap();
    let ledger = Arc::new(MemoryLedger::new());

    // 第三个解码阶段的跳连通道数错误, 此前两个阶段已经产生过中间结果.
    let shapes = [
        (1, 3, 32, 32),
        (1, 8, 16, 16),
        (1, 5, 8, 8),
        (1, 16, 4, 4),
        (1, 16, 2, 2),
        (1, 32, 1, 1),
    ];
    let features: Vec<_> = shapes
        .iter()
        .map(|&s| FeatureMap::with_ledger(Array4::from_elem(s, 0.25), &ledger))
        .collect();
    let before = ledger.snapshot();
    assert!(matches!(
        model.decoder().forward_features(features, false),
        Err(ShapeError::Channels { expected: 8, actual: 5, .. })
    ));
    let after = ledger.snapshot();
    assert_eq!(after.live_maps, 0);
    assert!(after.allocations_since(&before) > 0);

    let wrong = FeatureMap::with_ledger(Array4::zeros((1, 4, 32, 32)), &ledger);
    let baseline = ledger.snapshot();
    assert!(matches!(
        model.forward(&wrong, false),
        Err(ShapeError::Channels { actual: 4, .. })
    ));
    assert!(ledger.snapshot().is_balanced_with(&baseline));
}

#[test]
fn test_concurrent_eval_passes_share_one_model() {
    let model = UNet::new(&small_config()).unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let baseline = ledger.snapshot();
    std::thread::scope(|s| {
        for t in 0..4 {
            let model = &model;
            let ledger = &ledger;
            s.spawn(move || {
                let x = image((1, 3, 32, 32), ledger);
                for _ in 0..5 {
                    let y = model.forward(&x, false).unwrap();
                    assert_eq!(y.shape(), (1, 1, 32, 32), "thread {t}");
                }
            });
        }
    });
    assert!(ledger.snapshot().is_balanced_with(&baseline));
}
