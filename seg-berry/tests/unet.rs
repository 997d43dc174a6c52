mod common;

use common::{image, init_logger, small_config};
use seg_berry::prelude::*;
use std::sync::Arc;

#[test]
fn test_end_to_end_resnet34() {
    init_logger();
    let model = UNet::new(&UNetConfig::default()).unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let x = image((2, 3, 256, 256), &ledger);

    let features = model.encoder().forward_all(&x, false).unwrap();
    let shapes: Vec<_> = features.iter().map(FeatureMap::shape).collect();
    assert_eq!(
        shapes,
        vec![
            (2, 3, 256, 256),
            (2, 64, 64, 64),
            (2, 64, 64, 64),
            (2, 128, 32, 32),
            (2, 256, 16, 16),
            (2, 512, 8, 8),
        ]
    );

    let stage0 = model.decoder().layers()[0]
        .forward_skip(features[5].clone(), Some(&features[4]), false)
        .unwrap();
    assert_eq!(stage0.shape(), (2, 256, 16, 16));
    stage0.release();

    let logits = model.decoder().forward_features(features, false).unwrap();
    assert_eq!(logits.shape(), (2, 1, 64, 64));
    let out = logits.upsample_nearest((256, 256)).unwrap();
    assert_eq!(out.shape(), (2, 1, 256, 256));
    assert!(out.view().iter().all(|v| v.is_finite()));
    assert_eq!(ledger.live_maps(), 2);

    let plan = model.shape_plan((2, 3, 256, 256)).unwrap();
    assert_eq!(plan.encoder, shapes);
    assert_eq!(plan.decoder[0], (2, 256, 16, 16));
    assert_eq!(plan.output, (2, 1, 256, 256));
}

#[test]
fn test_skip_channel_invariant() {
    let model = UNet::new(&UNetConfig::default().with_attention(AttentionKind::Scse)).unwrap();
    let cat: Vec<_> = model
        .decoder()
        .layers()
        .iter()
        .map(|l| {
            let (c_in, skip, _) = l.channels();
            (c_in, skip)
        })
        .collect();
    assert_eq!(cat, vec![(512, 256), (256, 128), (128, 64), (64, 64), (32, 0)]);
    assert!(model
        .decoder()
        .layers()
        .iter()
        .all(|l| l.attention() == AttentionKind::Scse));
}

#[test]
fn test_shape_contract() {
    let model = UNet::new(&small_config().with_attention(AttentionKind::Scse)).unwrap();
    for (b, h, w) in [(1, 32, 32), (2, 64, 32), (3, 96, 128)] {
        let ledger = Arc::new(MemoryLedger::new());
        let x = image((b, 3, h, w), &ledger);
        for train in [false, true] {
            let y = model.forward(&x, train).unwrap();
            assert_eq!(y.shape(), (b, 1, h, w));
            assert_eq!(model.shape_plan(x.shape()).unwrap().output, y.shape());
        }
        assert_eq!(ledger.live_maps(), 1);
    }
}

#[test]
fn test_multi_class_and_head_kernel() {
    let model = UNet::new(&small_config().with_classes(4).with_head_kernel(1)).unwrap();
    assert_eq!(model.decoder().head().classes(), 4);
    assert_eq!(model.decoder().head().kernel(), 1);
    let ledger = Arc::new(MemoryLedger::new());
    let x = image((1, 3, 64, 64), &ledger);
    assert_eq!(model.forward(&x, false).unwrap().shape(), (1, 4, 64, 64));
}

#[test]
fn test_eval_is_deterministic() {
    let model = UNet::new(&small_config().with_seed(11)).unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let x = image((2, 3, 32, 32), &ledger);
    let a = model.forward(&x, false).unwrap();
    let b = model.forward(&x, false).unwrap();
    assert_eq!(a.view(), b.view());
}

#[test]
fn test_construction_errors() {
    let bad_repeats = small_config().with_encoder(
        EncoderConfig::resnet34().with_stages(vec![64, 128, 256, 512], vec![3, 4, 6]),
    );
    assert!(matches!(
        UNet::new(&bad_repeats),
        Err(ConfigError::RepeatCountMismatch { channels: 4, repeats: 3 })
    ));

    let bad_decoder = UNetConfig::default()
        .with_decoder(DecoderConfig::default().expecting(vec![3, 64, 64, 128, 256, 256]));
    assert!(matches!(
        UNet::new(&bad_decoder),
        Err(ConfigError::ChannelMismatch { stage: 5, .. })
    ));

    let too_deep = UNetConfig::default()
        .with_decoder(DecoderConfig::default().with_channels(vec![256, 128, 64, 32, 16, 8]));
    assert!(matches!(
        UNet::new(&too_deep),
        Err(ConfigError::DepthMismatch { encoder: 5, decoder: 6 })
    ));
}
