mod common;

use common::{image, small_config};
use ndarray::ArrayD;
use seg_berry::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;

fn parameters(model: &UNet) -> Vec<(String, ArrayD<f32>)> {
    let mut out = Vec::new();
    model.visit_parameters(&mut |p| out.push((p.name().to_string(), p.value().to_owned())));
    out
}

#[test]
fn test_save_then_load_restores_outputs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("unet.npz");

    let trained = UNet::new(&small_config().with_seed(1)).unwrap();
    // 训练模式的前向传播会更新滑动统计量, 归档中应带上它们.
    let ledger = Arc::new(MemoryLedger::new());
    let x = image((2, 3, 32, 32), &ledger);
    trained.forward(&x, true).unwrap().release();
    save(&trained, &path).unwrap();

    let mut fresh = UNet::new(&small_config().with_seed(2)).unwrap();
    assert_ne!(parameters(&trained), parameters(&fresh));
    load(&mut fresh, &path).unwrap();
    assert_eq!(parameters(&trained), parameters(&fresh));

    let a = trained.forward(&x, false).unwrap();
    let b = fresh.forward(&x, false).unwrap();
    assert_eq!(a.view(), b.view());
}

#[test]
fn test_partial_load_reports_missing_center() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("no_center.npz");
    save(&UNet::new(&small_config()).unwrap(), &path).unwrap();

    let with_center = small_config().with_decoder(
        DecoderConfig::default()
            .with_channels(vec![16, 16, 8, 8, 4])
            .with_center(true),
    );

    let mut strict = UNet::new(&with_center).unwrap();
    let before = parameters(&strict);
    match load(&mut strict, &path) {
        Err(CheckpointError::Missing(names)) => {
            assert!(!names.is_empty());
            assert!(names.iter().all(|n| n.starts_with("decoder.center.")));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    // 严格加载失败时模型不被改写.
    assert_eq!(before, parameters(&strict));

    let mut partial = UNet::new(&with_center).unwrap();
    let missing = load_partial(&mut partial, &path).unwrap();
    assert!(missing.contains(&"decoder.center.conv1.conv.weight".to_string()));
    assert!(missing.iter().all(|n| n.starts_with("decoder.center.")));
    let mut sorted = missing.clone();
    sorted.sort();
    assert_eq!(missing, sorted);
}

#[test]
fn test_shape_mismatch_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("binary.npz");
    save(&UNet::new(&small_config()).unwrap(), &path).unwrap();

    let mut multi = UNet::new(&small_config().with_classes(2)).unwrap();
    let before = parameters(&multi);
    match load_partial(&mut multi, &path) {
        Err(CheckpointError::ShapeMismatch { name, expected, found }) => {
            assert!(name.starts_with("segmentation_head."));
            assert_eq!(expected[0], 2);
            assert_eq!(found[0], 1);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(before, parameters(&multi));
}

#[test]
fn test_missing_file() {
    let dir = tempdir().unwrap();
    let mut model = UNet::new(&small_config()).unwrap();
    assert!(matches!(
        load(&mut model, dir.path().join("absent.npz")),
        Err(CheckpointError::Io(_))
    ));
}
