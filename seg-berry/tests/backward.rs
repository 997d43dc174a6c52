mod common;

use common::{image, small_config};
use ndarray::Array4;
use seg_berry::prelude::*;
use std::sync::Arc;

fn check_train_gradients(model: &UNet) {
    let ledger = Arc::new(MemoryLedger::new());
    let x = image((2, 3, 32, 32), &ledger);
    assert!(!x.requires_grad());

    let y = model.forward(&x, true).unwrap();
    assert!(y.requires_grad());
    let grads = y.backward().unwrap();

    let mut trainable = 0;
    model.visit_parameters(&mut |p| {
        let g = grads.get(p.name());
        if p.trainable() {
            trainable += 1;
            let g = g.unwrap_or_else(|| panic!("no gradient for {}", p.name()));
            assert_eq!(g.shape(), p.shape(), "{}", p.name());
            assert!(g.iter().all(|v| v.is_finite()), "{}", p.name());
        } else {
            assert!(g.is_none(), "{} is not trainable", p.name());
        }
    });
    assert_eq!(grads.len(), trainable);
    // 输出梯度全 1 时, 分割头偏置的梯度就是输出像素数.
    let head_bias = grads.get("segmentation_head.bias").unwrap();
    assert_eq!(head_bias.iter().copied().collect::<Vec<_>>(), vec![(2 * 32 * 32) as f32]);

    drop(grads);
    y.release();
    assert_eq!(ledger.live_maps(), 1);
}

#[test]
fn test_train_logits_reach_every_trainable_parameter() {
    for kind in [AttentionKind::Identity, AttentionKind::Scse] {
        let model = UNet::new(&small_config().with_attention(kind)).unwrap();
        check_train_gradients(&model);
    }
}

#[test]
fn test_eval_pass_tracks_only_on_request() {
    let model = UNet::new(&small_config()).unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let x = image((1, 3, 32, 32), &ledger);

    let y = model.forward(&x, false).unwrap();
    assert!(!y.requires_grad());
    assert!(matches!(y.backward(), Err(ShapeError::Untracked)));

    // 推理模式下对输入求梯度 (例如显著图).
    let x = x.with_requires_grad(true);
    let y = model.forward(&x, false).unwrap();
    assert!(y.requires_grad());
    let seed = Array4::from_elem(y.shape(), 0.5);
    let grads = y.backward_with(&seed).unwrap();
    let dx = grads.wrt(&x).unwrap();
    assert_eq!(dx.dim(), (1, 3, 32, 32));
    assert!(dx.iter().all(|v| v.is_finite()));
    assert!(dx.iter().any(|&v| v != 0.0));

    assert!(matches!(
        y.backward_with(&Array4::zeros((1, 1, 16, 16))),
        Err(ShapeError::Incompatible { op: "backward", .. })
    ));
}
