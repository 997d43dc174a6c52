#![allow(dead_code)]

use log::LevelFilter;
use ndarray::Array4;
use seg_berry::prelude::*;
use std::sync::Arc;

pub fn init_logger() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init();
}

/// 小型配置: 单块 ResNet 阶段, 窄通道.
pub fn small_config() -> UNetConfig {
    UNetConfig::default()
        .with_encoder(
            EncoderConfig::resnet18()
                .with_stem_channels(8)
                .with_stages(vec![8, 16, 16, 32], vec![1, 1, 1, 1]),
        )
        .with_decoder(
            DecoderConfig::default()
                .with_channels(vec![16, 16, 8, 8, 4])
                .with_reduction(2),
        )
}

/// 确定性的伪图像.
pub fn image(shape: Shape4, ledger: &Arc<MemoryLedger>) -> FeatureMap {
    let data = Array4::from_shape_fn(shape, |(b, c, y, x)| {
        (((b * 31 + c * 17 + y * 7 + x * 3) % 29) as f32) / 29.0
    });
    FeatureMap::with_ledger(data, ledger)
}
