//! UNet 解码器.
//!
//! 解码器消费编码器输出的全部特征图:
//!
//! 1. 第一个特征 (归一化输入) 没有对应阶段, 立即释放;
//! 2. 最深的特征经过中心块 (默认恒等) 成为初始 `x`;
//! 3. 其余特征由深到浅逐个作为各阶段的跳连, 用完即释放; 最后一个阶段没有跳连;
//! 4. 分割头把最后一个阶段的输出投影为类别 logits.
//!
//! 解码器的输出停留在解码器自身分辨率 (输入的 1/4), 由模型负责上采样回输入尺寸.

mod layer;

pub use layer::DecoderLayer;

use crate::config::DecoderConfig;
use crate::consts::DECODER_BN_EPS;
use crate::error::{ConfigError, ConfigResult, ShapeError, ShapeResult};
use crate::feature::FeatureMap;
use crate::head::SegmentationHead;
use crate::nn::{ConvBnRelu, ModuleT, Parameter, Path};
use crate::Shape4;
use log::debug;
use std::iter;

/// 由编码器输出通道与解码器输出通道推出各阶段 `(输入, 跳连, 输出)` 通道.
///
/// 跳连为编码器通道去掉第一个后的逆序 (不含最深的一个), 末尾补 0.
pub fn stage_channels(encoder_channels: &[usize], decoder_channels: &[usize]) -> Vec<(usize, usize, usize)> {
    let deep_first: Vec<usize> = encoder_channels.iter().skip(1).rev().copied().collect();
    let Some((&head, skips)) = deep_first.split_first() else {
        return Vec::new();
    };
    let inputs = iter::once(head).chain(decoder_channels.iter().copied());
    let skips = skips.iter().copied().chain(iter::once(0));
    inputs
        .zip(skips)
        .zip(decoder_channels.iter().copied())
        .map(|((i, s), o)| (i, s, o))
        .collect()
}

/// 中心块: 最深特征上的两个 3x3 卷积块, 不改变通道与分辨率.
#[derive(Debug)]
pub struct CenterLayer {
    conv1: ConvBnRelu,
    conv2: ConvBnRelu,
}

impl CenterLayer {
    /// 参数名为 `{path}.conv1.*` 与 `{path}.conv2.*`.
    pub fn new(path: &Path, channels: usize) -> ConfigResult<Self> {
        Ok(Self {
            conv1: ConvBnRelu::new(&path.sub("conv1"), channels, channels, 3, 1, 1, DECODER_BN_EPS)?,
            conv2: ConvBnRelu::new(&path.sub("conv2"), channels, channels, 3, 1, 1, DECODER_BN_EPS)?,
        })
    }
}

impl ModuleT for CenterLayer {
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        let y = self.conv1.forward_t(x, train)?;
        self.conv2.forward_t(&y, train)
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.conv1.visit_parameters(visitor);
        self.conv2.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.conv1.visit_parameters_mut(visitor);
        self.conv2.visit_parameters_mut(visitor);
    }
}

/// UNet 解码器 (含分割头).
#[derive(Debug)]
pub struct UNetDecoder {
    center: Option<CenterLayer>,
    layers: Vec<DecoderLayer>,
    head: SegmentationHead,
    encoder_channels: Vec<usize>,
}

impl UNetDecoder {
    /// 在 `path` 下创建. 各阶段参数位于 `{path}.blocks.{i}`, 中心块位于 `{path}.center`.
    ///
    /// `encoder_channels` 为编码器全部输出特征的通道数 (含第一个).
    pub fn new(
        path: &Path,
        encoder_channels: &[usize],
        config: &DecoderConfig,
        head: SegmentationHead,
    ) -> ConfigResult<Self> {
        let depth = encoder_channels.len().saturating_sub(1);
        if config.depth() != depth || depth == 0 {
            return Err(ConfigError::DepthMismatch {
                encoder: depth,
                decoder: config.depth(),
            });
        }
        if config.attention.len() != config.depth() {
            return Err(ConfigError::AttentionLenMismatch {
                stages: config.depth(),
                attention: config.attention.len(),
            });
        }
        if let Some(expected) = &config.encoder_channels {
            for (stage, (&e, &a)) in expected.iter().zip(encoder_channels).enumerate() {
                if e != a {
                    return Err(ConfigError::ChannelMismatch {
                        stage,
                        expected: e,
                        actual: a,
                    });
                }
            }
            if expected.len() != encoder_channels.len() {
                return Err(ConfigError::DepthMismatch {
                    encoder: depth,
                    decoder: expected.len().saturating_sub(1),
                });
            }
        }

        let plan = stage_channels(encoder_channels, &config.channels);
        let center = if config.center {
            Some(CenterLayer::new(&path.sub("center"), plan[0].0)?)
        } else {
            None
        };
        let blocks = path.sub("blocks");
        let layers = plan
            .iter()
            .zip(&config.attention)
            .enumerate()
            .map(|(i, (&(c_in, skip, c_out), &kind))| {
                DecoderLayer::new(&blocks.sub(i), c_in, skip, c_out, kind, config.reduction)
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        let last = plan[plan.len() - 1].2;
        if head.in_channels() != last {
            return Err(ConfigError::ChannelMismatch {
                stage: plan.len(),
                expected: last,
                actual: head.in_channels(),
            });
        }

        Ok(Self {
            center,
            layers,
            head,
            encoder_channels: encoder_channels.to_vec(),
        })
    }

    /// 阶段数.
    #[inline]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// 各阶段.
    #[inline]
    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    /// 是否带中心块.
    #[inline]
    pub fn has_center(&self) -> bool {
        self.center.is_some()
    }

    /// 分割头.
    #[inline]
    pub fn head(&self) -> &SegmentationHead {
        &self.head
    }

    /// 消费编码器输出的全部特征图, 返回解码器分辨率下的 logits.
    ///
    /// 无论成功与否, 所有传入的特征图都在返回前被释放.
    pub fn forward_features(&self, mut features: Vec<FeatureMap>, train: bool) -> ShapeResult<FeatureMap> {
        let expected = self.layers.len() + 1;
        if features.len() != expected {
            return Err(ShapeError::FeatureCount {
                expected,
                actual: features.len(),
            });
        }
        features.remove(0).release();
        let deepest = features.pop().ok_or(ShapeError::FeatureCount {
            expected,
            actual: 1,
        })?;
        let mut x = match &self.center {
            Some(center) => {
                let y = center.forward_t(&deepest, train)?;
                deepest.release();
                y
            }
            None => deepest,
        };
        for (i, layer) in self.layers.iter().enumerate() {
            let skip = features.pop();
            x = layer.forward_skip(x, skip.as_ref(), train)?;
            debug!("decoder stage {}: {:?}", i, x.shape());
        }
        self.head.forward_t(&x, train)
    }

    /// 不运行网络, 由编码器各输出形状推算每个阶段及分割头的输出形状.
    pub fn output_shapes(&self, encoder_shapes: &[Shape4]) -> ShapeResult<(Vec<Shape4>, Shape4)> {
        let expected = self.layers.len() + 1;
        if encoder_shapes.len() != expected {
            return Err(ShapeError::FeatureCount {
                expected,
                actual: encoder_shapes.len(),
            });
        }
        for (&(_, c, _, _), &e) in encoder_shapes.iter().zip(&self.encoder_channels) {
            if c != e {
                return Err(ShapeError::Channels {
                    op: "decoder",
                    expected: e,
                    actual: c,
                });
            }
        }
        let (n, _, mut h, mut w) = encoder_shapes[expected - 1];
        let mut skips = encoder_shapes[1..expected - 1].iter().rev();
        let mut stages = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            if let Some(&(_, _, sh, sw)) = skips.next() {
                (h, w) = (sh, sw);
            }
            stages.push((n, layer.channels().2, h, w));
        }
        let (hh, hw) = self.head.output_size((h, w))?;
        Ok((stages, (n, self.head.classes(), hh, hw)))
    }

    /// 遍历参数: 中心块, 各阶段, 分割头.
    pub fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        if let Some(center) = &self.center {
            center.visit_parameters(visitor);
        }
        self.layers.iter().for_each(|l| l.visit_parameters(visitor));
        self.head.visit_parameters(visitor);
    }

    /// 遍历可变参数.
    pub fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        if let Some(center) = &mut self.center {
            center.visit_parameters_mut(visitor);
        }
        self.layers
            .iter_mut()
            .for_each(|l| l.visit_parameters_mut(visitor));
        self.head.visit_parameters_mut(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::{stage_channels, UNetDecoder};
    use crate::config::{AttentionKind, DecoderConfig};
    use crate::error::{ConfigError, ShapeError};
    use crate::feature::{FeatureMap, MemoryLedger};
    use crate::head::SegmentationHead;
    use crate::nn::VarStore;
    use ndarray::Array4;
    use std::sync::Arc;

    const ENCODER: [usize; 6] = [3, 4, 4, 8, 8, 16];

    fn decoder(vs: &VarStore, config: &DecoderConfig) -> UNetDecoder {
        let head = SegmentationHead::new(&vs.root().sub("segmentation_head"), 2, 1, 3).unwrap();
        UNetDecoder::new(&vs.root().sub("decoder"), &ENCODER, config, head).unwrap()
    }

    fn small() -> DecoderConfig {
        DecoderConfig::default().with_channels(vec![8, 8, 4, 4, 2])
    }

    fn features(ledger: &Arc<MemoryLedger>) -> Vec<FeatureMap> {
        [(3, 32), (4, 8), (4, 8), (8, 4), (8, 2), (16, 1)]
            .into_iter()
            .map(|(c, s)| FeatureMap::with_ledger(Array4::from_elem((2, c, s, s), 0.25), ledger))
            .collect()
    }

    #[test]
    fn test_skip_channel_invariant() {
        let plan = stage_channels(&[3, 64, 64, 128, 256, 512], &[256, 128, 64, 32, 16]);
        let cat: Vec<_> = plan.iter().map(|&(i, s, _)| (i, s)).collect();
        assert_eq!(cat, vec![(512, 256), (256, 128), (128, 64), (64, 64), (32, 0)]);

        let vs = VarStore::new(0);
        let dec = decoder(&vs, &small());
        let channels: Vec<_> = dec.layers().iter().map(|l| l.channels()).collect();
        assert_eq!(channels, vec![(16, 8, 8), (8, 8, 8), (8, 4, 4), (4, 4, 4), (4, 0, 2)]);
    }

    #[test]
    fn test_forward_features_releases_everything() {
        let vs = VarStore::new(0);
        let dec = decoder(&vs, &small().with_attention(AttentionKind::Scse).with_reduction(2));
        let ledger = Arc::new(MemoryLedger::new());
        let logits = dec.forward_features(features(&ledger), false).unwrap();
        assert_eq!(logits.shape(), (2, 1, 8, 8));
        assert_eq!(ledger.live_maps(), 1);

        let shapes: Vec<_> = features(&ledger).iter().map(FeatureMap::shape).collect();
        let (stages, head) = dec.output_shapes(&shapes).unwrap();
        assert_eq!(stages[0], (2, 8, 2, 2));
        assert_eq!(stages[4], (2, 2, 8, 8));
        assert_eq!(head, logits.shape());
    }

    #[test]
    fn test_center_block() {
        let vs = VarStore::new(0);
        let dec = decoder(&vs, &small().with_center(true));
        assert!(dec.has_center());
        assert!(vs.names().contains(&"decoder.center.conv2.bn.weight".to_string()));
        let ledger = Arc::new(MemoryLedger::new());
        let logits = dec.forward_features(features(&ledger), true).unwrap();
        assert_eq!(logits.shape(), (2, 1, 8, 8));
        assert_eq!(ledger.live_maps(), 1);
    }

    #[test]
    fn test_runtime_mismatch() {
        let vs = VarStore::new(0);
        let dec = decoder(&vs, &small());
        let ledger = Arc::new(MemoryLedger::new());
        let mut feats = features(&ledger);
        feats.pop();
        assert_eq!(
            dec.forward_features(feats, false).unwrap_err(),
            ShapeError::FeatureCount { expected: 6, actual: 5 }
        );
        assert_eq!(ledger.live_maps(), 0);

        let mut feats = features(&ledger);
        feats[3] = FeatureMap::with_ledger(Array4::zeros((2, 5, 4, 4)), &ledger);
        assert!(dec.forward_features(feats, false).is_err());
        assert_eq!(ledger.live_maps(), 0);
    }

    #[test]
    fn test_construction_mismatch() {
        let vs = VarStore::new(0);
        let head = SegmentationHead::new(&vs.root().sub("head"), 2, 1, 3).unwrap();
        let config = small().expecting(vec![3, 4, 4, 8, 8, 32]);
        assert_eq!(
            UNetDecoder::new(&vs.root().sub("decoder"), &ENCODER, &config, head).unwrap_err(),
            ConfigError::ChannelMismatch { stage: 5, expected: 32, actual: 16 }
        );
    }
}
