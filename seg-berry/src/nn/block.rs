//! 卷积块 (卷积 -> 批归一化 -> ReLU).

use super::{BatchNorm2d, Conv2d, ModuleT, Parameter, Path};
use crate::error::{ConfigResult, ShapeResult};
use crate::feature::FeatureMap;

/// 卷积块: 无偏置卷积 -> 批归一化 -> ReLU.
///
/// 参数名为 `{path}.conv.weight` 与 `{path}.bn.*`.
#[derive(Debug)]
pub struct ConvBnRelu {
    conv: Conv2d,
    bn: BatchNorm2d,
}

impl ConvBnRelu {
    /// `padding` 通常取 `kernel / 2` 以保持分辨率.
    pub fn new(
        path: &Path,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
        stride: usize,
        eps: f32,
    ) -> ConfigResult<Self> {
        Ok(Self {
            conv: Conv2d::new(&path.sub("conv"), in_channels, out_channels, kernel, stride, padding, false)?,
            bn: BatchNorm2d::new(&path.sub("bn"), out_channels, eps)?,
        })
    }

    /// 输入通道数.
    #[inline]
    pub fn in_channels(&self) -> usize {
        self.conv.in_channels()
    }

    /// 输出通道数.
    #[inline]
    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }
}

impl ModuleT for ConvBnRelu {
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        let y = self.conv.forward_t(x, train)?;
        Ok(self.bn.normalize_(y, train)?.relu_())
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.conv.visit_parameters(visitor);
        self.bn.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.conv.visit_parameters_mut(visitor);
        self.bn.visit_parameters_mut(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::ConvBnRelu;
    use crate::consts::DECODER_BN_EPS;
    use crate::feature::FeatureMap;
    use crate::nn::{ModuleT, VarStore};
    use ndarray::Array4;
    use std::sync::Arc;

    #[test]
    fn test_block_is_non_negative_and_balanced() {
        let vs = VarStore::new(3);
        let block = ConvBnRelu::new(&vs.root().sub("conv1"), 4, 6, 3, 1, 1, DECODER_BN_EPS).unwrap();
        let x = FeatureMap::new(Array4::from_shape_fn((2, 4, 5, 5), |(b, c, y, x)| {
            (b + c) as f32 - (y * x) as f32 * 0.1
        }));
        let ledger = Arc::clone(x.ledger());
        let y = block.forward_t(&x, true).unwrap();
        assert_eq!(y.shape(), (2, 6, 5, 5));
        assert!(y.view().iter().all(|&v| v >= 0.0));
        // 只剩输入与输出.
        assert_eq!(ledger.live_maps(), 2);
        assert_eq!(vs.names()[0], "conv1.bn.bias");
    }
}
