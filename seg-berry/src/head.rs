//! 分割头.

use crate::error::{ConfigError, ConfigResult, ShapeResult};
use crate::feature::FeatureMap;
use crate::nn::{Conv2d, ModuleT, Parameter, Path};
use crate::Idx2d;

/// 分割头: 一个带偏置的 `kernel x kernel` 卷积, 把解码器输出投影到类别 logits.
/// 填充为 `kernel / 2`, 奇数卷积核时不改变分辨率.
#[derive(Debug)]
pub struct SegmentationHead {
    conv: Conv2d,
    kernel: usize,
}

impl SegmentationHead {
    /// 参数名为 `{path}.weight` 与 `{path}.bias`.
    pub fn new(path: &Path, in_channels: usize, classes: usize, kernel: usize) -> ConfigResult<Self> {
        if classes == 0 {
            return Err(ConfigError::Zero("classes"));
        }
        Ok(Self {
            conv: Conv2d::new(path, in_channels, classes, kernel, 1, kernel / 2, true)?,
            kernel,
        })
    }

    /// 类别数.
    #[inline]
    pub fn classes(&self) -> usize {
        self.conv.out_channels()
    }

    /// 输入通道数.
    #[inline]
    pub fn in_channels(&self) -> usize {
        self.conv.in_channels()
    }

    /// 卷积核大小.
    #[inline]
    pub fn kernel(&self) -> usize {
        self.kernel
    }

    /// 输出空间分辨率.
    pub(crate) fn output_size(&self, input: Idx2d) -> ShapeResult<Idx2d> {
        self.conv.output_size(input)
    }
}

impl ModuleT for SegmentationHead {
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        self.conv.forward_t(x, train)
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.conv.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.conv.visit_parameters_mut(visitor);
    }
}
