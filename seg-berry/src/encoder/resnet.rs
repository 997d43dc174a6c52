//! ResNet 基本构件.

use crate::consts::BN_EPS;
use crate::error::{ConfigResult, ShapeResult};
use crate::feature::FeatureMap;
use crate::nn::{BatchNorm2d, Conv2d, ModuleT, Parameter, Path};

/// 第 0 层: 7x7/2 卷积 -> 批归一化 -> ReLU -> 3x3/2 最大池化. 分辨率缩小为 1/4.
#[derive(Debug)]
pub(crate) struct LayerZero {
    conv1: Conv2d,
    bn1: BatchNorm2d,
}

impl LayerZero {
    pub(crate) const KERNEL: usize = 7;
    pub(crate) const STRIDE: usize = 2;
    pub(crate) const PADDING: usize = 3;
    pub(crate) const POOL: (usize, usize, usize) = (3, 2, 1);

    /// 参数名为 `{path}.conv1.*` 与 `{path}.bn1.*`.
    pub(crate) fn new(path: &Path, in_channels: usize, out_channels: usize) -> ConfigResult<Self> {
        Ok(Self {
            conv1: Conv2d::new(
                &path.sub("conv1"),
                in_channels,
                out_channels,
                Self::KERNEL,
                Self::STRIDE,
                Self::PADDING,
                false,
            )?,
            bn1: BatchNorm2d::new(&path.sub("bn1"), out_channels, BN_EPS)?,
        })
    }
}

impl ModuleT for LayerZero {
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        let y = self.conv1.forward_t(x, train)?;
        let y = self.bn1.normalize_(y, train)?.relu_();
        let (k, s, p) = Self::POOL;
        y.max_pool2d((k, k), (s, s), (p, p))
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.conv1.visit_parameters(visitor);
        self.bn1.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.conv1.visit_parameters_mut(visitor);
        self.bn1.visit_parameters_mut(visitor);
    }
}

/// 1x1 卷积 + 批归一化的投影捷径.
#[derive(Debug)]
struct Downsample {
    conv: Conv2d,
    bn: BatchNorm2d,
}

/// 残差基本块.
///
/// `main = bn2(conv2(relu(bn1(conv1(x)))))`, `out = relu(shortcut(x) + main)`.
/// 步长不为 1 或通道数改变时, 捷径是 1x1 卷积投影, 否则为恒等映射.
#[derive(Debug)]
pub struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    downsample: Option<Downsample>,
}

impl BasicBlock {
    /// 参数名为 `{path}.conv1`, `{path}.bn1`, `{path}.conv2`, `{path}.bn2`,
    /// 以及 (若有) `{path}.downsample.0` (卷积) 和 `{path}.downsample.1` (批归一化).
    pub fn new(path: &Path, in_channels: usize, out_channels: usize, stride: usize) -> ConfigResult<Self> {
        let downsample = if stride != 1 || in_channels != out_channels {
            let p = path.sub("downsample");
            Some(Downsample {
                conv: Conv2d::new(&p.sub(0), in_channels, out_channels, 1, stride, 0, false)?,
                bn: BatchNorm2d::new(&p.sub(1), out_channels, BN_EPS)?,
            })
        } else {
            None
        };
        Ok(Self {
            conv1: Conv2d::new(&path.sub("conv1"), in_channels, out_channels, 3, stride, 1, false)?,
            bn1: BatchNorm2d::new(&path.sub("bn1"), out_channels, BN_EPS)?,
            conv2: Conv2d::new(&path.sub("conv2"), out_channels, out_channels, 3, 1, 1, false)?,
            bn2: BatchNorm2d::new(&path.sub("bn2"), out_channels, BN_EPS)?,
            downsample,
        })
    }

    /// 捷径是否为投影.
    #[inline]
    pub fn has_projection(&self) -> bool {
        self.downsample.is_some()
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        let hidden = self.conv1.forward_t(x, train)?;
        let hidden = self.bn1.normalize_(hidden, train)?.relu_();
        let main = self.conv2.forward_t(&hidden, train)?;
        hidden.release();
        let main = self.bn2.normalize_(main, train)?;

        let out = match &self.downsample {
            Some(Downsample { conv, bn }) => {
                let shortcut = bn.normalize_(conv.forward_t(x, train)?, train)?;
                main.add_(&shortcut)?
            }
            None => main.add_(x)?,
        };
        Ok(out.relu_())
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.conv1.visit_parameters(visitor);
        self.bn1.visit_parameters(visitor);
        self.conv2.visit_parameters(visitor);
        self.bn2.visit_parameters(visitor);
        if let Some(Downsample { conv, bn }) = &self.downsample {
            conv.visit_parameters(visitor);
            bn.visit_parameters(visitor);
        }
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.conv1.visit_parameters_mut(visitor);
        self.bn1.visit_parameters_mut(visitor);
        self.conv2.visit_parameters_mut(visitor);
        self.bn2.visit_parameters_mut(visitor);
        if let Some(Downsample { conv, bn }) = &mut self.downsample {
            conv.visit_parameters_mut(visitor);
            bn.visit_parameters_mut(visitor);
        }
    }
}

/// 若干基本块串联成的一层. 只有第一个块可能改变分辨率与通道数.
#[derive(Debug)]
pub(crate) struct ResLayer {
    blocks: Vec<BasicBlock>,
    stride: usize,
}

impl ResLayer {
    /// 参数名为 `{path}.0.*`, `{path}.1.*`, ...
    pub(crate) fn new(
        path: &Path,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        count: usize,
    ) -> ConfigResult<Self> {
        let mut blocks = Vec::with_capacity(count);
        blocks.push(BasicBlock::new(&path.sub(0), in_channels, out_channels, stride)?);
        for i in 1..count {
            blocks.push(BasicBlock::new(&path.sub(i), out_channels, out_channels, 1)?);
        }
        Ok(Self { blocks, stride })
    }

    /// 第一个块的步长.
    #[inline]
    pub(crate) fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }
}

impl ModuleT for ResLayer {
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        let (first, rest) = match self.blocks.split_first() {
            Some(split) => split,
            None => return Ok(x.clone()),
        };
        let mut y = first.forward_t(x, train)?;
        for block in rest {
            // 旧的 `y` 在赋值时释放.
            y = block.forward_t(&y, train)?;
        }
        Ok(y)
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.blocks.iter().for_each(|b| b.visit_parameters(visitor));
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.blocks
            .iter_mut()
            .for_each(|b| b.visit_parameters_mut(visitor));
    }
}
