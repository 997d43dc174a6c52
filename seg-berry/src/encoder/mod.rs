//! 编码器: 输入图像 -> 由浅到深的特征图列表.

mod resnet;

pub use resnet::BasicBlock;

use crate::config::EncoderConfig;
use crate::error::{ConfigResult, ShapeError, ShapeResult};
use crate::feature::{output_len, FeatureMap};
use crate::nn::{ModuleT, Parameter, Path};
use crate::Shape4;
use log::debug;
use resnet::{LayerZero, ResLayer};
use std::fmt;

/// 编码器.
pub trait Encoder: fmt::Debug + Send + Sync {
    /// 前向传播, 返回由浅到深的全部特征图. 第一个为归一化后的输入拷贝.
    ///
    /// 返回的特征图全部归调用者所有.
    fn forward_all(&self, image: &FeatureMap, train: bool) -> ShapeResult<Vec<FeatureMap>>;

    /// 各输出特征的通道数, 与 `forward_all` 的输出一一对应.
    fn out_channels(&self) -> &[usize];

    /// 不运行网络, 仅由输入形状推算各输出特征的形状.
    fn output_shapes(&self, input: Shape4) -> ShapeResult<Vec<Shape4>>;

    /// 遍历参数.
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter));

    /// 遍历可变参数.
    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter));
}

/// ResNet 编码器 (基本块族: ResNet-18 / ResNet-34).
///
/// 输出 `depth + 1` 个特征: 归一化输入, 第 0 层 (1/4), 以及第 1 层起
/// 各阶段 (1/4, 1/8, 1/16, 1/32).
#[derive(Debug)]
pub struct ResNetEncoder {
    layer0: LayerZero,
    layers: Vec<ResLayer>,
    mean: Vec<f32>,
    std: Vec<f32>,
    out_channels: Vec<usize>,
}

impl ResNetEncoder {
    /// 按 `config` 在 `path` 下创建. 第 1 层步长为 1, 其余各层第一个块步长为 2.
    pub fn new(path: &Path, config: &EncoderConfig) -> ConfigResult<Self> {
        config.validate()?;
        let layer0 = LayerZero::new(path, config.in_channels, config.stem_channels)?;
        let mut layers = Vec::with_capacity(config.channels.len());
        let mut c_in = config.stem_channels;
        for (i, (&c_out, &count)) in config.channels.iter().zip(&config.repeats).enumerate() {
            let stride = if i == 0 { 1 } else { 2 };
            layers.push(ResLayer::new(
                &path.sub(format!("layer{}", i + 1)),
                c_in,
                c_out,
                stride,
                count,
            )?);
            c_in = c_out;
        }
        Ok(Self {
            layer0,
            layers,
            mean: config.mean.clone(),
            std: config.std.clone(),
            out_channels: config.out_channels(),
        })
    }

    /// 包括第 0 层在内的层数.
    #[inline]
    pub fn depth(&self) -> usize {
        self.layers.len() + 1
    }

    /// 各层基本块个数.
    pub fn repeats(&self) -> Vec<usize> {
        self.layers.iter().map(ResLayer::len).collect()
    }
}

impl Encoder for ResNetEncoder {
    fn forward_all(&self, image: &FeatureMap, train: bool) -> ShapeResult<Vec<FeatureMap>> {
        let mut features = Vec::with_capacity(self.depth() + 1);
        features.push(image.normalize(&self.mean, &self.std)?);
        let l0 = self.layer0.forward_t(&features[0], train)?;
        debug!("encoder layer0: {:?}", l0.shape());
        features.push(l0);
        for (i, layer) in self.layers.iter().enumerate() {
            let last = features.len() - 1;
            let y = layer.forward_t(&features[last], train)?;
            debug!("encoder layer{}: {:?}", i + 1, y.shape());
            features.push(y);
        }
        Ok(features)
    }

    fn out_channels(&self) -> &[usize] {
        &self.out_channels
    }

    fn output_shapes(&self, (n, c, h, w): Shape4) -> ShapeResult<Vec<Shape4>> {
        if c != self.out_channels[0] {
            return Err(ShapeError::Channels {
                op: "encoder",
                expected: self.out_channels[0],
                actual: c,
            });
        }
        let mut shapes = vec![(n, c, h, w)];
        let (k, s, p) = (LayerZero::KERNEL, LayerZero::STRIDE, LayerZero::PADDING);
        let hw = output_len("conv2d", (h, w), (k, k), (s, s), (p, p))?;
        let (k, s, p) = LayerZero::POOL;
        let mut hw = output_len("max_pool2d", hw, (k, k), (s, s), (p, p))?;
        shapes.push((n, self.out_channels[1], hw.0, hw.1));
        for (layer, &c) in self.layers.iter().zip(&self.out_channels[2..]) {
            let s = layer.stride();
            hw = output_len("conv2d", hw, (3, 3), (s, s), (1, 1))?;
            shapes.push((n, c, hw.0, hw.1));
        }
        Ok(shapes)
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.layer0.visit_parameters(visitor);
        self.layers.iter().for_each(|l| l.visit_parameters(visitor));
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.layer0.visit_parameters_mut(visitor);
        self.layers
            .iter_mut()
            .for_each(|l| l.visit_parameters_mut(visitor));
    }
}
