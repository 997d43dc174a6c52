//! 完整的 UNet 分割模型.

use crate::config::UNetConfig;
use crate::decoder::UNetDecoder;
use crate::encoder::{Encoder, ResNetEncoder};
use crate::error::{ConfigResult, ShapeError, ShapeResult};
use crate::feature::FeatureMap;
use crate::head::SegmentationHead;
use crate::nn::{ModuleT, Parameter, VarStore};
use crate::Shape4;
use itertools::Itertools;
use log::{debug, info};

/// 不运行网络推算出的各阶段形状.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShapePlan {
    /// 输入形状.
    pub input: Shape4,

    /// 编码器各输出特征形状 (第一个为归一化输入).
    pub encoder: Vec<Shape4>,

    /// 解码器各阶段输出形状.
    pub decoder: Vec<Shape4>,

    /// 分割头输出形状 (解码器分辨率).
    pub head: Shape4,

    /// 最终输出形状 (输入分辨率).
    pub output: Shape4,
}

/// 编码器 + 解码器 + 分割头.
///
/// 构建后结构不可变. 多个线程可以同时对同一模型做推理;
/// 训练模式的前向传播只会修改批归一化滑动统计量.
#[derive(Debug)]
pub struct UNet {
    encoder: Box<dyn Encoder>,
    decoder: UNetDecoder,
    config: UNetConfig,
}

impl UNet {
    /// 按 `config` 构建. 参数名以 `encoder.`, `decoder.`, `segmentation_head.` 开头.
    ///
    /// 配置不自洽时返回 `Err`, 不会产生模型.
    pub fn new(config: &UNetConfig) -> ConfigResult<Self> {
        config.validate()?;
        let vs = VarStore::new(config.seed);
        let root = vs.root();
        let encoder = ResNetEncoder::new(&root.sub("encoder"), &config.encoder)?;
        // `validate` 已保证解码器通道非空.
        let last = config.decoder.channels.last().copied().unwrap_or_default();
        let head = SegmentationHead::new(
            &root.sub("segmentation_head"),
            last,
            config.classes,
            config.head_kernel,
        )?;
        let decoder = UNetDecoder::new(&root.sub("decoder"), encoder.out_channels(), &config.decoder, head)?;

        let model = Self {
            encoder: Box::new(encoder),
            decoder,
            config: config.clone(),
        };
        info!(
            "UNet built: encoder channels {:?}, decoder plan {:?}, attention {:?}, {} tensors / {} weights",
            model.encoder.out_channels(),
            config.stage_channels(),
            config.decoder.attention,
            vs.len(),
            model.num_parameters()
        );
        Ok(model)
    }

    /// 构建时使用的配置.
    #[inline]
    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    /// 编码器.
    #[inline]
    pub fn encoder(&self) -> &dyn Encoder {
        self.encoder.as_ref()
    }

    /// 解码器.
    #[inline]
    pub fn decoder(&self) -> &UNetDecoder {
        &self.decoder
    }

    /// 前向传播: `[B, C, H, W]` -> `[B, classes, H, W]` 的 logits.
    ///
    /// `image` 被借用; 所有中间特征图在返回前 (包括出错返回) 都已释放,
    /// 返回的 logits 归调用者所有, 并登记在 `image` 所在的账本中.
    pub fn forward(&self, image: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        let (_, c, h, w) = image.shape();
        let expected = self.config.encoder.in_channels;
        if c != expected {
            return Err(ShapeError::Channels {
                op: "unet input",
                expected,
                actual: c,
            });
        }
        let features = self.encoder.forward_all(image, train)?;
        let logits = self.decoder.forward_features(features, train)?;
        debug!("unet logits {:?} -> {:?}", logits.shape(), (h, w));
        logits.upsample_nearest((h, w))
    }

    /// 不运行网络, 推算输入形状为 `input` 时各阶段的输出形状.
    pub fn shape_plan(&self, input: Shape4) -> ShapeResult<ShapePlan> {
        let encoder = self.encoder.output_shapes(input)?;
        let (decoder, head) = self.decoder.output_shapes(&encoder)?;
        let (n, _, h, w) = input;
        Ok(ShapePlan {
            input,
            encoder,
            decoder,
            head,
            output: (n, head.1, h, w),
        })
    }

    /// 按名字排序的 `(参数名, 形状)` 列表.
    pub fn named_parameters(&self) -> Vec<(String, Vec<usize>)> {
        let mut out = Vec::new();
        self.visit_parameters(&mut |p| out.push((p.name().to_string(), p.shape().to_vec())));
        out.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)).collect()
    }

    /// 可读的参数清单, 每行 `名字 形状`.
    pub fn describe_parameters(&self) -> String {
        self.named_parameters()
            .into_iter()
            .map(|(name, shape)| format!("{name} {shape:?}"))
            .join("\n")
    }
}

impl ModuleT for UNet {
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        self.forward(x, train)
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.encoder.visit_parameters(visitor);
        self.decoder.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.encoder.visit_parameters_mut(visitor);
        self.decoder.visit_parameters_mut(visitor);
    }
}
