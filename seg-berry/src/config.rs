//! 构建期配置.
//!
//! 配置在构建模型时一次性传入, 模型构建完成后结构不再改变.
//! 默认配置即 ResNet-34 编码器 + 五阶段解码器 + 恒等注意力 + 单类别输出.

use crate::consts::arch::{
    DECODER_CHANNELS, RESNET18_REPEATS, RESNET34_REPEATS, RESNET_CHANNELS, STEM_CHANNELS,
};
use crate::consts::{IMAGENET_MEAN, IMAGENET_STD, SCSE_REDUCTION};
use crate::error::{ConfigError, ConfigResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 注意力门控种类.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum AttentionKind {
    /// 恒等映射.
    #[default]
    Identity,

    /// SCSE 门控.
    Scse,
}

/// ResNet 编码器配置.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderConfig {
    /// 输入图像通道数.
    pub in_channels: usize,

    /// 第 0 层 (stem) 输出通道数.
    pub stem_channels: usize,

    /// 第 1 层起各阶段输出通道数.
    pub channels: Vec<usize>,

    /// 第 1 层起各阶段基本块个数.
    pub repeats: Vec<usize>,

    /// 输入逐通道归一化均值.
    pub mean: Vec<f32>,

    /// 输入逐通道归一化标准差.
    pub std: Vec<f32>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::resnet34()
    }
}

impl EncoderConfig {
    /// ResNet-34: 各阶段 `[3, 4, 6, 3]` 个基本块.
    pub fn resnet34() -> Self {
        Self::resnet_with(&RESNET34_REPEATS)
    }

    /// ResNet-18: 各阶段 `[2, 2, 2, 2]` 个基本块.
    pub fn resnet18() -> Self {
        Self::resnet_with(&RESNET18_REPEATS)
    }

    fn resnet_with(repeats: &[usize]) -> Self {
        Self {
            in_channels: IMAGENET_MEAN.len(),
            stem_channels: STEM_CHANNELS,
            channels: RESNET_CHANNELS.to_vec(),
            repeats: repeats.to_vec(),
            mean: IMAGENET_MEAN.to_vec(),
            std: IMAGENET_STD.to_vec(),
        }
    }

    /// 替换各阶段通道数与基本块个数.
    pub fn with_stages(mut self, channels: Vec<usize>, repeats: Vec<usize>) -> Self {
        self.channels = channels;
        self.repeats = repeats;
        self
    }

    /// 替换 stem 输出通道数.
    pub fn with_stem_channels(mut self, stem_channels: usize) -> Self {
        self.stem_channels = stem_channels;
        self
    }

    /// 替换输入通道数及其归一化参数.
    pub fn with_input(mut self, mean: Vec<f32>, std: Vec<f32>) -> Self {
        self.in_channels = mean.len();
        self.mean = mean;
        self.std = std;
        self
    }

    /// 输出特征个数减一, 即包括第 0 层在内的层数.
    #[inline]
    pub fn depth(&self) -> usize {
        self.channels.len() + 1
    }

    /// 编码器全部输出特征的通道数, 第一个为输入本身.
    ///
    /// 默认配置为 `[3, 64, 64, 128, 256, 512]`.
    pub fn out_channels(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.depth() + 1);
        out.push(self.in_channels);
        out.push(self.stem_channels);
        out.extend_from_slice(&self.channels);
        out
    }

    /// 检查配置自洽.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.in_channels == 0 {
            return Err(ConfigError::Zero("encoder in_channels"));
        }
        if self.stem_channels == 0 {
            return Err(ConfigError::Zero("encoder stem_channels"));
        }
        if self.channels.len() != self.repeats.len() {
            return Err(ConfigError::RepeatCountMismatch {
                channels: self.channels.len(),
                repeats: self.repeats.len(),
            });
        }
        if self.channels.is_empty() {
            return Err(ConfigError::Zero("encoder stage count"));
        }
        if let Some(i) = self.repeats.iter().position(|&r| r == 0) {
            return Err(ConfigError::EmptyStage { stage: i + 1 });
        }
        if self.channels.contains(&0) {
            return Err(ConfigError::Zero("encoder stage channels"));
        }
        let bad_std = self.std.iter().any(|s| s.is_nan() || *s <= 0.0);
        if self.mean.len() != self.in_channels || self.std.len() != self.in_channels || bad_std {
            return Err(ConfigError::Normalization {
                channels: self.in_channels,
            });
        }
        Ok(())
    }
}

/// UNet 解码器配置.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct DecoderConfig {
    /// 各阶段输出通道数, 由深到浅.
    pub channels: Vec<usize>,

    /// 各阶段注意力门控种类 (同一阶段的两个门控相同).
    pub attention: Vec<AttentionKind>,

    /// SCSE 缩减比例.
    pub reduction: usize,

    /// 是否在最深特征上使用中心块 (两个卷积块). 默认为恒等映射.
    pub center: bool,

    /// 解码器期望的编码器输出通道. 若给出, 构建时必须与编码器实际通道一致.
    pub encoder_channels: Option<Vec<usize>>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            channels: DECODER_CHANNELS.to_vec(),
            attention: vec![AttentionKind::Identity; DECODER_CHANNELS.len()],
            reduction: SCSE_REDUCTION,
            center: false,
            encoder_channels: None,
        }
    }
}

impl DecoderConfig {
    /// 所有阶段使用同一种门控.
    pub fn with_attention(mut self, kind: AttentionKind) -> Self {
        self.attention = vec![kind; self.channels.len()];
        self
    }

    /// 替换各阶段输出通道数. 注意力配置随之重置为同一种 (沿用第一个阶段的种类).
    pub fn with_channels(mut self, channels: Vec<usize>) -> Self {
        let kind = self.attention.first().copied().unwrap_or_default();
        self.attention = vec![kind; channels.len()];
        self.channels = channels;
        self
    }

    /// 替换 SCSE 缩减比例.
    pub fn with_reduction(mut self, reduction: usize) -> Self {
        self.reduction = reduction;
        self
    }

    /// 打开 / 关闭中心块.
    pub fn with_center(mut self, center: bool) -> Self {
        self.center = center;
        self
    }

    /// 声明期望的编码器输出通道.
    pub fn expecting(mut self, encoder_channels: Vec<usize>) -> Self {
        self.encoder_channels = Some(encoder_channels);
        self
    }

    /// 阶段数.
    #[inline]
    pub fn depth(&self) -> usize {
        self.channels.len()
    }
}

/// 模型完整配置.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct UNetConfig {
    /// 编码器.
    pub encoder: EncoderConfig,

    /// 解码器.
    pub decoder: DecoderConfig,

    /// 输出类别数.
    pub classes: usize,

    /// 分割头卷积核大小, 填充为 `head_kernel / 2`.
    pub head_kernel: usize,

    /// 参数初始化种子.
    pub seed: u64,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::default(),
            decoder: DecoderConfig::default(),
            classes: 1,
            head_kernel: 3,
            seed: 0,
        }
    }
}

impl UNetConfig {
    /// 替换编码器配置.
    pub fn with_encoder(mut self, encoder: EncoderConfig) -> Self {
        self.encoder = encoder;
        self
    }

    /// 替换解码器配置.
    pub fn with_decoder(mut self, decoder: DecoderConfig) -> Self {
        self.decoder = decoder;
        self
    }

    /// 所有解码阶段使用同一种门控.
    pub fn with_attention(mut self, kind: AttentionKind) -> Self {
        self.decoder = self.decoder.with_attention(kind);
        self
    }

    /// 替换类别数.
    pub fn with_classes(mut self, classes: usize) -> Self {
        self.classes = classes;
        self
    }

    /// 替换分割头卷积核大小.
    pub fn with_head_kernel(mut self, head_kernel: usize) -> Self {
        self.head_kernel = head_kernel;
        self
    }

    /// 替换初始化种子.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// 解码器各阶段的 `(输入通道, 跳连通道, 输出通道)`.
    ///
    /// 跳连通道取自编码器特征 (去掉第一个, 由深到浅), 最后一个阶段没有跳连.
    /// 默认配置为 `(512, 256, 256), (256, 128, 128), (128, 64, 64), (64, 64, 32), (32, 0, 16)`.
    pub fn stage_channels(&self) -> Vec<(usize, usize, usize)> {
        crate::decoder::stage_channels(&self.encoder.out_channels(), &self.decoder.channels)
    }

    /// 检查配置自洽. [`crate::UNet::new`] 会先调用它.
    pub fn validate(&self) -> ConfigResult<()> {
        self.encoder.validate()?;
        let depth = self.encoder.depth();
        if self.decoder.depth() != depth {
            return Err(ConfigError::DepthMismatch {
                encoder: depth,
                decoder: self.decoder.depth(),
            });
        }
        if self.decoder.attention.len() != self.decoder.depth() {
            return Err(ConfigError::AttentionLenMismatch {
                stages: self.decoder.depth(),
                attention: self.decoder.attention.len(),
            });
        }
        if self.decoder.channels.contains(&0) {
            return Err(ConfigError::Zero("decoder channels"));
        }
        if let Some(expected) = &self.decoder.encoder_channels {
            let actual = self.encoder.out_channels();
            if expected.len() != actual.len() {
                return Err(ConfigError::DepthMismatch {
                    encoder: depth,
                    decoder: expected.len().saturating_sub(1),
                });
            }
            if let Some((stage, (&e, &a))) = expected
                .iter()
                .zip(actual.iter())
                .enumerate()
                .find(|(_, (e, a))| e != a)
            {
                return Err(ConfigError::ChannelMismatch {
                    stage,
                    expected: e,
                    actual: a,
                });
            }
        }
        if self.classes == 0 {
            return Err(ConfigError::Zero("classes"));
        }
        if self.head_kernel == 0 {
            return Err(ConfigError::Zero("head_kernel"));
        }
        let reduction = self.decoder.reduction;
        for ((i, s, o), kind) in self.stage_channels().into_iter().zip(&self.decoder.attention) {
            if *kind != AttentionKind::Scse {
                continue;
            }
            if reduction == 0 {
                return Err(ConfigError::Zero("attention reduction"));
            }
            // 无跳连阶段的第一个门控不会被使用.
            let gated = if s == 0 { [o, o] } else { [i + s, o] };
            if let Some(&channels) = gated.iter().find(|&&c| c / reduction == 0) {
                return Err(ConfigError::ReductionTooLarge {
                    channels,
                    reduction,
                });
            }
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
impl UNetConfig {
    /// 以 `bincode` 序列化.
    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// 从 `bincode` 字节流反序列化. 不做自洽检查.
    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::{AttentionKind, DecoderConfig, EncoderConfig, UNetConfig};
    use crate::error::ConfigError;

    #[test]
    fn test_default_plan() {
        let cfg = UNetConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.encoder.out_channels(), vec![3, 64, 64, 128, 256, 512]);
        assert_eq!(
            cfg.stage_channels(),
            vec![
                (512, 256, 256),
                (256, 128, 128),
                (128, 64, 64),
                (64, 64, 32),
                (32, 0, 16)
            ]
        );
    }

    #[test]
    fn test_repeat_count_errors() {
        let enc = EncoderConfig::resnet34().with_stages(vec![64, 128, 256, 512], vec![3, 4, 6]);
        assert_eq!(
            UNetConfig::default().with_encoder(enc).validate(),
            Err(ConfigError::RepeatCountMismatch {
                channels: 4,
                repeats: 3
            })
        );

        let enc = EncoderConfig::resnet18().with_stages(vec![64, 128, 256, 512], vec![2, 0, 2, 2]);
        assert_eq!(enc.validate(), Err(ConfigError::EmptyStage { stage: 2 }));
    }

    #[test]
    fn test_decoder_mismatch_errors() {
        let dec = DecoderConfig::default().with_channels(vec![256, 128, 64, 32]);
        assert_eq!(
            UNetConfig::default().with_decoder(dec).validate(),
            Err(ConfigError::DepthMismatch {
                encoder: 5,
                decoder: 4
            })
        );

        let dec = DecoderConfig::default().expecting(vec![3, 64, 64, 128, 256, 1024]);
        assert_eq!(
            UNetConfig::default().with_decoder(dec).validate(),
            Err(ConfigError::ChannelMismatch {
                stage: 5,
                expected: 1024,
                actual: 512
            })
        );

        let mut dec = DecoderConfig::default();
        dec.attention.pop();
        assert!(matches!(
            UNetConfig::default().with_decoder(dec).validate(),
            Err(ConfigError::AttentionLenMismatch { stages: 5, attention: 4 })
        ));
    }

    #[test]
    fn test_scse_reduction_check() {
        // 16 通道的最后一阶段无法以 32 缩减.
        let cfg = UNetConfig::default().with_decoder(
            DecoderConfig::default()
                .with_attention(AttentionKind::Scse)
                .with_reduction(32),
        );
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ReductionTooLarge {
                channels: 16,
                reduction: 32
            })
        );
        UNetConfig::default()
            .with_attention(AttentionKind::Scse)
            .validate()
            .unwrap();
    }

    #[test]
    fn test_normalization_check() {
        let enc = EncoderConfig::default().with_input(vec![0.5], vec![0.0]);
        assert_eq!(
            enc.validate(),
            Err(ConfigError::Normalization { channels: 1 })
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_bincode_round_trip() {
        let cfg = UNetConfig::default()
            .with_encoder(EncoderConfig::resnet18())
            .with_attention(AttentionKind::Scse)
            .with_classes(3)
            .with_seed(42);
        let bytes = cfg.to_bytes().unwrap();
        assert_eq!(UNetConfig::from_bytes(&bytes).unwrap(), cfg);
    }
}
