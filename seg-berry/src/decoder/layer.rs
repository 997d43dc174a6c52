//! 解码器阶段: 上采样, 与跳连拼接, 两个卷积块, 前后各一个门控.

use crate::attention::Attention;
use crate::config::AttentionKind;
use crate::consts::DECODER_BN_EPS;
use crate::error::{ConfigResult, ShapeError, ShapeResult};
use crate::feature::FeatureMap;
use crate::nn::{ConvBnRelu, ModuleT, Parameter, Path};

/// 解码器的一个阶段.
///
/// 有跳连时: 最近邻上采样到跳连分辨率 -> 通道拼接 -> 门控 1 -> 卷积块 1 -> 卷积块 2 -> 门控 2.
/// 没有跳连时 (最后一个阶段) 直接从卷积块 1 开始.
#[derive(Debug)]
pub struct DecoderLayer {
    conv1: ConvBnRelu,
    attention1: Attention,
    conv2: ConvBnRelu,
    attention2: Attention,
    in_channels: usize,
    skip_channels: usize,
    out_channels: usize,
}

impl DecoderLayer {
    /// 参数名为 `{path}.conv1.*`, `{path}.conv2.*`, `{path}.attention1.*`, `{path}.attention2.*`.
    ///
    /// `skip_channels == 0` 表示该阶段没有跳连, 此时门控 1 不存在.
    pub fn new(
        path: &Path,
        in_channels: usize,
        skip_channels: usize,
        out_channels: usize,
        attention: AttentionKind,
        reduction: usize,
    ) -> ConfigResult<Self> {
        let cat = in_channels + skip_channels;
        let attention1 = if skip_channels > 0 {
            Attention::new(&path.sub("attention1"), attention, cat, reduction)?
        } else {
            Attention::Identity
        };
        Ok(Self {
            conv1: ConvBnRelu::new(&path.sub("conv1"), cat, out_channels, 3, 1, 1, DECODER_BN_EPS)?,
            attention1,
            conv2: ConvBnRelu::new(&path.sub("conv2"), out_channels, out_channels, 3, 1, 1, DECODER_BN_EPS)?,
            attention2: Attention::new(&path.sub("attention2"), attention, out_channels, reduction)?,
            in_channels,
            skip_channels,
            out_channels,
        })
    }

    /// `(输入通道, 跳连通道, 输出通道)`.
    #[inline]
    pub fn channels(&self) -> (usize, usize, usize) {
        (self.in_channels, self.skip_channels, self.out_channels)
    }

    /// 门控种类.
    #[inline]
    pub fn attention(&self) -> AttentionKind {
        self.attention2.kind()
    }

    /// 前向传播. 消费 `x`; `skip` 被借用, 由调用者在之后释放.
    pub fn forward_skip(
        &self,
        x: FeatureMap,
        skip: Option<&FeatureMap>,
        train: bool,
    ) -> ShapeResult<FeatureMap> {
        if x.channels() != self.in_channels {
            return Err(ShapeError::Channels {
                op: "decoder input",
                expected: self.in_channels,
                actual: x.channels(),
            });
        }
        let x = match skip {
            Some(skip) => {
                if skip.channels() != self.skip_channels {
                    return Err(ShapeError::Channels {
                        op: "decoder skip",
                        expected: self.skip_channels,
                        actual: skip.channels(),
                    });
                }
                let up = x.upsample_nearest(skip.spatial())?;
                let cat = up.cat_channels(skip)?;
                up.release();
                self.attention1.forward_t(cat, train)?
            }
            None if self.skip_channels == 0 => x,
            None => {
                return Err(ShapeError::Channels {
                    op: "decoder skip",
                    expected: self.skip_channels,
                    actual: 0,
                })
            }
        };
        let y = self.conv1.forward_t(&x, train)?;
        x.release();
        let z = self.conv2.forward_t(&y, train)?;
        y.release();
        self.attention2.forward_t(z, train)
    }

    /// 遍历参数.
    pub fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.conv1.visit_parameters(visitor);
        self.attention1.visit_parameters(visitor);
        self.conv2.visit_parameters(visitor);
        self.attention2.visit_parameters(visitor);
    }

    /// 遍历可变参数.
    pub fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.conv1.visit_parameters_mut(visitor);
        self.attention1.visit_parameters_mut(visitor);
        self.conv2.visit_parameters_mut(visitor);
        self.attention2.visit_parameters_mut(visitor);
    }
}
