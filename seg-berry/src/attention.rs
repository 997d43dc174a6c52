//! 注意力门控.
//!
//! 解码器每一阶段在拼接之后、卷积块之后各有一个门控. 门控可以是恒等映射,
//! 也可以是 SCSE (concurrent spatial and channel squeeze & excitation):
//!
//! ```text
//! cg  = sigmoid(conv(relu(conv(avg_pool(x)))))   // [B, C, 1, 1]
//! sg  = sigmoid(conv(x))                         // [B, 1, H, W]
//! out = x * cg + x * sg
//! ```
//!
//! 门控不改变特征图形状.

use crate::autograd::{record, when, Backward, Gradients};
use crate::config::AttentionKind;
use crate::error::{ConfigError, ConfigResult, ShapeError, ShapeResult};
use crate::feature::FeatureMap;
use crate::nn::{Conv2d, ModuleT, Parameter, Path};
use ndarray::{Array4, Axis, Zip};

/// SCSE 门控参数.
#[derive(Debug)]
pub struct Scse {
    squeeze: Conv2d,
    excite: Conv2d,
    spatial: Conv2d,
    channels: usize,
    reduction: usize,
}

impl Scse {
    /// `channels / reduction` 必须为正.
    pub fn new(path: &Path, channels: usize, reduction: usize) -> ConfigResult<Self> {
        if channels == 0 {
            return Err(ConfigError::Zero("attention channels"));
        }
        if reduction == 0 {
            return Err(ConfigError::Zero("attention reduction"));
        }
        let squeezed = channels / reduction;
        if squeezed == 0 {
            return Err(ConfigError::ReductionTooLarge {
                channels,
                reduction,
            });
        }
        Ok(Self {
            squeeze: Conv2d::new(&path.sub("squeeze"), channels, squeezed, 1, 1, 0, true)?,
            excite: Conv2d::new(&path.sub("excite"), squeezed, channels, 1, 1, 0, true)?,
            spatial: Conv2d::new(&path.sub("spatial"), channels, 1, 1, 1, 0, true)?,
            channels,
            reduction,
        })
    }

    /// 门控通道数.
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// 缩减比例.
    #[inline]
    pub fn reduction(&self) -> usize {
        self.reduction
    }

    /// 通道门 `[B, C, 1, 1]`.
    fn channel_gate(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        let pooled = x.adaptive_avg_pool1()?;
        let squeezed = self.squeeze.forward_t(&pooled, train)?.relu_();
        pooled.release();
        Ok(self.excite.forward_t(&squeezed, train)?.sigmoid_())
    }
}

impl ModuleT for Scse {
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        if x.channels() != self.channels {
            return Err(ShapeError::Channels {
                op: "scse",
                expected: self.channels,
                actual: x.channels(),
            });
        }
        let cg = self.channel_gate(x, train)?;
        let sg = self.spatial.forward_t(x, train)?.sigmoid_();
        let out = Zip::from(x.view())
            .and_broadcast(cg.view())
            .and_broadcast(sg.view())
            .map_collect(|&v, &c, &s| v * c + v * s);
        let inputs = vec![x.input_node(), cg.input_node(), sg.input_node()];
        Ok(record(x.derive(out), inputs, false, |_| ScseBackward {
            x: x.view().to_owned(),
            cg: cg.view().to_owned(),
            sg: sg.view().to_owned(),
        }))
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.squeeze.visit_parameters(visitor);
        self.excite.visit_parameters(visitor);
        self.spatial.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.squeeze.visit_parameters_mut(visitor);
        self.excite.visit_parameters_mut(visitor);
        self.spatial.visit_parameters_mut(visitor);
    }
}

/// `out = x * cg + x * sg` 的反向规则.
struct ScseBackward {
    x: Array4<f32>,
    /// `[B, C, 1, 1]`.
    cg: Array4<f32>,
    /// `[B, 1, H, W]`.
    sg: Array4<f32>,
}

impl Backward for ScseBackward {
    fn name(&self) -> &'static str {
        "scse"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        needs: &[bool],
        _: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        let (n, c, _, _) = self.x.dim();
        let dx = when(needs[0], || {
            Zip::from(grad)
                .and_broadcast(self.cg.view())
                .and_broadcast(self.sg.view())
                .map_collect(|&g, &cv, &sv| g * (cv + sv))
        });
        let prod = grad * &self.x;
        let dcg = if needs[1] {
            let sum = prod.sum_axis(Axis(3)).sum_axis(Axis(2));
            Some(sum.into_shape((n, c, 1, 1))?)
        } else {
            None
        };
        let dsg = when(needs[2], || prod.sum_axis(Axis(1)).insert_axis(Axis(1)));
        Ok(vec![dx, dcg, dsg])
    }
}

/// 注意力门控.
#[derive(Debug)]
pub enum Attention {
    /// 恒等映射: 原样转交输入, 不复制.
    Identity,

    /// SCSE 门控.
    Scse(Scse),
}

impl Attention {
    /// 按 `kind` 在 `path` 下创建 `channels` 通道的门控.
    pub fn new(path: &Path, kind: AttentionKind, channels: usize, reduction: usize) -> ConfigResult<Self> {
        match kind {
            AttentionKind::Identity => Ok(Self::Identity),
            AttentionKind::Scse => Ok(Self::Scse(Scse::new(path, channels, reduction)?)),
        }
    }

    /// 门控种类.
    #[inline]
    pub fn kind(&self) -> AttentionKind {
        match self {
            Self::Identity => AttentionKind::Identity,
            Self::Scse(_) => AttentionKind::Scse,
        }
    }

    /// 前向传播. 消费输入: 恒等门控直接返回它, SCSE 门控在产生输出后释放它.
    pub fn forward_t(&self, x: FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        match self {
            Self::Identity => Ok(x),
            Self::Scse(scse) => scse.forward_t(&x, train),
        }
    }

    /// 遍历参数. 恒等门控没有参数.
    pub fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        if let Self::Scse(scse) = self {
            scse.visit_parameters(visitor);
        }
    }

    /// 遍历可变参数.
    pub fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        if let Self::Scse(scse) = self {
            scse.visit_parameters_mut(visitor);
        }
    }
}
