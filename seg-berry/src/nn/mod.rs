//! 带参数的网络层.
//!
//! 所有层都实现 [`ModuleT`]: 借用输入特征图, 返回新的特征图, 并可以遍历自身参数.
//! 参数在构建期通过 [`Path`] 以层级名 (如 `encoder.layer1.0.conv1.weight`)
//! 在 [`VarStore`] 中登记.

mod block;
mod conv;
mod norm;
mod store;

pub use block::ConvBnRelu;
pub use conv::Conv2d;
pub use norm::BatchNorm2d;
pub use store::{Path, VarStore};

use crate::error::ShapeResult;
use crate::feature::FeatureMap;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD};
use std::fmt;

/// 可训练 (或仅被保存的) 命名参数.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    value: ArrayD<f32>,
    trainable: bool,
}

impl Parameter {
    pub(crate) fn new(name: String, value: ArrayD<f32>, trainable: bool) -> Self {
        let value = if value.is_standard_layout() {
            value
        } else {
            value.as_standard_layout().into_owned()
        };
        Self {
            name,
            value,
            trainable,
        }
    }

    /// 完整层级名.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 参数值.
    #[inline]
    pub fn value(&self) -> ArrayViewD<'_, f32> {
        self.value.view()
    }

    /// 可变参数值. 形状在构建后固定, 外部只能改写数值.
    #[inline]
    pub fn value_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        self.value.view_mut()
    }

    /// 参数形状.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    /// 元素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// 是否由优化器更新. 批归一化的滑动统计量不可训练, 但会被保存.
    #[inline]
    pub fn trainable(&self) -> bool {
        self.trainable
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter(name={}, shape={:?}, trainable={})",
            self.name,
            self.shape(),
            self.trainable
        )
    }
}

/// 区分训练 / 推理模式的网络层.
///
/// 训练模式下, 批归一化使用批统计量并更新滑动统计量, 推理模式使用滑动统计量;
/// 含可训练参数的层在训练模式下总是为输出建立计算节点, 反向传播后按参数名给出梯度.
pub trait ModuleT: fmt::Debug + Send + Sync {
    /// 前向传播. 输入被借用, 调用者仍负责释放它.
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap>;

    /// 按固定顺序遍历参数.
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter));

    /// 按固定顺序遍历可变参数.
    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter));

    /// 参数元素总数.
    fn num_parameters(&self) -> usize {
        let mut total = 0;
        self.visit_parameters(&mut |p| total += p.len());
        total
    }
}
