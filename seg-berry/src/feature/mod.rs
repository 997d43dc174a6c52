//! 特征图 (feature map) 及其生命周期.
//!
//! 特征图是前向传播中产生的 `[batch, channel, height, width]` 四维 `f32` 数组.
//! 每个特征图在任意时刻只有一个所有者; 所有者负责释放它, 而 Rust 的 move
//! 语义保证它不会被释放两次, 也不会在释放后被使用.
//!
//! # 约定
//!
//! 1. 以 `&self` / `&FeatureMap` 接收输入的操作 **借用** 输入, 返回新的特征图,
//!    调用者仍需负责释放输入.
//! 2. 以 `self` 接收输入的操作 **消费** 输入. 名字以 `_` 结尾的操作
//!    (如 [`FeatureMap::relu_`]) 原地修改并返回同一块存储, 不产生新分配.
//! 3. 所有特征图都登记在某个 [`MemoryLedger`] 中; 派生出的特征图继承输入的账本.
//! 4. 追踪梯度的特征图持有自己的计算节点 (见 `autograd` 模块). 节点保存的
//!    中间量是普通数组, 不登记在账本中, 随输出特征图一起释放.

mod ledger;
mod ops;

use crate::autograd::{self, Gradients, Node};
use crate::error::{ShapeError, ShapeResult};
use crate::{Idx2d, Shape4};
use ndarray::{Array4, ArrayView4};
use std::fmt;
use std::mem;
use std::sync::Arc;

pub use ledger::{LedgerSnapshot, MemoryLedger};

pub(crate) use ops::output_len;

/// 特征图所在的设备.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Device {
    /// 主存.
    #[default]
    Cpu,
}

/// 单一所有者的四维特征图.
pub struct FeatureMap {
    data: Array4<f32>,
    ledger: Arc<MemoryLedger>,
    /// 登记在账本中的字节数.
    bytes: usize,
    device: Device,
    /// 产生该特征图的计算节点. `None` 表示不追踪梯度.
    grad_fn: Option<Arc<Node>>,
}

impl FeatureMap {
    /// 以一个新的独立账本包装 `data`.
    #[inline]
    pub fn new(data: Array4<f32>) -> Self {
        Self::with_ledger(data, &Arc::new(MemoryLedger::new()))
    }

    /// 以 `ledger` 包装 `data`. 非标准 (行优先) 布局的数据会被整理为标准布局.
    pub fn with_ledger(data: Array4<f32>, ledger: &Arc<MemoryLedger>) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        let bytes = data.len() * mem::size_of::<f32>();
        ledger.register(bytes);
        Self {
            data,
            ledger: Arc::clone(ledger),
            bytes,
            device: Device::Cpu,
            grad_fn: None,
        }
    }

    /// 由 `self` 派生一个新的特征图: 同一账本, 同一设备, 不带计算节点.
    ///
    /// 需要追踪梯度的算子随后经 [`autograd::record`] 挂上自己的节点.
    #[inline]
    pub(crate) fn derive(&self, data: Array4<f32>) -> Self {
        let mut out = Self::with_ledger(data, &self.ledger);
        out.device = self.device;
        out
    }

    /// 特征图形状 `(batch, channel, height, width)`.
    #[inline]
    pub fn shape(&self) -> Shape4 {
        self.data.dim()
    }

    /// 批大小.
    #[inline]
    pub fn batch(&self) -> usize {
        self.shape().0
    }

    /// 通道数.
    #[inline]
    pub fn channels(&self) -> usize {
        self.shape().1
    }

    /// 空间分辨率 (高, 宽).
    #[inline]
    pub fn spatial(&self) -> Idx2d {
        let (_, _, h, w) = self.shape();
        (h, w)
    }

    /// 元素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否存在长度为 0 的维度.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 获得底层数据的不可变视图.
    #[inline]
    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    /// 该特征图登记所在的账本.
    #[inline]
    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    /// 所在设备.
    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// 是否追踪梯度.
    #[inline]
    pub fn requires_grad(&self) -> bool {
        self.grad_fn.is_some()
    }

    /// 设置梯度追踪.
    ///
    /// `true` 把该特征图标记为计算图的叶子, 反向传播后可经 [`Gradients::wrt`]
    /// 取得关于它的梯度; `false` 把它从计算图中分离.
    #[inline]
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.grad_fn = requires_grad.then(Node::leaf);
        self
    }

    /// 以全 1 为输出梯度做反向传播, 即对 `sum(self)` 求梯度.
    pub fn backward(&self) -> ShapeResult<Gradients> {
        self.backward_with(&Array4::ones(self.shape()))
    }

    /// 以 `grad` 为输出梯度做反向传播.
    ///
    /// 不追踪梯度的特征图返回 [`ShapeError::Untracked`]; `grad` 形状须与特征图一致.
    pub fn backward_with(&self, grad: &Array4<f32>) -> ShapeResult<Gradients> {
        let node = self.grad_fn.as_ref().ok_or(ShapeError::Untracked)?;
        if grad.dim() != self.shape() {
            return Err(ShapeError::Incompatible {
                op: "backward",
                lhs: self.shape(),
                rhs: grad.dim(),
            });
        }
        log::debug!("backward from {node:?}");
        autograd::run(node, grad.as_standard_layout().into_owned())
    }

    /// 计算节点.
    #[inline]
    pub(crate) fn node(&self) -> Option<&Arc<Node>> {
        self.grad_fn.as_ref()
    }

    /// 计算节点的共享引用, 作为下游节点的输入.
    #[inline]
    pub(crate) fn input_node(&self) -> Option<Arc<Node>> {
        self.grad_fn.clone()
    }

    /// 换上新的计算节点.
    #[inline]
    pub(crate) fn with_node(mut self, node: Arc<Node>) -> Self {
        self.grad_fn = Some(node);
        self
    }

    /// 取走计算节点, 供原地操作把它接到新节点的输入上.
    #[inline]
    pub(crate) fn take_node(&mut self) -> Option<Arc<Node>> {
        self.grad_fn.take()
    }

    /// 显式释放. 等价于 `drop(self)`, 用于在代码中标出最后一次使用的位置.
    #[inline]
    pub fn release(self) {
        drop(self)
    }

    /// 取出底层数组. 该数组离开账本管理, 由调用者按普通 Rust 值处理.
    pub fn into_array(mut self) -> Array4<f32> {
        // `self` 随后 drop 时按原字节数注销.
        mem::replace(&mut self.data, Array4::zeros((0, 0, 0, 0)))
    }

    /// 原地修改存储. 仅供显式声明为原地操作的实现使用.
    #[inline]
    pub(crate) fn data_mut(&mut self) -> &mut Array4<f32> {
        &mut self.data
    }
}

impl Clone for FeatureMap {
    /// 深拷贝, 新存储同样登记在原账本中. 副本共享原特征图的计算节点.
    fn clone(&self) -> Self {
        let mut out = self.derive(self.data.clone());
        out.grad_fn = self.grad_fn.clone();
        out
    }
}

impl Drop for FeatureMap {
    fn drop(&mut self) {
        self.ledger.release(self.bytes);
    }
}

impl fmt::Debug for FeatureMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureMap")
            .field("shape", &self.shape())
            .field("device", &self.device)
            .field("grad_fn", &self.grad_fn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{FeatureMap, MemoryLedger};
    use ndarray::Array4;
    use std::sync::Arc;

    #[test]
    fn test_drop_releases_once() {
        let ledger = Arc::new(MemoryLedger::new());
        let a = FeatureMap::with_ledger(Array4::zeros((1, 2, 3, 4)), &ledger);
        let b = a.clone();
        assert_eq!(ledger.live_maps(), 2);
        assert_eq!(ledger.live_bytes(), 2 * 24 * 4);

        a.release();
        assert_eq!(ledger.live_maps(), 1);
        drop(b);
        assert_eq!(ledger.live_maps(), 0);
        assert_eq!(ledger.live_bytes(), 0);
    }

    #[test]
    fn test_into_array_leaves_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let a = FeatureMap::with_ledger(Array4::ones((2, 1, 2, 2)), &ledger);
        let raw = a.into_array();
        assert_eq!(raw.dim(), (2, 1, 2, 2));
        assert_eq!(ledger.live_maps(), 0);
        assert_eq!(ledger.live_bytes(), 0);
    }

    #[test]
    fn test_requires_grad_marks_leaf() {
        let ledger = Arc::new(MemoryLedger::new());
        let a = FeatureMap::with_ledger(Array4::ones((1, 1, 2, 2)), &ledger).with_requires_grad(true);
        assert!(a.requires_grad());
        let b = a.clone();
        assert!(b.requires_grad());
        let grads = b.backward().unwrap();
        assert_eq!(grads.wrt(&a).unwrap(), Array4::<f32>::ones((1, 1, 2, 2)));

        let c = a.with_requires_grad(false);
        assert!(!c.requires_grad());
        assert!(grads.wrt(&c).is_none());
    }

    #[test]
    fn test_non_standard_layout_is_normalized() {
        let raw = Array4::<f32>::zeros((2, 3, 4, 5)).permuted_axes([0, 1, 3, 2]);
        assert!(!raw.is_standard_layout());
        let fm = FeatureMap::new(raw);
        assert!(fm.view().is_standard_layout());
        assert_eq!(fm.shape(), (2, 3, 5, 4));
    }
}
