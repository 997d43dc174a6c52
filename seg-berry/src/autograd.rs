//! 反向传播.
//!
//! 追踪梯度的特征图都带有一个计算节点 ([`Node`]), 节点记录产生它的算子,
//! 算子在前向传播时保存的中间量, 以及各输入的节点. 节点之间以 `Arc` 相连,
//! 整张计算图由输出特征图持有: 输出被释放时, 计算图随之释放.
//!
//! [`FeatureMap::backward_with`] 自输出节点起按拓扑逆序传播梯度,
//! 参数梯度按参数层级名累加进 [`Gradients`]; 外部优化器据此通过
//! [`crate::nn::ModuleT::visit_parameters_mut`] 更新参数.
//!
//! 参数梯度只在以下两种情形下被记录:
//!
//! 1. 训练模式下, 含可训练参数的层 (卷积, 批归一化) 总是记录;
//! 2. 任一输入追踪梯度时, 算子总是记录.

use crate::error::{ShapeError, ShapeResult};
use crate::feature::FeatureMap;
use ndarray::{Array4, ArrayD, ArrayView4, ArrayViewD, Dimension};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// 算子的反向规则.
pub(crate) trait Backward: Send + Sync {
    /// 算子名, 用于调试输出.
    fn name(&self) -> &'static str;

    /// 由输出梯度 `grad` 计算各输入的梯度 (与节点输入一一对应).
    ///
    /// `needs[i]` 为 `false` 的输入可以返回 `None`. 参数梯度直接累加进 `params`.
    fn backward(
        &self,
        grad: &Array4<f32>,
        needs: &[bool],
        params: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>>;
}

enum Kind {
    /// 用户显式标记追踪梯度的特征图.
    Leaf,
    Op(Box<dyn Backward>),
}

/// 计算图节点.
pub(crate) struct Node {
    id: usize,
    kind: Kind,
    inputs: Vec<Option<Arc<Node>>>,
}

impl Node {
    pub(crate) fn leaf() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind: Kind::Leaf,
            inputs: Vec::new(),
        })
    }

    pub(crate) fn op<B: Backward + 'static>(op: B, inputs: Vec<Option<Arc<Node>>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind: Kind::Op(Box::new(op)),
            inputs,
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    fn name(&self) -> &'static str {
        match &self.kind {
            Kind::Leaf => "leaf",
            Kind::Op(op) => op.name(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({}#{}, inputs={})", self.name(), self.id, self.inputs.len())
    }
}

/// 若 `force` 为真或任一输入追踪梯度, 为 `out` 挂上由 `make` 构造的计算节点.
///
/// `make` 只在需要时被调用 (可读取输出本身), 不追踪梯度时不保存任何中间量.
pub(crate) fn record<B, F>(
    out: FeatureMap,
    inputs: Vec<Option<Arc<Node>>>,
    force: bool,
    make: F,
) -> FeatureMap
where
    B: Backward + 'static,
    F: FnOnce(&FeatureMap) -> B,
{
    if !force && inputs.iter().all(Option::is_none) {
        return out;
    }
    let op = make(&out);
    out.with_node(Node::op(op, inputs))
}

/// 输入没有梯度需求时返回 `None`, 否则返回 `f()`.
#[inline]
pub(crate) fn when<F: FnOnce() -> Array4<f32>>(need: bool, f: F) -> Option<Array4<f32>> {
    need.then(f)
}

/// 一次反向传播得到的梯度.
#[derive(Debug, Default)]
pub struct Gradients {
    params: BTreeMap<String, ArrayD<f32>>,
    leaves: HashMap<usize, Array4<f32>>,
}

impl Gradients {
    /// 参数 `name` 的梯度.
    pub fn get(&self, name: &str) -> Option<ArrayViewD<'_, f32>> {
        self.params.get(name).map(|g| g.view())
    }

    /// 关于叶子特征图 `x` (经 [`FeatureMap::with_requires_grad`] 标记) 的梯度.
    pub fn wrt(&self, x: &FeatureMap) -> Option<ArrayView4<'_, f32>> {
        let id = x.node()?.id();
        self.leaves.get(&id).map(|g| g.view())
    }

    /// 按字典序列出有梯度的参数名.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// 有梯度的参数个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// 是否没有任何参数梯度.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// 把 `grad` 累加到参数 `name` 的梯度上.
    pub(crate) fn accumulate<D: Dimension>(&mut self, name: &str, grad: ndarray::Array<f32, D>) {
        let grad = grad.into_dyn();
        match self.params.get_mut(name) {
            Some(g) => *g += &grad,
            None => {
                self.params.insert(name.to_string(), grad);
            }
        }
    }
}

/// 后序遍历: 每个节点都排在它的全部输入之后.
fn topo_order(root: &Arc<Node>) -> Vec<Arc<Node>> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![(Arc::clone(root), false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !seen.insert(node.id) {
            continue;
        }
        stack.push((Arc::clone(&node), true));
        for input in node.inputs.iter().flatten() {
            if !seen.contains(&input.id) {
                stack.push((Arc::clone(input), false));
            }
        }
    }
    order
}

/// 自 `root` 起反向传播梯度 `seed`.
pub(crate) fn run(root: &Arc<Node>, seed: Array4<f32>) -> ShapeResult<Gradients> {
    let mut out = Gradients::default();
    let mut pending: HashMap<usize, Array4<f32>> = HashMap::new();
    pending.insert(root.id, seed);

    for node in topo_order(root).into_iter().rev() {
        let Some(grad) = pending.remove(&node.id) else {
            continue;
        };
        let op = match &node.kind {
            Kind::Leaf => {
                out.leaves.insert(node.id, grad);
                continue;
            }
            Kind::Op(op) => op,
        };
        let needs: Vec<bool> = node.inputs.iter().map(Option::is_some).collect();
        let grads = op.backward(&grad, &needs, &mut out)?;
        for (input, g) in node.inputs.iter().zip(grads) {
            let (Some(input), Some(g)) = (input, g) else {
                continue;
            };
            match pending.get_mut(&input.id) {
                Some(acc) => {
                    if acc.dim() != g.dim() {
                        return Err(ShapeError::Incompatible {
                            op: "backward",
                            lhs: acc.dim(),
                            rhs: g.dim(),
                        });
                    }
                    *acc += &g;
                }
                None => {
                    pending.insert(input.id, g);
                }
            }
        }
    }
    Ok(out)
}

/// 有限差分梯度检查用的工具.
#[cfg(test)]
pub(crate) mod check {
    use crate::feature::FeatureMap;
    use ndarray::Array4;

    /// 确定性的 "随机" 权重, 作为损失 `sum(y * r)` 的系数.
    pub fn weights(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array4::from_shape_fn(shape, |(b, c, y, x)| {
            (((b * 7 + c * 5 + y * 3 + x * 11) % 13) as f32 - 6.0) / 6.0
        })
    }

    /// `sum(y * r)`, 以 `f64` 累加.
    pub fn loss(y: &Array4<f32>, r: &Array4<f32>) -> f64 {
        y.iter().zip(r).map(|(&a, &b)| a as f64 * b as f64).sum()
    }

    /// 中心差分估计 `f` 关于 `x` 每个元素的导数.
    pub fn numeric<F: FnMut(&Array4<f32>) -> f64>(x: &Array4<f32>, eps: f32, mut f: F) -> Array4<f32> {
        let mut grad = Array4::zeros(x.dim());
        let mut shifted = x.clone();
        for (idx, g) in grad.indexed_iter_mut() {
            let v = x[idx];
            shifted[idx] = v + eps;
            let plus = f(&shifted);
            shifted[idx] = v - eps;
            let minus = f(&shifted);
            shifted[idx] = v;
            *g = ((plus - minus) / (2.0 * eps as f64)) as f32;
        }
        grad
    }

    /// 比较 `f` 关于输入 `x` 的解析梯度与数值梯度. 损失取 `sum(f(x) * r)`.
    pub fn input_grad<F: Fn(FeatureMap) -> FeatureMap>(x: &Array4<f32>, f: F) {
        let r = weights(f(FeatureMap::new(x.clone())).shape());
        let leaf = FeatureMap::new(x.clone()).with_requires_grad(true);
        let y = f(leaf.clone());
        assert!(y.requires_grad());
        let grads = y.backward_with(&r).unwrap();
        let analytic = grads.wrt(&leaf).unwrap().to_owned();
        let expected = numeric(x, 1e-2, |p| loss(&f(FeatureMap::new(p.clone())).into_array(), &r));
        assert_close(analytic.iter(), expected.iter(), 1e-2);
    }

    /// 逐元素比较, 允许 `tol * (1 + |expected|)` 的误差.
    pub fn assert_close<'a, 'b, I, J>(actual: I, expected: J, tol: f32)
    where
        I: IntoIterator<Item = &'a f32>,
        J: IntoIterator<Item = &'b f32>,
    {
        for (i, (&a, &e)) in actual.into_iter().zip(expected).enumerate() {
            assert!(
                (a - e).abs() <= tol * (1.0 + e.abs()),
                "element {i}: analytic {a} vs numeric {e}"
            );
        }
    }
}
