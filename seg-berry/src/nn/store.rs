//! 参数登记与初始化.

use super::Parameter;
use crate::error::{ConfigError, ConfigResult};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::cell::RefCell;
use std::collections::BTreeSet;

/// 构建期参数仓库.
///
/// 负责两件事: 保证层级名唯一, 以及用固定种子的随机数生成器初始化参数.
/// 同一个种子总能构建出完全相同的模型.
#[derive(Debug)]
pub struct VarStore {
    rng: RefCell<StdRng>,
    names: RefCell<BTreeSet<String>>,
}

impl VarStore {
    /// 以种子 `seed` 创建仓库.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            names: RefCell::new(BTreeSet::new()),
        }
    }

    /// 根路径.
    #[inline]
    pub fn root(&self) -> Path<'_> {
        Path {
            store: self,
            segments: Vec::new(),
        }
    }

    /// 已登记参数个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.borrow().len()
    }

    /// 是否尚未登记任何参数.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.borrow().is_empty()
    }

    /// 按字典序列出已登记的参数名.
    pub fn names(&self) -> Vec<String> {
        self.names.borrow().iter().cloned().collect()
    }

    fn register(&self, name: String, value: ArrayD<f32>, trainable: bool) -> ConfigResult<Parameter> {
        if !self.names.borrow_mut().insert(name.clone()) {
            return Err(ConfigError::DuplicateParameter(name));
        }
        Ok(Parameter::new(name, value, trainable))
    }
}

/// [`VarStore`] 中的层级路径, 用 `.` 连接各段.
#[derive(Debug, Clone)]
pub struct Path<'a> {
    store: &'a VarStore,
    segments: Vec<String>,
}

impl<'a> Path<'a> {
    /// 子路径.
    pub fn sub<S: ToString>(&self, segment: S) -> Path<'a> {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Path {
            store: self.store,
            segments,
        }
    }

    /// 在该路径下的完整参数名.
    pub fn name_of(&self, leaf: &str) -> String {
        let mut name = self.segments.join(".");
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(leaf);
        name
    }

    /// Kaiming 正态初始化: `N(0, 2 / fan_in)`.
    pub fn kaiming_normal(&self, leaf: &str, shape: &[usize], fan_in: usize) -> ConfigResult<Parameter> {
        if fan_in == 0 {
            return Err(ConfigError::Zero("fan_in"));
        }
        let std = (2.0 / fan_in as f64).sqrt();
        let value = {
            let mut rng = self.store.rng.borrow_mut();
            ArrayD::from_shape_simple_fn(IxDyn(shape), || {
                let z: f64 = StandardNormal.sample(&mut *rng);
                (z * std) as f32
            })
        };
        self.store.register(self.name_of(leaf), value, true)
    }

    /// 全零可训练参数.
    pub fn zeros(&self, leaf: &str, shape: &[usize]) -> ConfigResult<Parameter> {
        self.store
            .register(self.name_of(leaf), ArrayD::zeros(IxDyn(shape)), true)
    }

    /// 全一可训练参数.
    pub fn ones(&self, leaf: &str, shape: &[usize]) -> ConfigResult<Parameter> {
        self.store
            .register(self.name_of(leaf), ArrayD::ones(IxDyn(shape)), true)
    }

    /// 不可训练的缓冲区 (如批归一化滑动统计量), 以 `fill` 填充.
    pub fn buffer(&self, leaf: &str, shape: &[usize], fill: f32) -> ConfigResult<Parameter> {
        self.store
            .register(self.name_of(leaf), ArrayD::from_elem(IxDyn(shape), fill), false)
    }
}
