//! 二维批归一化.

use super::{ModuleT, Parameter, Path};
use crate::autograd::{Backward, Gradients, Node};
use crate::consts::BN_MOMENTUM;
use crate::error::{ConfigError, ConfigResult, ShapeError, ShapeResult};
use crate::feature::FeatureMap;
use ndarray::{Array1, Array4, Axis, Zip};
use std::sync::{Mutex, PoisonError};

/// 滑动统计量. 训练模式的前向传播会更新它们.
#[derive(Debug)]
struct RunningStats {
    mean: Parameter,
    var: Parameter,
}

/// 二维批归一化层.
///
/// 推理模式: `y = (x - running_mean) / sqrt(running_var + eps) * weight + bias`.
/// 训练模式使用当前批的均值与 (有偏) 方差, 并以动量 [`BN_MOMENTUM`]
/// 把 (无偏) 批统计量并入滑动统计量.
#[derive(Debug)]
pub struct BatchNorm2d {
    weight: Parameter,
    bias: Parameter,
    running: Mutex<RunningStats>,
    channels: usize,
    eps: f32,
}

impl BatchNorm2d {
    /// 在 `path` 下创建. `weight = 1`, `bias = 0`, 滑动均值 0, 滑动方差 1.
    pub fn new(path: &Path, channels: usize, eps: f32) -> ConfigResult<Self> {
        if channels == 0 {
            return Err(ConfigError::Zero("batch norm channels"));
        }
        Ok(Self {
            weight: path.ones("weight", &[channels])?,
            bias: path.zeros("bias", &[channels])?,
            running: Mutex::new(RunningStats {
                mean: path.buffer("running_mean", &[channels], 0.0)?,
                var: path.buffer("running_var", &[channels], 1.0)?,
            }),
            channels,
            eps,
        })
    }

    /// 通道数.
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// 数值稳定项.
    #[inline]
    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// 当前滑动均值与方差的拷贝.
    pub fn running_stats(&self) -> (Vec<f32>, Vec<f32>) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        (
            running.mean.value().iter().copied().collect(),
            running.var.value().iter().copied().collect(),
        )
    }

    /// 原地归一化, 消费并返回同一块存储.
    pub fn normalize_(&self, mut x: FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        let (n, c, h, w) = x.shape();
        if c != self.channels {
            return Err(ShapeError::Channels {
                op: "batch_norm",
                expected: self.channels,
                actual: c,
            });
        }
        let (mean, var) = if train {
            let count = n * h * w;
            if count == 0 {
                return Err(ShapeError::Empty {
                    op: "batch_norm",
                    shape: x.shape(),
                });
            }
            let stats = batch_stats(&x);
            self.update_running(&stats, count);
            stats.into_iter().unzip()
        } else {
            let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            (
                running.mean.value().iter().copied().collect::<Vec<_>>(),
                running.var.value().iter().copied().collect::<Vec<_>>(),
            )
        };

        // 训练模式下输出总是追踪梯度.
        let input = x.take_node();
        let force = train && self.weight.trainable();
        let inv_std: Vec<f32> = var.iter().map(|v| (v + self.eps).sqrt().recip()).collect();
        let xhat = (force || input.is_some()).then(|| {
            let mut xhat = x.view().to_owned();
            for (ci, mut plane) in xhat.axis_iter_mut(Axis(1)).enumerate() {
                let (m, k) = (mean[ci], inv_std[ci]);
                plane.mapv_inplace(|v| (v - m) * k);
            }
            xhat
        });

        let gamma = self.weight.value();
        let beta = self.bias.value();
        for (ci, mut plane) in x.data_mut().axis_iter_mut(Axis(1)).enumerate() {
            let scale = gamma[ci] * inv_std[ci];
            let (m, shift) = (mean[ci], beta[ci]);
            plane.mapv_inplace(|v| (v - m) * scale + shift);
        }

        Ok(match xhat {
            Some(xhat) => {
                let op = BatchNormBackward {
                    xhat,
                    inv_std,
                    gamma: gamma.iter().copied().collect(),
                    train,
                    weight_name: self.weight.name().to_string(),
                    bias_name: self.bias.name().to_string(),
                };
                x.with_node(Node::op(op, vec![input]))
            }
            None => x,
        })
    }

    fn update_running(&self, stats: &[(f32, f32)], count: usize) {
        let unbias = if count > 1 {
            count as f32 / (count - 1) as f32
        } else {
            1.0
        };
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let RunningStats { mean, var } = &mut *running;
        for ((rm, rv), &(bm, bv)) in mean
            .value_mut()
            .iter_mut()
            .zip(var.value_mut().iter_mut())
            .zip(stats)
        {
            *rm = (1.0 - BN_MOMENTUM) * *rm + BN_MOMENTUM * bm;
            *rv = (1.0 - BN_MOMENTUM) * *rv + BN_MOMENTUM * bv * unbias;
        }
    }
}

/// 逐通道的 (均值, 有偏方差).
fn batch_stats(x: &FeatureMap) -> Vec<(f32, f32)> {
    x.view()
        .axis_iter(Axis(1))
        .map(|plane| {
            let len = plane.len() as f32;
            let mean = plane.sum() / len;
            let var = plane.fold(0.0, |acc, &v| acc + (v - mean) * (v - mean)) / len;
            (mean, var)
        })
        .collect()
}

/// 批归一化的反向规则.
///
/// 训练模式: `dx = gamma * inv_std * (dy - mean(dy) - xhat * mean(dy * xhat))`;
/// 推理模式统计量是常量: `dx = gamma * inv_std * dy`.
struct BatchNormBackward {
    xhat: Array4<f32>,
    inv_std: Vec<f32>,
    gamma: Vec<f32>,
    train: bool,
    weight_name: String,
    bias_name: String,
}

impl Backward for BatchNormBackward {
    fn name(&self) -> &'static str {
        "batch_norm"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        needs: &[bool],
        params: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        let channels = self.gamma.len();
        let mut dgamma = Array1::<f32>::zeros(channels);
        let mut dbeta = Array1::<f32>::zeros(channels);
        let mut dx = needs[0].then(|| grad.clone());

        for (ci, (dy, xhat)) in grad
            .axis_iter(Axis(1))
            .zip(self.xhat.axis_iter(Axis(1)))
            .enumerate()
        {
            let sum_dy = dy.sum();
            let sum_dy_xhat = Zip::from(&dy).and(&xhat).fold(0.0, |acc, &g, &v| acc + g * v);
            dbeta[ci] = sum_dy;
            dgamma[ci] = sum_dy_xhat;

            let Some(dx) = dx.as_mut() else {
                continue;
            };
            let k = self.gamma[ci] * self.inv_std[ci];
            let mut plane = dx.index_axis_mut(Axis(1), ci);
            if self.train {
                let count = dy.len() as f32;
                let (mean_dy, mean_dy_xhat) = (sum_dy / count, sum_dy_xhat / count);
                Zip::from(&mut plane)
                    .and(&xhat)
                    .for_each(|d, &v| *d = k * (*d - mean_dy - v * mean_dy_xhat));
            } else {
                plane.mapv_inplace(|d| d * k);
            }
        }

        params.accumulate(&self.weight_name, dgamma);
        params.accumulate(&self.bias_name, dbeta);
        Ok(vec![dx])
    }
}

impl ModuleT for BatchNorm2d {
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        self.normalize_(x.clone(), train)
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        visitor(&self.weight);
        visitor(&self.bias);
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        visitor(&running.mean);
        visitor(&running.var);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        visitor(&mut self.weight);
        visitor(&mut self.bias);
        let running = self.running.get_mut().unwrap_or_else(PoisonError::into_inner);
        visitor(&mut running.mean);
        visitor(&mut running.var);
    }
}

#[cfg(test)]
mod tests {
    use super::BatchNorm2d;
    use crate::consts::BN_EPS;
    use crate::feature::FeatureMap;
    use crate::autograd::check;
    use crate::nn::{ModuleT, VarStore};
    use ndarray::{Array1, Array4};

    #[test]
    fn test_eval_uses_running_stats() {
        let vs = VarStore::new(0);
        let bn = BatchNorm2d::new(&vs.root().sub("bn1"), 2, 0.0).unwrap();
        let x = FeatureMap::new(Array4::from_shape_vec((1, 2, 1, 2), vec![1.0f32, -2.0, 3.0, 4.0]).unwrap());
        // running mean 0, var 1, eps 0: 恒等映射.
        let y = bn.forward_t(&x, false).unwrap();
        assert_eq!(y.view(), x.view());
        assert_eq!(bn.running_stats(), (vec![0.0, 0.0], vec![1.0, 1.0]));
    }

    #[test]
    fn test_train_normalizes_and_updates() {
        let vs = VarStore::new(0);
        let bn = BatchNorm2d::new(&vs.root(), 1, BN_EPS).unwrap();
        let x = FeatureMap::new(Array4::from_shape_vec((1, 1, 2, 2), vec![1.0f32, 3.0, 1.0, 3.0]).unwrap());
        let y = bn.forward_t(&x, true).unwrap();
        let sum: f32 = y.view().sum();
        assert!(sum.abs() < 1e-5);
        assert!((y.view()[[0, 0, 0, 1]] - 1.0).abs() < 1e-3);

        let (mean, var) = bn.running_stats();
        // 0.9 * 0 + 0.1 * 2; 0.9 * 1 + 0.1 * (1 * 4 / 3).
        assert!((mean[0] - 0.2).abs() < 1e-6);
        assert!((var[0] - (0.9 + 0.4 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn test_parameter_names() {
        let vs = VarStore::new(0);
        let bn = BatchNorm2d::new(&vs.root().sub("bn1"), 4, BN_EPS).unwrap();
        let mut names = Vec::new();
        bn.visit_parameters(&mut |p| names.push((p.name().to_string(), p.trainable())));
        assert_eq!(
            names,
            vec![
                ("bn1.weight".to_string(), true),
                ("bn1.bias".to_string(), true),
                ("bn1.running_mean".to_string(), false),
                ("bn1.running_var".to_string(), false),
            ]
        );
        assert!(bn
            .forward_t(&FeatureMap::new(Array4::zeros((1, 3, 2, 2))), false)
            .is_err());
    }

    fn sample() -> Array4<f32> {
        Array4::from_shape_fn((2, 2, 3, 3), |(b, c, y, x)| {
            ((b * 11 + c * 5 + y * 7 + x * 3) % 10) as f32 * 0.3 - 1.2 + c as f32
        })
    }

    #[test]
    fn test_input_gradient_both_modes() {
        let vs = VarStore::new(0);
        let mut bn = BatchNorm2d::new(&vs.root().sub("bn"), 2, BN_EPS).unwrap();
        bn.visit_parameters_mut(&mut |p| {
            let v = match p.name() {
                "bn.weight" => [1.5, -0.5],
                "bn.bias" => [0.25, 0.1],
                "bn.running_mean" => [0.3, 0.8],
                _ => [2.0, 0.5],
            };
            p.value_mut().assign(&Array1::from_vec(v.to_vec()).into_dyn());
        });
        let x = sample();
        check::input_grad(&x, |x| bn.forward_t(&x, true).unwrap());
        check::input_grad(&x, |x| bn.forward_t(&x, false).unwrap());
    }

    #[test]
    fn test_affine_gradients() {
        let vs = VarStore::new(0);
        let bn = BatchNorm2d::new(&vs.root().sub("bn"), 2, BN_EPS).unwrap();
        let x = FeatureMap::new(sample());
        let r = check::weights((2, 2, 3, 3));

        let y = bn.forward_t(&x, true).unwrap();
        assert!(y.requires_grad());
        let grads = y.backward_with(&r).unwrap();
        assert_eq!(grads.names().collect::<Vec<_>>(), ["bn.bias", "bn.weight"]);

        // gamma = 1, beta = 0: y 就是 xhat, dgamma = sum(r * y), dbeta = sum(r).
        let yv = y.view();
        for ci in 0..2 {
            let mut dgamma = 0.0f32;
            let mut dbeta = 0.0f32;
            for ((b, c, h, w), &g) in r.indexed_iter() {
                if c == ci {
                    dgamma += g * yv[[b, c, h, w]];
                    dbeta += g;
                }
            }
            assert!((grads.get("bn.weight").unwrap()[[ci]] - dgamma).abs() < 1e-4);
            assert!((grads.get("bn.bias").unwrap()[[ci]] - dbeta).abs() < 1e-4);
        }

        // 推理模式且输入不追踪梯度: 不建立计算图.
        assert!(!bn.forward_t(&x, false).unwrap().requires_grad());
    }
}
