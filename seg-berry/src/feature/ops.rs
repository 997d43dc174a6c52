//! 特征图上的无参数算子及其反向规则.

use super::FeatureMap;
use crate::autograd::{record, when, Backward, Gradients};
use crate::error::{ShapeError, ShapeResult};
use crate::{Idx2d, Shape4};
use ndarray::{concatenate, s, Array4, Axis, Zip};

/// 计算滑动窗口 (卷积 / 池化) 的输出分辨率.
///
/// 窗口大于填充后的输入, 或步长为 0 时返回 `Err`.
pub(crate) fn output_len(
    op: &'static str,
    (h, w): Idx2d,
    (kh, kw): Idx2d,
    (sh, sw): Idx2d,
    (ph, pw): Idx2d,
) -> ShapeResult<Idx2d> {
    let (ih, iw) = (h + 2 * ph, w + 2 * pw);
    if kh == 0 || kw == 0 || sh == 0 || sw == 0 || ih < kh || iw < kw {
        return Err(ShapeError::WindowTooLarge {
            op,
            window: (kh, kw),
            input: (ih, iw),
        });
    }
    Ok(((ih - kh) / sh + 1, (iw - kw) / sw + 1))
}

/// 池化窗口内没有真实像素.
const NO_ARGMAX: usize = usize::MAX;

impl FeatureMap {
    /// 逐通道归一化: `(x - mean[c]) / std[c]`.
    ///
    /// `mean` 和 `std` 的长度必须等于通道数.
    pub fn normalize(&self, mean: &[f32], std: &[f32]) -> ShapeResult<FeatureMap> {
        let c = self.channels();
        if mean.len() != c || std.len() != c {
            return Err(ShapeError::Channels {
                op: "normalize",
                expected: mean.len().min(std.len()),
                actual: c,
            });
        }
        let mut out = self.data.clone();
        for (ci, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (mean[ci], std[ci]);
            plane.mapv_inplace(|v| (v - m) / s);
        }
        Ok(record(self.derive(out), vec![self.input_node()], false, |_| {
            NormalizeBackward {
                inv_std: std.iter().map(|s| s.recip()).collect(),
            }
        }))
    }

    /// 原地 ReLU.
    #[inline]
    pub fn relu_(mut self) -> FeatureMap {
        let input = self.take_node();
        self.data_mut().mapv_inplace(|v| v.max(0.0));
        record(self, vec![input], false, |y| ReluBackward {
            mask: y.data.mapv(|v| v > 0.0),
        })
    }

    /// 原地 sigmoid.
    #[inline]
    pub fn sigmoid_(mut self) -> FeatureMap {
        let input = self.take_node();
        self.data_mut().mapv_inplace(sigmoid);
        record(self, vec![input], false, |y| SigmoidBackward { y: y.data.clone() })
    }

    /// sigmoid, 返回新的特征图.
    #[inline]
    pub fn sigmoid(&self) -> FeatureMap {
        let out = self.derive(self.data.mapv(sigmoid));
        record(out, vec![self.input_node()], false, |y| SigmoidBackward { y: y.data.clone() })
    }

    /// 原地逐元素相加: `self += other`. 两者形状必须一致.
    pub fn add_(mut self, other: &FeatureMap) -> ShapeResult<FeatureMap> {
        if self.shape() != other.shape() {
            return Err(ShapeError::Incompatible {
                op: "add",
                lhs: self.shape(),
                rhs: other.shape(),
            });
        }
        let lhs = self.take_node();
        *self.data_mut() += &other.data;
        Ok(record(self, vec![lhs, other.input_node()], false, |_| AddBackward))
    }

    /// 二维最大池化. 填充区域视为负无穷.
    pub fn max_pool2d(&self, kernel: Idx2d, stride: Idx2d, padding: Idx2d) -> ShapeResult<Self> {
        let (n, c, h, w) = self.shape();
        let (oh, ow) = output_len("max_pool2d", (h, w), kernel, stride, padding)?;
        let data = &self.data;
        // (最大值, 最大值在输入平面内的偏移).
        let picked = Array4::from_shape_fn((n, c, oh, ow), |(b, ch, y, x)| {
            let mut best = (f32::NEG_INFINITY, NO_ARGMAX);
            for ky in 0..kernel.0 {
                let iy = (y * stride.0 + ky) as isize - padding.0 as isize;
                if iy < 0 || iy >= h as isize {
                    continue;
                }
                for kx in 0..kernel.1 {
                    let ix = (x * stride.1 + kx) as isize - padding.1 as isize;
                    if ix < 0 || ix >= w as isize {
                        continue;
                    }
                    let v = data[[b, ch, iy as usize, ix as usize]];
                    if best.1 == NO_ARGMAX || v > best.0 {
                        best = (v, iy as usize * w + ix as usize);
                    }
                }
            }
            best
        });
        let out = self.derive(picked.mapv(|(v, _)| v));
        Ok(record(out, vec![self.input_node()], false, |_| MaxPoolBackward {
            input: self.shape(),
            argmax: picked.mapv(|(_, i)| i),
        }))
    }

    /// 全局平均池化到 `1 x 1` 空间分辨率.
    pub fn adaptive_avg_pool1(&self) -> ShapeResult<FeatureMap> {
        let (n, c, h, w) = self.shape();
        if h == 0 || w == 0 {
            return Err(ShapeError::Empty {
                op: "adaptive_avg_pool",
                shape: self.shape(),
            });
        }
        let mut out = Array4::<f32>::zeros((n, c, 1, 1));
        Zip::from(out.outer_iter_mut())
            .and(self.data.outer_iter())
            .for_each(|mut o, x| {
                for (ci, plane) in x.outer_iter().enumerate() {
                    o[[ci, 0, 0]] = plane.sum() / (h * w) as f32;
                }
            });
        Ok(record(self.derive(out), vec![self.input_node()], false, |_| {
            AvgPoolBackward { input: self.shape() }
        }))
    }

    /// 沿通道轴拼接 `[self, other]`. 两者批大小与空间分辨率必须一致.
    pub fn cat_channels(&self, other: &FeatureMap) -> ShapeResult<FeatureMap> {
        let (ln, lc, lh, lw) = self.shape();
        let (rn, _, rh, rw) = other.shape();
        if (ln, lh, lw) != (rn, rh, rw) {
            return Err(ShapeError::Incompatible {
                op: "cat",
                lhs: self.shape(),
                rhs: other.shape(),
            });
        }
        let out = concatenate(Axis(1), &[self.data.view(), other.data.view()])?;
        let inputs = vec![self.input_node(), other.input_node()];
        Ok(record(self.derive(out), inputs, false, |_| CatBackward { split: lc }))
    }

    /// 最近邻插值到空间分辨率 `size`.
    ///
    /// 该操作消费 `self`: 若分辨率已经一致, 直接返回 `self` 本身 (不产生新分配);
    /// 否则返回新的特征图, 原特征图在此释放.
    pub fn upsample_nearest(self, size: Idx2d) -> ShapeResult<FeatureMap> {
        let (n, c, h, w) = self.shape();
        if (h, w) == size {
            return Ok(self);
        }
        let (oh, ow) = size;
        if h == 0 || w == 0 || oh == 0 || ow == 0 {
            return Err(ShapeError::Empty {
                op: "upsample_nearest",
                shape: (n, c, oh, ow),
            });
        }
        // 源索引 floor(dst * in / out).
        let rows: Vec<usize> = (0..oh).map(|y| y * h / oh).collect();
        let cols: Vec<usize> = (0..ow).map(|x| x * w / ow).collect();
        let data = &self.data;
        let out = Array4::from_shape_fn((n, c, oh, ow), |(b, ch, y, x)| {
            data[[b, ch, rows[y], cols[x]]]
        });
        let out = self.derive(out);
        Ok(record(out, vec![self.input_node()], false, |_| UpsampleBackward {
            input: self.shape(),
            rows,
            cols,
        }))
    }
}

#[inline]
fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

struct NormalizeBackward {
    inv_std: Vec<f32>,
}

impl Backward for NormalizeBackward {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        _: &[bool],
        _: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        let mut dx = grad.clone();
        for (ci, mut plane) in dx.axis_iter_mut(Axis(1)).enumerate() {
            let k = self.inv_std[ci];
            plane.mapv_inplace(|v| v * k);
        }
        Ok(vec![Some(dx)])
    }
}

struct ReluBackward {
    mask: Array4<bool>,
}

impl Backward for ReluBackward {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        _: &[bool],
        _: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        let dx = Zip::from(grad)
            .and(&self.mask)
            .map_collect(|&g, &m| if m { g } else { 0.0 });
        Ok(vec![Some(dx)])
    }
}

struct SigmoidBackward {
    /// 前向输出.
    y: Array4<f32>,
}

impl Backward for SigmoidBackward {
    fn name(&self) -> &'static str {
        "sigmoid"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        _: &[bool],
        _: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        let dx = Zip::from(grad)
            .and(&self.y)
            .map_collect(|&g, &y| g * y * (1.0 - y));
        Ok(vec![Some(dx)])
    }
}

struct AddBackward;

impl Backward for AddBackward {
    fn name(&self) -> &'static str {
        "add"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        needs: &[bool],
        _: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        Ok(needs.iter().map(|&need| when(need, || grad.clone())).collect())
    }
}

struct MaxPoolBackward {
    input: Shape4,
    argmax: Array4<usize>,
}

impl Backward for MaxPoolBackward {
    fn name(&self) -> &'static str {
        "max_pool2d"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        _: &[bool],
        _: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        let w = self.input.3;
        let mut dx = Array4::<f32>::zeros(self.input);
        for ((b, c, y, x), &i) in self.argmax.indexed_iter() {
            if i != NO_ARGMAX {
                dx[[b, c, i / w, i % w]] += grad[[b, c, y, x]];
            }
        }
        Ok(vec![Some(dx)])
    }
}

struct AvgPoolBackward {
    input: Shape4,
}

impl Backward for AvgPoolBackward {
    fn name(&self) -> &'static str {
        "adaptive_avg_pool"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        _: &[bool],
        _: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        let (_, _, h, w) = self.input;
        let area = (h * w) as f32;
        let dx = Array4::from_shape_fn(self.input, |(b, c, _, _)| grad[[b, c, 0, 0]] / area);
        Ok(vec![Some(dx)])
    }
}

struct CatBackward {
    /// 左操作数的通道数.
    split: usize,
}

impl Backward for CatBackward {
    fn name(&self) -> &'static str {
        "cat"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        needs: &[bool],
        _: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        let k = self.split;
        Ok(vec![
            when(needs[0], || grad.slice(s![.., ..k, .., ..]).to_owned()),
            when(needs[1], || grad.slice(s![.., k.., .., ..]).to_owned()),
        ])
    }
}

struct UpsampleBackward {
    input: Shape4,
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl Backward for UpsampleBackward {
    fn name(&self) -> &'static str {
        "upsample_nearest"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        _: &[bool],
        _: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        let mut dx = Array4::<f32>::zeros(self.input);
        for ((b, c, y, x), &g) in grad.indexed_iter() {
            dx[[b, c, self.rows[y], self.cols[x]]] += g;
        }
        Ok(vec![Some(dx)])
    }
}
