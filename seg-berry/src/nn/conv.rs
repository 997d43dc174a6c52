//! 二维卷积 (im2col + 矩阵乘) 及其反向规则 (col2im).

use super::{ModuleT, Parameter, Path};
use crate::autograd::{record, Backward, Gradients};
use crate::error::{ConfigError, ConfigResult, ShapeError, ShapeResult};
use crate::feature::{output_len, FeatureMap};
use crate::Idx2d;
use ndarray::linalg::general_mat_mul;
use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayViewMut3, Axis, IxDyn};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
    }
}

/// 二维卷积层. 权重形状为 `[out, in, kh, kw]`.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    kernel: Idx2d,
    stride: Idx2d,
    padding: Idx2d,
}

impl Conv2d {
    /// 在 `path` 下创建正方形卷积核的卷积层.
    ///
    /// 权重名为 `{path}.weight`, 偏置 (若有) 为 `{path}.bias`.
    pub fn new(
        path: &Path,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        bias: bool,
    ) -> ConfigResult<Self> {
        if in_channels == 0 {
            return Err(ConfigError::Zero("conv in_channels"));
        }
        if out_channels == 0 {
            return Err(ConfigError::Zero("conv out_channels"));
        }
        if kernel == 0 {
            return Err(ConfigError::Zero("conv kernel"));
        }
        if stride == 0 {
            return Err(ConfigError::Zero("conv stride"));
        }
        let fan_in = in_channels * kernel * kernel;
        let weight = path.kaiming_normal(
            "weight",
            &[out_channels, in_channels, kernel, kernel],
            fan_in,
        )?;
        let bias = if bias {
            Some(path.zeros("bias", &[out_channels])?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel: (kernel, kernel),
            stride: (stride, stride),
            padding: (padding, padding),
        })
    }

    /// 输入通道数.
    #[inline]
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// 输出通道数.
    #[inline]
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// 给定输入空间分辨率时的输出空间分辨率.
    pub fn output_size(&self, input: Idx2d) -> ShapeResult<Idx2d> {
        output_len("conv2d", input, self.kernel, self.stride, self.padding)
    }

    #[inline]
    fn geometry(&self) -> Geometry {
        Geometry {
            kernel: self.kernel,
            stride: self.stride,
            padding: self.padding,
        }
    }

    /// 单个样本的卷积, 结果写入 `out` (`[out, oh, ow]`).
    fn conv_one(
        &self,
        weight: ArrayView2<f32>,
        x: ArrayView3<f32>,
        out: ArrayViewMut3<f32>,
    ) -> ShapeResult<()> {
        let (_, oh, ow) = out.dim();
        let cols = self.geometry().im2col(x, (oh, ow));
        let mut out = out.into_shape((self.out_channels, oh * ow))?;
        general_mat_mul(1.0, &weight, &cols, 0.0, &mut out);
        if let Some(bias) = &self.bias {
            for (mut row, &b) in out.outer_iter_mut().zip(bias.value().iter()) {
                row += b;
            }
        }
        Ok(())
    }
}

/// 卷积窗口的几何参数.
#[derive(Copy, Clone, Debug)]
struct Geometry {
    kernel: Idx2d,
    stride: Idx2d,
    padding: Idx2d,
}

impl Geometry {
    /// 按 (输入通道, 核行, 核列) 遍历列矩阵的行, 对每个落在输入内的
    /// (列矩阵列号, 输入行, 输入列) 调用 `f`.
    fn for_each_tap<F>(&self, (c, h, w): (usize, usize, usize), (oh, ow): Idx2d, mut f: F)
    where
        F: FnMut(usize, usize, usize, usize, usize),
    {
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let (ph, pw) = (self.padding.0 as isize, self.padding.1 as isize);
        for ci in 0..c {
            for ky in 0..kh {
                for kx in 0..kw {
                    let row = (ci * kh + ky) * kw + kx;
                    for oy in 0..oh {
                        let iy = (oy * sh + ky) as isize - ph;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for ox in 0..ow {
                            let ix = (ox * sw + kx) as isize - pw;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            f(row, oy * ow + ox, ci, iy as usize, ix as usize);
                        }
                    }
                }
            }
        }
    }

    /// 把单个样本 `[c, h, w]` 展开为 `[c * kh * kw, oh * ow]` 的列矩阵. 填充位置为 0.
    fn im2col(&self, x: ArrayView3<f32>, out: Idx2d) -> Array2<f32> {
        let (c, _, _) = x.dim();
        let mut cols = Array2::<f32>::zeros((c * self.kernel.0 * self.kernel.1, out.0 * out.1));
        self.for_each_tap(x.dim(), out, |row, col, ci, iy, ix| {
            cols[[row, col]] = x[[ci, iy, ix]];
        });
        cols
    }

    /// [`Geometry::im2col`] 的伴随: 把列矩阵累加回 `[c, h, w]`.
    fn col2im(&self, cols: ArrayView2<f32>, input: (usize, usize, usize), out: Idx2d) -> Array3<f32> {
        let mut x = Array3::<f32>::zeros(input);
        self.for_each_tap(input, out, |row, col, ci, iy, ix| {
            x[[ci, iy, ix]] += cols[[row, col]];
        });
        x
    }
}

/// 卷积的反向规则. 保存前向输入与展平后的权重.
struct Conv2dBackward {
    input: Array4<f32>,
    weight: Array2<f32>,
    weight_name: String,
    weight_shape: Vec<usize>,
    bias_name: Option<String>,
    geometry: Geometry,
}

impl Backward for Conv2dBackward {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn backward(
        &self,
        grad: &Array4<f32>,
        needs: &[bool],
        params: &mut Gradients,
    ) -> ShapeResult<Vec<Option<Array4<f32>>>> {
        let grad = grad.as_standard_layout();
        let (n, out_channels, oh, ow) = grad.dim();
        let (_, c, h, w) = self.input.dim();
        let mut dw = Array2::<f32>::zeros(self.weight.dim());
        let mut db = Array1::<f32>::zeros(out_channels);
        let mut dx = needs[0].then(|| Array4::<f32>::zeros(self.input.dim()));

        for b in 0..n {
            let dy = grad
                .index_axis(Axis(0), b)
                .into_shape((out_channels, oh * ow))?;
            let cols = self.geometry.im2col(self.input.index_axis(Axis(0), b), (oh, ow));
            general_mat_mul(1.0, &dy, &cols.t(), 1.0, &mut dw);
            db += &dy.sum_axis(Axis(1));
            if let Some(dx) = dx.as_mut() {
                let dcols = self.weight.t().dot(&dy);
                let xb = self.geometry.col2im(dcols.view(), (c, h, w), (oh, ow));
                dx.index_axis_mut(Axis(0), b).assign(&xb);
            }
        }

        params.accumulate(&self.weight_name, dw.into_shape(IxDyn(&self.weight_shape))?);
        if let Some(name) = &self.bias_name {
            params.accumulate(name, db);
        }
        Ok(vec![dx])
    }
}

impl ModuleT for Conv2d {
    fn forward_t(&self, x: &FeatureMap, train: bool) -> ShapeResult<FeatureMap> {
        let (n, c, h, w) = x.shape();
        if c != self.in_channels {
            return Err(ShapeError::Channels {
                op: "conv2d",
                expected: self.in_channels,
                actual: c,
            });
        }
        let (oh, ow) = self.output_size((h, w))?;
        let (kh, kw) = self.kernel;
        let weight = self
            .weight
            .value()
            .into_shape((self.out_channels, c * kh * kw))?;
        let mut out = Array4::<f32>::zeros((n, self.out_channels, oh, ow));
        let input = x.view();

        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                out.axis_iter_mut(Axis(0))
                    .into_par_iter()
                    .zip(input.axis_iter(Axis(0)).into_par_iter())
                    .try_for_each(|(o, xb)| self.conv_one(weight, xb, o))?;
            } else {
                for (o, xb) in out.axis_iter_mut(Axis(0)).zip(input.axis_iter(Axis(0))) {
                    self.conv_one(weight, xb, o)?;
                }
            }
        }
        // 训练模式下输出总是追踪梯度.
        let force = train && self.weight.trainable();
        Ok(record(x.derive(out), vec![x.input_node()], force, |_| Conv2dBackward {
            input: x.view().to_owned(),
            weight: weight.to_owned(),
            weight_name: self.weight.name().to_string(),
            weight_shape: self.weight.shape().to_vec(),
            bias_name: self.bias.as_ref().map(|b| b.name().to_string()),
            geometry: self.geometry(),
        }))
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        visitor(&self.weight);
        if let Some(bias) = &self.bias {
            visitor(bias);
        }
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        visitor(&mut self.weight);
        if let Some(bias) = &mut self.bias {
            visitor(bias);
        }
    }
}
