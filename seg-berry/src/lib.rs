#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 提供带注意力门控的 UNet 图像分割网络: ResNet 编码器, UNet 解码器,
//! SCSE 注意力门控, 分割头, 以及前向传播中特征图的所有权与释放协议.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 该 crate 负责前向计算拓扑与反向传播. 图像解码, 数据集迭代, 损失函数与优化器循环由外部负责;
//!   外部以 [`FeatureMap::backward_with`] 传入损失关于输出的梯度, 取得 [`Gradients`],
//!   再通过 [`nn::ModuleT::visit_parameters_mut`] 在两次前向传播之间改写参数.
//! 2. 配置错误在构建期以 [`ConfigError`] 报告, 形状错误在前向传播中以 [`ShapeError`] 报告.
//!   库代码不会因输入形状而 panic.
//!
//! # 开发计划
//!
//! ### 特征图生命周期 ✅
//!
//! 每个特征图只有一个所有者, 经由 `Drop` 恰好释放一次, 并登记在 [`feature::MemoryLedger`]
//! 中, 以便观测 "N 次前向传播后没有残留".
//!
//! 实现位于 `seg-berry/src/feature`.
//!
//! ### ResNet-18 / ResNet-34 编码器 ✅
//!
//! 实现位于 `seg-berry/src/encoder`.
//!
//! ### UNet 解码器, 中心块, 分割头 ✅
//!
//! 实现位于 `seg-berry/src/decoder` 与 `seg-berry/src/head.rs`.
//!
//! ### SCSE 注意力门控 ✅
//!
//! 实现位于 `seg-berry/src/attention.rs`.
//!
//! ### 参数检查点 ✅
//!
//! npz 格式, 支持严格加载与部分加载.
//!
//! 实现位于 `seg-berry/src/checkpoint.rs`.
//!
//! ### 反向传播 ✅
//!
//! 训练模式下卷积与批归一化的输出追踪梯度; 其余算子在任一输入追踪梯度时追踪梯度.
//! 计算图随输出特征图释放.
//!
//! 实现位于 `seg-berry/src/autograd.rs`, 各算子的反向规则与前向实现放在一起.

/// 二维索引 (高, 宽).
pub type Idx2d = (usize, usize);

/// 四维形状 `(batch, channel, height, width)`.
pub type Shape4 = (usize, usize, usize, usize);

pub mod attention;
mod autograd;
pub mod checkpoint;
pub mod config;
pub mod consts;
pub mod decoder;
pub mod encoder;
mod error;
pub mod feature;
pub mod head;
mod model;
pub mod nn;
pub mod prelude;

pub use autograd::Gradients;
pub use config::{AttentionKind, DecoderConfig, EncoderConfig, UNetConfig};
pub use error::{CheckpointError, ConfigError, ConfigResult, ShapeError, ShapeResult};
pub use feature::{Device, FeatureMap, LedgerSnapshot, MemoryLedger};
pub use model::{ShapePlan, UNet};
