//! 构建期 / 前向传播期 / 检查点读写错误.
//!
//! 三类错误互不相交: 构建期配置错误会阻止模型创建; 前向传播中的形状错误会终止本次传播;
//! 检查点错误只出现在参数读写时. 核心内部不存在可恢复的错误.

use crate::Shape4;
use thiserror::Error;

/// 模型构建期的配置错误. 出现该错误时模型不会被创建.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// 编码器各阶段重复次数列表与通道列表长度不一致.
    #[error("encoder has {channels} stage channel entries but {repeats} repeat counts")]
    RepeatCountMismatch {
        /// 通道列表长度.
        channels: usize,
        /// 重复次数列表长度.
        repeats: usize,
    },

    /// 某阶段的残差块重复次数为 0.
    #[error("encoder stage {stage} has a repeat count of zero")]
    EmptyStage {
        /// 阶段序号 (从 1 开始, 第 0 层为 stem).
        stage: usize,
    },

    /// 解码器层数与编码器深度不一致.
    #[error("decoder has {decoder} stages but the encoder depth is {encoder}")]
    DepthMismatch {
        /// 编码器深度.
        encoder: usize,
        /// 解码器层数.
        decoder: usize,
    },

    /// 注意力配置个数与解码器层数不一致.
    #[error("{attention} attention settings given for {stages} decoder stages")]
    AttentionLenMismatch {
        /// 解码器层数.
        stages: usize,
        /// 注意力配置个数.
        attention: usize,
    },

    /// 解码器预期的编码器通道与实际编码器通道不一致.
    #[error("decoder stage {stage} expects {expected} skip channels, the encoder provides {actual}")]
    ChannelMismatch {
        /// 解码器阶段序号.
        stage: usize,
        /// 解码器预期通道数.
        expected: usize,
        /// 编码器实际通道数.
        actual: usize,
    },

    /// 通道数 / 类别数 / 卷积核尺寸等必须为正数的参数为 0.
    #[error("`{0}` must be positive")]
    Zero(&'static str),

    /// SCSE 通道挤压后通道数为 0.
    #[error("cannot squeeze {channels} channels with reduction ratio {reduction}")]
    ReductionTooLarge {
        /// 输入通道数.
        channels: usize,
        /// 缩减比例.
        reduction: usize,
    },

    /// 输入归一化参数与输入通道数不一致, 或标准差非正.
    #[error("invalid input normalization for {channels} channels")]
    Normalization {
        /// 输入通道数.
        channels: usize,
    },

    /// 参数名重复注册.
    #[error("parameter `{0}` is registered twice")]
    DuplicateParameter(String),
}

/// 前向传播中的形状 / 通道错误. 这代表网络接线缺陷, 不应重试.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    /// 通道数不匹配.
    #[error("{op}: expected {expected} channels, got {actual}")]
    Channels {
        /// 出错的操作.
        op: &'static str,
        /// 期望通道数.
        expected: usize,
        /// 实际通道数.
        actual: usize,
    },

    /// 两个特征图形状不能对齐.
    #[error("{op}: shapes {lhs:?} and {rhs:?} cannot be combined")]
    Incompatible {
        /// 出错的操作.
        op: &'static str,
        /// 左操作数形状.
        lhs: Shape4,
        /// 右操作数形状.
        rhs: Shape4,
    },

    /// 卷积 / 池化窗口大于 (填充后的) 输入.
    #[error("{op}: window {window:?} does not fit padded input {input:?}")]
    WindowTooLarge {
        /// 出错的操作.
        op: &'static str,
        /// 窗口大小 (高, 宽).
        window: (usize, usize),
        /// 填充后输入大小 (高, 宽).
        input: (usize, usize),
    },

    /// 编码器输出特征个数与解码器需要的不一致.
    #[error("decoder expects {expected} encoder features, got {actual}")]
    FeatureCount {
        /// 期望个数.
        expected: usize,
        /// 实际个数.
        actual: usize,
    },

    /// 空的特征图 (某一维为 0).
    #[error("{op}: empty feature map {shape:?}")]
    Empty {
        /// 出错的操作.
        op: &'static str,
        /// 特征图形状.
        shape: Shape4,
    },

    /// 对不追踪梯度的特征图做反向传播.
    #[error("backward called on a feature map that does not track gradients")]
    Untracked,

    /// ndarray 底层布局错误.
    #[error("array layout: {0}")]
    Layout(String),
}

impl From<ndarray::ShapeError> for ShapeError {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::Layout(value.to_string())
    }
}

/// 检查点 (参数归档) 读写错误.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// 底层 I/O 错误.
    #[error("checkpoint i/o: {0}")]
    Io(#[from] std::io::Error),

    /// 读取 npz 归档错误.
    #[error("reading npz archive: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    /// 写入 npz 归档错误.
    #[error("writing npz archive: {0}")]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    /// 归档中的参数形状与模型不一致.
    #[error("parameter `{name}` has shape {found:?} in the archive, model expects {expected:?}")]
    ShapeMismatch {
        /// 参数名.
        name: String,
        /// 模型中的形状.
        expected: Vec<usize>,
        /// 归档中的形状.
        found: Vec<usize>,
    },

    /// 严格加载时, 归档中缺失的参数.
    #[error("{} parameters missing from the archive, first is `{}`", .0.len(), .0[0])]
    Missing(Vec<String>),
}

/// 前向传播结果.
pub type ShapeResult<T> = Result<T, ShapeError>;

/// 模型构建结果.
pub type ConfigResult<T> = Result<T, ConfigError>;
