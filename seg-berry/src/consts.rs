//! 通用常量.

/// ImageNet 逐通道均值 (RGB).
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet 逐通道标准差 (RGB).
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 编码器批归一化的数值稳定项.
pub const BN_EPS: f32 = 1e-5;

/// 解码器卷积块中批归一化的数值稳定项.
pub const DECODER_BN_EPS: f32 = 1e-3;

/// 批归一化滑动统计量的更新动量.
pub const BN_MOMENTUM: f32 = 0.1;

/// SCSE 通道挤压的默认缩减比例.
pub const SCSE_REDUCTION: usize = 16;

/// 编码器输出特征图相对输入的总下采样倍率.
pub const OUTPUT_STRIDE: usize = 32;

/// 网络结构预设.
pub mod arch {
    /// 编码器 stem 卷积输出通道.
    pub const STEM_CHANNELS: usize = 64;

    /// ResNet 编码器各阶段输出通道.
    pub const RESNET_CHANNELS: [usize; 4] = [64, 128, 256, 512];

    /// ResNet-34 各阶段基本块个数.
    pub const RESNET34_REPEATS: [usize; 4] = [3, 4, 6, 3];

    /// ResNet-18 各阶段基本块个数.
    pub const RESNET18_REPEATS: [usize; 4] = [2, 2, 2, 2];

    /// UNet 解码器各阶段输出通道.
    pub const DECODER_CHANNELS: [usize; 5] = [256, 128, 64, 32, 16];
}
