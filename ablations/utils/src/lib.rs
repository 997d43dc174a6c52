//! 消融实验依赖的通用组件.

use ndarray::Array4;
use seg_berry::prelude::*;
use std::env;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

const SEP: &str = "--------------------------------------------------------";

/// 简单分隔线.
#[inline]
pub fn sep() {
    println!("{SEP}");
}

/// 简单分隔线.
#[inline]
pub fn sep_to<W: io::Write>(mut w: W) -> io::Result<()> {
    writeln!(&mut w, "{SEP}")
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 获取检查点目录.
///
/// 1. 若环境变量 `$SEG_BERRY_CHECKPOINT_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/checkpoint`. 无法确定用户主目录时返回 `None`.
pub fn checkpoint_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var("SEG_BERRY_CHECKPOINT_DIR") {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => checkpoint::home_checkpoint_dir(),
    }
}

/// 读取正整数环境变量 `key`, 不存在或无法解析时返回 `default`.
pub fn usize_from_env(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

/// `[0, 1]` 范围内的确定性合成图像, 登记在 `ledger` 中.
///
/// 模型在编码器入口按 ImageNet 统计量归一化输入, 这里不再归一化.
pub fn synthetic_image(shape: Shape4, ledger: &Arc<MemoryLedger>) -> FeatureMap {
    let raw = Array4::from_shape_fn(shape, |(b, c, y, x)| {
        ((b * 13 + c * 7 + y * 3 + x) % 256) as f32 / 255.0
    });
    FeatureMap::with_ledger(raw, ledger)
}

#[cfg(test)]
mod tests {
    use super::synthetic_image;
    use seg_berry::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_synthetic_image_is_raw_unit_range() {
        let ledger = Arc::new(MemoryLedger::new());
        let x = synthetic_image((2, 3, 16, 16), &ledger);
        assert_eq!(x.shape(), (2, 3, 16, 16));
        assert!(x.view().iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(x.view()[[0, 0, 0, 0]], 0.0);
        assert_eq!(x.view()[[0, 0, 0, 5]], 5.0 / 255.0);
        assert_eq!(ledger.live_maps(), 1);
    }
}
