//! 前向传播运行统计.

use seg_berry::LedgerSnapshot;
use std::time::{Duration, Instant};

/// ablation/benchmark 计时器.
///
/// 该计时器支持 "中途中断" 与 "结束中断, 继续开始计时".
#[derive(Clone, Debug)]
struct AccTimer {
    consumed: Duration,
    since: Instant,
}

impl AccTimer {
    /// 初始化计时器. 初始化时会视为已经开始计时 (`self.start()`).
    #[inline]
    pub fn new() -> Self {
        Self {
            consumed: Duration::ZERO,
            since: Instant::now(),
        }
    }

    /// 开始计时.
    #[inline]
    pub fn start(&mut self) {
        self.since = Instant::now();
    }

    /// 结束计时, 并将这一区间的时间累加. 返回本轮计时时长.
    ///
    /// # 注意
    ///
    /// 上一次调用必须是 `self.start()`, 否则计算时间值无意义.
    #[inline]
    pub fn elapsed(&mut self) -> Duration {
        let d = self.since.elapsed();
        self.consumed += d;
        d
    }

    /// 累计时间 (微秒).
    #[inline]
    pub fn get_total_us(&self) -> u64 {
        self.consumed.as_micros() as u64
    }
}

impl Default for AccTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个配置的统计.
#[derive(Clone, Debug)]
pub struct Profile {
    /// 成功完成的前向传播次数.
    passes: u64,

    /// 出错的前向传播次数.
    failed: u64,

    /// 前向传播花费的总时间.
    pass_time: AccTimer,

    /// 包括建模与输入准备在内的总时间.
    real_time: AccTimer,

    /// 最耗时的一次前向传播.
    most: Option<Duration>,

    /// 第一次前向传播前的账本.
    baseline: LedgerSnapshot,

    /// 最后一次前向传播后的账本.
    end: LedgerSnapshot,

    /// 从检查点加载时缺失的参数个数. 没有加载检查点时为 `None`.
    missing: Option<usize>,
}

impl Profile {
    /// 初始化, 同时开始总计时.
    #[inline]
    pub fn new() -> Self {
        Self {
            passes: 0,
            failed: 0,
            pass_time: AccTimer::default(),
            real_time: AccTimer::default(),
            most: None,
            baseline: LedgerSnapshot::default(),
            end: LedgerSnapshot::default(),
            missing: None,
        }
    }

    /// 记录基线账本.
    #[inline]
    pub fn set_baseline(&mut self, snapshot: LedgerSnapshot) {
        self.baseline = snapshot;
    }

    /// 记录检查点缺失的参数个数.
    #[inline]
    pub fn set_missing(&mut self, missing: usize) {
        self.missing = Some(missing);
    }

    /// 开始一次前向传播计时.
    #[inline]
    pub fn pass_start(&mut self) {
        self.pass_time.start();
    }

    /// 结束一次前向传播计时.
    pub fn pass_elapsed(&mut self, ok: bool) {
        let d = self.pass_time.elapsed();
        self.most = Some(self.most.map_or(d, |m| m.max(d)));
        if ok {
            self.passes += 1;
        } else {
            self.failed += 1;
        }
    }

    /// 结束全部计时, 记录最终账本.
    #[inline]
    pub fn finish(mut self, end: LedgerSnapshot) -> Self {
        self.real_time.elapsed();
        self.end = end;
        self
    }

    /// 账本是否回到基线.
    #[inline]
    pub fn is_balanced(&self) -> bool {
        self.end.is_balanced_with(&self.baseline)
    }

    /// 相对基线泄漏的字节数.
    #[inline]
    pub fn get_leaked_bytes(&self) -> isize {
        self.end.leaked_bytes_since(&self.baseline)
    }

    /// 残留的特征图个数.
    #[inline]
    pub fn get_leaked_maps(&self) -> isize {
        self.end.live_maps as isize - self.baseline.live_maps as isize
    }

    /// 峰值字节数.
    #[inline]
    pub fn get_peak_bytes(&self) -> usize {
        self.end.peak_bytes
    }

    /// 平均每次前向传播的分配次数.
    pub fn get_avg_allocations(&self) -> Option<f64> {
        match self.passes + self.failed {
            0 => None,
            n => Some(self.end.allocations_since(&self.baseline) as f64 / n as f64),
        }
    }

    #[inline]
    pub fn get_passes(&self) -> u64 {
        self.passes
    }

    #[inline]
    pub fn get_failed(&self) -> u64 {
        self.failed
    }

    #[inline]
    pub fn get_missing(&self) -> Option<usize> {
        self.missing
    }

    /// 前向传播总时间 (微秒).
    #[inline]
    pub fn get_pass_time_us(&self) -> u64 {
        self.pass_time.get_total_us()
    }

    /// 总自然时间 (微秒).
    #[inline]
    pub fn get_real_time_us(&self) -> u64 {
        self.real_time.get_total_us()
    }

    /// 成功的前向传播平均时间 (微秒).
    pub fn get_avg_pass_time_us(&self) -> Option<f64> {
        match self.passes {
            0 => None,
            n => Some(self.get_pass_time_us() as f64 / n as f64),
        }
    }

    /// 最耗时的一次前向传播.
    #[inline]
    pub fn get_most_time_consuming(&self) -> Option<Duration> {
        self.most
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::new()
    }
}
