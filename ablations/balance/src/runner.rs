//! 程序运行函数.

use crate::profile::Profile;
use crate::result::AblationResult;
use log::{info, warn};
use seg_berry::prelude::*;
use std::sync::Arc;
use std::thread;

/// 每种配置的前向传播次数, 可由 `$BALANCE_PASSES` 覆盖.
const PASSES: usize = 20;

/// 输入边长, 可由 `$BALANCE_SIZE` 覆盖. 须为 32 的倍数.
const SIZE: usize = 128;

/// 参与比较的注意力门控.
const VARIANTS: [(&str, AttentionKind); 2] = [
    ("identity", AttentionKind::Identity),
    ("scse", AttentionKind::Scse),
];

/// 在 `kind` 配置下反复运行推理模式前向传播.
fn check(name: &str, kind: AttentionKind, passes: usize, size: usize) -> Profile {
    let mut profile = Profile::new();
    let mut model = match UNet::new(&UNetConfig::default().with_attention(kind)) {
        Ok(m) => m,
        Err(e) => {
            warn!("{name}: cannot build model: {e}");
            return profile.finish(LedgerSnapshot::default());
        }
    };

    if let Some(path) = utils::checkpoint_dir_from_env_or_home().map(|d| d.join(format!("{name}.npz"))) {
        if path.is_file() {
            match checkpoint::load_partial(&mut model, &path) {
                Ok(missing) => profile.set_missing(missing.len()),
                Err(e) => warn!("{name}: ignoring checkpoint {}: {e}", path.display()),
            }
        }
    }

    let ledger = Arc::new(MemoryLedger::new());
    let image = utils::synthetic_image((1, 3, size, size), &ledger);
    profile.set_baseline(ledger.snapshot());

    for i in 0..passes {
        profile.pass_start();
        let out = model.forward(&image, false);
        profile.pass_elapsed(out.is_ok());
        match out {
            Ok(y) => y.release(),
            Err(e) => warn!("{name}: pass {i} failed: {e}"),
        }
    }
    info!("{name}: {passes} passes done");
    profile.finish(ledger.snapshot())
}

/// 实际运行.
pub fn run() -> AblationResult {
    let passes = utils::usize_from_env("BALANCE_PASSES", PASSES);
    let size = utils::usize_from_env("BALANCE_SIZE", SIZE);
    println!(
        "Running balance checks: {passes} passes of {size}x{size} on {} cores...",
        utils::cpus()
    );

    thread::scope(|s| {
        let handles = VARIANTS.map(|(name, kind)| (name, s.spawn(move || check(name, kind, passes, size))));
        AblationResult::from_iter(handles.into_iter().map(|(name, th)| {
            let profile = th.join().unwrap_or_else(|_| {
                warn!("{name}: worker panicked");
                Profile::new().finish(LedgerSnapshot {
                    live_maps: usize::MAX,
                    ..LedgerSnapshot::default()
                })
            });
            (name, profile)
        }))
    })
}
