//! 反复前向传播, 检查特征图账本在每种注意力门控配置下是否回到基线.

mod profile;
mod result;
mod runner;

use log::LevelFilter;
use std::process::ExitCode;

fn main() -> ExitCode {
    simple_logger::SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .ok();

    let result = runner::run();
    if let Err(e) = result.analyze() {
        log::error!("failed to write report: {e}");
        return ExitCode::FAILURE;
    }
    if result.all_balanced() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
