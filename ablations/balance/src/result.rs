//! 实验结果.

use crate::profile::Profile;
use std::io::{self, Write};

/// 将 `profile` 的结果写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &Profile, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    #[inline]
    fn f64_to_display(f: Option<f64>) -> String {
        match f {
            Some(f) => format!("{f:.3}"),
            None => "/".to_string(),
        }
    }

    #[inline]
    fn u64_to_display(u: Option<u64>) -> String {
        match u {
            Some(u) => u.to_string(),
            None => "/".to_string(),
        }
    }

    writeln!(w, "Profile `{name}`:")?;
    writeln!(w, "{S4}Balanced: {}", p.is_balanced())?;
    writeln!(w, "{S4}Passes: {} ok, {} failed", p.get_passes(), p.get_failed())?;
    writeln!(w, "{S4}Leaked feature maps: {}", p.get_leaked_maps())?;
    writeln!(w, "{S4}Leaked bytes: {}", p.get_leaked_bytes())?;
    writeln!(w, "{S4}Peak live bytes: {}", p.get_peak_bytes())?;
    writeln!(
        w,
        "{S4}Average allocations per pass: {}",
        f64_to_display(p.get_avg_allocations())
    )?;
    writeln!(
        w,
        "{S4}Checkpoint parameters missing: {}",
        u64_to_display(p.get_missing().map(|m| m as u64))
    )?;
    writeln!(w, "{S4}Forward total time: {} us", p.get_pass_time_us())?;
    writeln!(
        w,
        "{S4}Forward average time: {} us",
        f64_to_display(p.get_avg_pass_time_us())
    )?;
    writeln!(w, "{S4}Total machine time: {} us", p.get_real_time_us())?;
    let t = p.get_most_time_consuming().map(|d| d.as_micros() as u64);
    write!(w, "{S4}Slowest pass costs {} us", u64_to_display(t))?;
    Ok(())
}

/// 消融实验最终结果.
pub struct AblationResult {
    data: Vec<(&'static str, Profile)>,
}

impl AblationResult {
    pub fn from_iter<I: IntoIterator<Item = (&'static str, Profile)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }

    /// 是否所有配置都完成了前向传播, 没有失败, 且回到了账本基线.
    pub fn all_balanced(&self) -> bool {
        self.data
            .iter()
            .all(|(_, p)| p.get_passes() > 0 && p.get_failed() == 0 && p.is_balanced())
    }

    /// 打印运行结果.
    pub fn analyze(&self) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        utils::sep_to(&mut out)?;
        for (key, profile) in self.data.iter() {
            describe_into(key, profile, &mut out)?;
            writeln!(out)?;
            utils::sep_to(&mut out)?;
        }
        Ok(())
    }
}
