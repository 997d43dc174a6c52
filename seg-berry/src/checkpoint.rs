//! 参数检查点: 以层级参数名为键的 npz 归档.
//!
//! 严格加载要求模型的每个参数都出现在归档中且形状一致; 部分加载跳过缺失的参数,
//! 并返回它们的名字. 两种加载方式都先完整校验归档, 校验通过后才改写模型参数,
//! 因此出错时模型保持原样.

use crate::error::CheckpointError;
use crate::nn::ModuleT;
use log::{info, warn};
use ndarray::{ArrayD, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

/// 获取 `{用户主目录}/checkpoint` 目录.
pub fn home_checkpoint_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("checkpoint");
    Some(ans)
}

/// 获取 `{用户主目录}/checkpoint` 目录下给定继续项组成的全路径.
pub fn home_checkpoint_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = home_checkpoint_dir()?;
    ans.extend(it);
    Some(ans)
}

/// 把 `model` 的全部参数 (包括批归一化滑动统计量) 写入 `path`.
pub fn save<M: ModuleT + ?Sized, P: AsRef<Path>>(model: &M, path: P) -> Result<(), CheckpointError> {
    let mut params = Vec::new();
    model.visit_parameters(&mut |p| params.push((p.name().to_string(), p.value().to_owned())));

    let mut npz = NpzWriter::new(File::create(path.as_ref())?);
    for (name, value) in &params {
        npz.add_array(name.as_str(), value)?;
    }
    npz.finish()?;
    info!(
        "saved {} parameters to {}",
        params.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// 严格加载. 归档中缺失任何参数时返回 [`CheckpointError::Missing`].
///
/// 归档中多余的条目被忽略.
pub fn load<M: ModuleT + ?Sized, P: AsRef<Path>>(model: &mut M, path: P) -> Result<(), CheckpointError> {
    load_impl(model, path.as_ref(), true).map(|_| ())
}

/// 部分加载. 返回模型中存在但归档中缺失的参数名 (按字典序).
pub fn load_partial<M: ModuleT + ?Sized, P: AsRef<Path>>(
    model: &mut M,
    path: P,
) -> Result<Vec<String>, CheckpointError> {
    load_impl(model, path.as_ref(), false)
}

fn load_impl<M: ModuleT + ?Sized>(model: &mut M, path: &Path, strict: bool) -> Result<Vec<String>, CheckpointError> {
    let mut npz = NpzReader::new(File::open(path)?)?;
    let available: BTreeSet<String> = npz
        .names()?
        .into_iter()
        .map(|n| match n.strip_suffix(".npy") {
            Some(stem) => stem.to_string(),
            None => n,
        })
        .collect();

    let mut wanted = Vec::new();
    model.visit_parameters(&mut |p| wanted.push((p.name().to_string(), p.shape().to_vec())));
    wanted.sort_unstable();

    let mut missing = Vec::new();
    let mut loaded: HashMap<String, ArrayD<f32>> = HashMap::with_capacity(wanted.len());
    for (name, expected) in wanted {
        if !available.contains(&name) {
            missing.push(name);
            continue;
        }
        let value = npz.by_name::<OwnedRepr<f32>, IxDyn>(&name)?;
        if value.shape() != expected.as_slice() {
            return Err(CheckpointError::ShapeMismatch {
                name,
                expected,
                found: value.shape().to_vec(),
            });
        }
        loaded.insert(name, value);
    }
    if strict && !missing.is_empty() {
        return Err(CheckpointError::Missing(missing));
    }

    let count = loaded.len();
    model.visit_parameters_mut(&mut |p| {
        if let Some(value) = loaded.remove(p.name()) {
            p.value_mut().assign(&value);
        }
    });
    if !missing.is_empty() {
        warn!(
            "{} parameters missing from {}, kept their initial values: {:?}",
            missing.len(),
            path.display(),
            missing
        );
    }
    info!("loaded {} parameters from {}", count, path.display());
    Ok(missing)
}
