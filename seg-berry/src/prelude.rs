//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Shape4};

pub use crate::autograd::Gradients;
pub use crate::config::{AttentionKind, DecoderConfig, EncoderConfig, UNetConfig};
pub use crate::error::{CheckpointError, ConfigError, ConfigResult, ShapeError, ShapeResult};
pub use crate::feature::{Device, FeatureMap, LedgerSnapshot, MemoryLedger};
pub use crate::model::{ShapePlan, UNet};
pub use crate::nn::ModuleT;

pub use crate::consts::{IMAGENET_MEAN, IMAGENET_STD};

pub use crate::checkpoint::home_checkpoint_dir_with;
pub use crate::checkpoint::{self, load, load_partial, save};
