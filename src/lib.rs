//! 画像分類モデルのライフサイクル管理
//!
//! データセットの読み込み → 学習 → 保存 → 推論 / エクスポートまでを
//! `ModelLifecycleManager` 1つで管理する。

pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod ml;
pub mod model;
pub mod server;
pub mod types;

pub use error::{LifecycleError, Result};
pub use lifecycle::{ActiveModel, LifecycleSettings, ModelLifecycleManager};
pub use types::{InitOutcome, LabelProbability, ModelState, Prediction, StatusSnapshot, TrainingReport};
