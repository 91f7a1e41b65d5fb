pub mod config;
pub mod export;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, DatasetSettings, PathSettings, ServerSettings, TrainingSettings};
pub use export::{ArtifactExporter, ExportStream};
pub use model_metadata::{LabelSet, ModelMetadata};
pub use model_storage::{ArtifactStore, PersistedModel};
