pub mod dataset;
pub mod engine;
pub mod inference;
pub mod preprocess;

#[cfg(feature = "ml")]
pub mod ml_model;
#[cfg(feature = "ml")]
pub mod training;

#[cfg(test)]
pub(crate) mod testing;

pub use dataset::{Dataset, DatasetLoader, DatasetSource, LabeledSample, SampleSource, UploadedFile};
pub use engine::{
    ArchitectureDescriptor, ClassifierEngine, ClassifierModel, CompileSpec, EpochMetrics, FitConfig,
};
pub use inference::InferenceService;
pub use preprocess::{ImagePreprocessor, ImageTensor, IMAGE_SIZE};
#[cfg(feature = "ml")]
pub use training::BurnEngine;
