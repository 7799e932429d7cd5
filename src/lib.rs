pub mod archive;
pub mod diff_builder;
pub mod error;
pub mod layer_set;
pub mod merge;
pub mod notifier;
pub mod tar_extractor;

// Re-exports for easy access
pub use archive::ArchiveEntry;
pub use diff_builder::{build_diff, compare_images, DiffSummary};
pub use error::DeltaError;
pub use layer_set::{extract_layer_identifiers, LayerSet};
pub use merge::{merge_images, MergeSummary};
pub use notifier::Notifier;
