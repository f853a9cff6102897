pub mod annotated; // annotated matrix, assembler and csv entry points
pub mod annotations; // typed `uns` store: cache, pca, trajectory
pub mod batch_ingest; // two-pass streaming ingestion into hdf5
pub mod column_rules; // metadata / discard / measurement rules
pub mod columnar; // selective column reads
pub mod errors;
pub mod hdf5_store; // dense matrix with hdf5 backend
pub mod header; // multi-row header parsing
pub mod meta_table; // typed observation metadata
pub mod misc;
pub mod read; // dispatch by file extension
pub mod sql_io; // cellprofiler sqlite export
