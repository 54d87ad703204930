//! Run lineage and file integrity.
//!
//! When a pipeline sets `runtime.lineage_path`, a successful run writes a
//! lineage record: a JSON document naming every file the run read and wrote,
//! with sizes and SHA-256 digests, so a consumer can later tell whether a
//! dataset still matches the run that produced it.
//!
//! ```json
//! {
//!   "lineage_version": 1,
//!   "run_id": "6c1f0b7e-...",
//!   "pipeline": "daily_features",
//!   "producer": { "app_name": "mlprep", "app_version": "0.1.0", "platform": "linux" },
//!   "strategy": "streaming",
//!   "hash_algorithm": "SHA-256",
//!   "inputs": [{ "path": "raw/events.csv", "format": "csv", "size_bytes": 1048576, "sha256": "a3b2..." }],
//!   "outputs": [{ "path": "out/events.parquet", "format": "parquet", "size_bytes": 52311, "sha256": "91fe...", "role": "output", "rows": 9980 }],
//!   "state_files": [{ "path": "state/scaler.json", "size_bytes": 412, "sha256": "0d7c..." }]
//! }
//! ```
//!
//! Digests are byte-level: re-encoding a file (line endings, compression)
//! changes its digest even when the rows are the same.
//!
//! - [`hasher`]: streaming hash computation
//! - [`lineage`]: record structures and creation

pub mod hasher;
pub mod lineage;

pub use hasher::compute_file_hash;
pub use lineage::{
    FileDigest, LineageRecord, OutputDigest, ProducerInfo, create_record, save_record,
};
