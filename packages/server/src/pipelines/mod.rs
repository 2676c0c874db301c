// Built-in pipeline handlers.
//
// The interesting pipelines (duplicate detection, doc generation) plug in
// from outside through the JobHandler trait; only the repository scan
// ships with the core.

pub mod scan;

pub use scan::ScanHandler;
