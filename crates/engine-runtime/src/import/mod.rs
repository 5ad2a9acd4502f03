pub mod importer;

pub use importer::TieredImporter;
