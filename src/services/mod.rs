mod astdb_importer;

pub use astdb_importer::AstdbImporter;
