pub mod http_json;
pub mod measurement_csv_file;
pub mod measurement_ndjson_file;
pub mod replay;

pub use http_json::HttpJsonSource;
pub use measurement_csv_file::MeasurementCsvFileSource;
pub use measurement_ndjson_file::MeasurementNdjsonFileSource;
pub use replay::ReplaySource;
