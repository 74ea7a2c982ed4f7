pub mod records;
pub mod settings;

pub use records::{QuoteError, RecordError, RecordErrorKind, RecordReader};
pub use settings::SettingsStore;
