pub mod records;
pub mod settings;

pub type Result<T> = anyhow::Result<T>;
