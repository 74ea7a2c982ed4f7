use serde::{Deserialize, Serialize};

/// Operator-tunable behaviour. Every field may be left out of a settings file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Lines starting with this character are skipped. `None` disables skipping.
    pub comment: Option<char>,
    /// Allow rows whose column count differs from the header.
    pub flexible: bool,
    /// Targets probed at once. `1` keeps the run strictly sequential.
    pub workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            comment: None,
            flexible: false,
            workers: 1,
        }
    }
}
