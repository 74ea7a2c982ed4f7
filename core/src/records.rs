/// Seconds the driver may spend establishing a connection before giving up.
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Fixed column positions of each credential field in an input row.
///
/// Columns 0, 1 and 4 are present in the input but carry nothing we read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnMap {
    pub host: usize,
    pub port: usize,
    pub database: usize,
    pub user: usize,
    pub password: usize,
}

pub const COLUMNS: ColumnMap = ColumnMap {
    host: 2,
    port: 3,
    database: 5,
    user: 6,
    password: 7,
};

/// Rows narrower than this cannot be mapped onto [`COLUMNS`].
pub const MIN_COLUMNS: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
    pub database: String,
}

impl ConnectionRecord {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        port: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            host: host.into(),
            port: port.into(),
            database: database.into(),
        }
    }

    /// Picks the credential fields out of a row through [`COLUMNS`].
    ///
    /// Returns `None` when any mapped column is missing.
    pub fn from_columns<'a, F>(column: F) -> Option<Self>
    where
        F: Fn(usize) -> Option<&'a str>,
    {
        Some(Self::new(
            column(COLUMNS.user)?,
            column(COLUMNS.password)?,
            column(COLUMNS.host)?,
            column(COLUMNS.port)?,
            column(COLUMNS.database)?,
        ))
    }

    /// Connection string handed to the driver. Fields are interpolated verbatim.
    pub fn target_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?connect_timeout={}",
            self.user, self.password, self.host, self.port, self.database, CONNECT_TIMEOUT_SECS
        )
    }
}
