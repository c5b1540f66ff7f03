//! Saved server identities.
//!
//! A [`ServerConfig`] describes one reachable database endpoint: host, port,
//! credentials, backend dialect, display color, and an optional database or
//! path. The `name` may embed a `/`-separated folder path; there is no
//! separate tree structure — the name is the hierarchy, both in memory and
//! on disk.

use serde::{Deserialize, Serialize};

use crate::error::{QdeskError, Result};

/// Backend dialect tag stored with each server.
///
/// `Kq` is the array-database dialect: wrapped queries, direct
/// (non-pooled-by-default) connections. The rest are standard relational
/// backends served through the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectTag {
    #[default]
    Kq,
    Postgres,
    Sqlite,
}

impl DialectTag {
    pub fn as_str(self) -> &'static str {
        match self {
            DialectTag::Kq => "kq",
            DialectTag::Postgres => "postgres",
            DialectTag::Sqlite => "sqlite",
        }
    }
}

impl std::fmt::Display for DialectTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named colors for visual identification of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerColor {
    #[default]
    None,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    Gray,
}

impl std::str::FromStr for ServerColor {
    type Err = QdeskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(ServerColor::None),
            "red" => Ok(ServerColor::Red),
            "green" => Ok(ServerColor::Green),
            "yellow" => Ok(ServerColor::Yellow),
            "blue" => Ok(ServerColor::Blue),
            "magenta" => Ok(ServerColor::Magenta),
            "cyan" => Ok(ServerColor::Cyan),
            "white" => Ok(ServerColor::White),
            "gray" | "grey" => Ok(ServerColor::Gray),
            _ => Err(QdeskError::InvalidConfig(format!("unknown color: {}", s))),
        }
    }
}

impl std::fmt::Display for ServerColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerColor::None => "none",
            ServerColor::Red => "red",
            ServerColor::Green => "green",
            ServerColor::Yellow => "yellow",
            ServerColor::Blue => "blue",
            ServerColor::Magenta => "magenta",
            ServerColor::Cyan => "cyan",
            ServerColor::White => "white",
            ServerColor::Gray => "gray",
        };
        write!(f, "{}", s)
    }
}

/// Normalize a folder path: collapse repeated separators and strip
/// leading/trailing slashes. `"//a///b/"` becomes `"a/b"`.
pub fn clean_folder_name(folder: &str) -> String {
    folder
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// An immutable server identity.
///
/// Identity and equality are structural: two configs with the same name,
/// endpoint, credentials, database, dialect, and color are the same server,
/// and share a connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name; may embed a `/`-separated folder path.
    pub name: String,
    /// Database host.
    pub host: String,
    /// Database port.
    #[serde(default)]
    pub port: u16,
    /// Username; empty means "use the default login".
    #[serde(default)]
    pub username: String,
    /// Password; empty means "use the default login".
    #[serde(default)]
    pub password: String,
    /// Backend dialect.
    #[serde(default)]
    pub dialect: DialectTag,
    /// Visual color indicator.
    #[serde(default)]
    pub color: ServerColor,
    /// Database name or on-disk path, where the dialect needs one.
    #[serde(default)]
    pub database: Option<String>,
}

impl ServerConfig {
    /// Create a new server with the given name and endpoint.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            dialect: DialectTag::default(),
            color: ServerColor::default(),
            database: None,
        }
    }

    /// Create a server inside an explicit folder.
    ///
    /// The folder and the name are separate inputs here, so a `name` that
    /// itself embeds a path is rejected — exactly one source of truth.
    pub fn in_folder(
        folder: &str,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Self> {
        let name = name.into();
        if name.contains('/') {
            return Err(QdeskError::InvalidConfig(format!(
                "name '{}' embeds a folder path; pass the folder separately",
                name
            )));
        }
        let folder = clean_folder_name(folder);
        let full = if folder.is_empty() {
            name
        } else {
            format!("{}/{}", folder, name)
        };
        Ok(Self::new(full, host, port))
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_dialect(mut self, dialect: DialectTag) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_color(mut self, color: ServerColor) -> Self {
        self.color = color;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Folder path segments derived from the name; empty segments are
    /// discarded, so `"a//b/srv"` lives in folder `["a", "b"]`.
    pub fn folder_path(&self) -> Vec<&str> {
        let mut segments: Vec<&str> = self.name.split('/').filter(|s| !s.is_empty()).collect();
        segments.pop();
        segments
    }

    /// Folder as a normalized `/`-joined string; empty for root.
    pub fn folder(&self) -> String {
        self.folder_path().join("/")
    }

    /// Last segment of the name, without the folder path.
    pub fn display_name(&self) -> &str {
        self.name
            .split('/')
            .filter(|s| !s.is_empty())
            .next_back()
            .unwrap_or("")
    }

    /// Endpoint summary for status displays (no password).
    pub fn display_string(&self) -> String {
        match &self.database {
            Some(db) => format!("{}:{}/{}", self.host, self.port, db),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    /// Check the config invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(QdeskError::InvalidConfig("name cannot be empty".into()));
        }
        if self.name.ends_with('/') {
            return Err(QdeskError::InvalidConfig(format!(
                "name '{}' must not end with '/'",
                self.name
            )));
        }
        if self.host.is_empty() {
            return Err(QdeskError::InvalidConfig("host cannot be empty".into()));
        }
        Ok(())
    }
}
