use std::fmt;
use std::path::{Path, PathBuf};

const UNIX_SCHEME: &str = "unix://";

/// A Unix-domain socket path with bare-file and `unix://` URI views.
///
/// Both views are pure string transforms of the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Socket(String);

impl Socket {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The bare file path, with any `unix://` prefix removed.
    pub fn file(&self) -> &str {
        self.0.strip_prefix(UNIX_SCHEME).unwrap_or(&self.0)
    }

    /// The path as a `unix://` URI.
    pub fn unix(&self) -> String {
        format!("{UNIX_SCHEME}{}", self.file())
    }

    pub fn path(&self) -> &Path {
        Path::new(self.file())
    }
}

impl From<PathBuf> for Socket {
    fn from(path: PathBuf) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file())
    }
}
