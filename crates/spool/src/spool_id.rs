use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identity of one queue file, stable across its moves between the
/// active, deferred and corrupt areas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpoolId(Uuid);

impl std::fmt::Display for SpoolId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.simple().fmt(fmt)
    }
}

impl std::str::FromStr for SpoolId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::try_parse(s)?))
    }
}

impl SpoolId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Fan the id out over one prefix directory so that no single
    /// directory collects every queue file.
    pub fn compute_path(&self, in_dir: &Path) -> PathBuf {
        let hex = self.0.simple().to_string();
        in_dir.join(&hex[0..2]).join(hex)
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        Some(Self(Uuid::try_parse(name).ok()?))
    }
}

impl Default for SpoolId {
    fn default() -> Self {
        Self::new()
    }
}
