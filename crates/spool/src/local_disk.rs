use crate::{fsync_parent_dir, QueueFile, Spool, SpoolEntry, SpoolId};
use anyhow::Context;
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Queue files on a local filesystem, fanned out under three areas:
///
/// ```text
/// <root>/active/    files the scheduler may admit
/// <root>/deferred/  files waiting for a retry sweep
/// <root>/corrupt/   files with unparseable envelopes, kept for an
///                   operator to inspect
/// ```
///
/// Placement is atomic (write to a temp file in the same filesystem,
/// then rename), and moves between areas are plain renames, so a
/// file is always wholly in exactly one area.
#[derive(Debug)]
pub struct LocalDiskSpool {
    path: PathBuf,
    _lock_file: File,
}

const AREAS: &[&str] = &["active", "deferred", "corrupt"];

impl LocalDiskSpool {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let _lock_file = lock_spool_dir(path)?;
        for area in AREAS {
            std::fs::create_dir_all(path.join(area))
                .with_context(|| format!("failed to create {}/{area}", path.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            _lock_file,
        })
    }

    fn area_path(&self, area: &str, id: SpoolId) -> PathBuf {
        id.compute_path(&self.path.join(area))
    }

    /// Atomically place a fresh queue file into the active area.
    /// Front-end components (and tests) inject mail this way.
    pub fn store(&self, id: SpoolId, data: &[u8]) -> anyhow::Result<()> {
        let path = self.area_path("active", id);
        std::fs::create_dir_all(path.parent().unwrap())
            .with_context(|| format!("failed to create dir structure for {id}"))?;
        let mut temp = tempfile::NamedTempFile::new_in(self.path.join("active"))
            .with_context(|| format!("failed to create a temporary file to store {id}"))?;
        temp.write_all(data)
            .with_context(|| format!("failed to write data for {id}"))?;
        temp.as_file_mut()
            .sync_data()
            .with_context(|| format!("failed to sync data for {id}"))?;
        temp.persist(&path)
            .with_context(|| format!("failed to move temp file for {id} to {}", path.display()))?;
        fsync_parent_dir(&path)?;
        Ok(())
    }

    fn rename(&self, id: SpoolId, from: &str, to: &str) -> anyhow::Result<()> {
        let src = self.area_path(from, id);
        let dest = self.area_path(to, id);
        std::fs::create_dir_all(dest.parent().unwrap())
            .with_context(|| format!("failed to create dir structure for {id}"))?;
        std::fs::rename(&src, &dest).with_context(|| {
            format!(
                "failed to move {id} from {} to {}",
                src.display(),
                dest.display()
            )
        })?;
        fsync_parent_dir(&dest)?;
        Ok(())
    }

    fn walk_area(&self, area: &str, sender: flume::Sender<SpoolEntry>) -> anyhow::Result<()> {
        for entry in jwalk::WalkDir::new(self.path.join(area)).skip_hidden(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("error walking spool {area}: {err:#}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(id) = SpoolId::from_path(&path) else {
                tracing::warn!("ignoring alien file {} in spool {area}", path.display());
                continue;
            };
            sender
                .send(SpoolEntry { id, path })
                .map_err(|_| anyhow::anyhow!("spool enumeration receiver went away"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Spool for LocalDiskSpool {
    async fn open(&self, id: SpoolId) -> anyhow::Result<QueueFile> {
        let path = self.area_path("active", id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {id} at {}", path.display()))?;
        Ok(QueueFile::new(id, file))
    }

    async fn remove(&self, id: SpoolId) -> anyhow::Result<()> {
        let path = self.area_path("active", id);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to remove {id} from {}", path.display()))
    }

    async fn defer(&self, id: SpoolId) -> anyhow::Result<()> {
        self.rename(id, "active", "deferred")
    }

    async fn quarantine(&self, id: SpoolId) -> anyhow::Result<()> {
        self.rename(id, "active", "corrupt")
    }

    async fn admit_deferred(&self, id: SpoolId) -> anyhow::Result<()> {
        self.rename(id, "deferred", "active")
    }

    fn enumerate(&self, sender: flume::Sender<SpoolEntry>) -> anyhow::Result<()> {
        self.walk_area("active", sender)
    }

    fn enumerate_deferred(&self, sender: flume::Sender<SpoolEntry>) -> anyhow::Result<()> {
        self.walk_area("deferred", sender)
    }
}

/// Take an exclusive advisory claim on the spool root so two daemons
/// cannot scribble on the same queue. The lock file records our pid
/// and is left behind on unclean exit; a stale file whose pid is no
/// longer alive is reclaimed.
fn lock_spool_dir(path: &Path) -> anyhow::Result<File> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create spool directory {}", path.display()))?;
    let lock_path = path.join("lock");

    for attempt in 0..2 {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                file.sync_data()?;
                return Ok(file);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempt == 0 => {
                let holder = std::fs::read_to_string(&lock_path).unwrap_or_default();
                let pid: Option<u32> = holder.trim().parse().ok();
                let alive = pid
                    .map(|pid| Path::new(&format!("/proc/{pid}")).exists())
                    .unwrap_or(false);
                if alive {
                    anyhow::bail!(
                        "spool {} is locked by pid {}",
                        path.display(),
                        holder.trim()
                    );
                }
                tracing::warn!(
                    "reclaiming stale spool lock {} (holder {:?} is gone)",
                    lock_path.display(),
                    holder.trim()
                );
                std::fs::remove_file(&lock_path)?;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to lock spool {}", path.display()));
            }
        }
    }
    anyhow::bail!("failed to lock spool {}", path.display());
}
