use async_trait::async_trait;
use std::fs::File;
use std::path::PathBuf;

pub mod local_disk;
pub mod spool_id;

pub use local_disk::LocalDiskSpool;
pub use spool_id::SpoolId;

/// One queue file discovered by an enumeration walk. Whether the
/// file is intact is only discovered when the scheduler admits it
/// and parses the envelope.
#[derive(Debug)]
pub struct SpoolEntry {
    pub id: SpoolId,
    pub path: PathBuf,
}

/// Where a finished queue file ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalDisposition {
    /// Every recipient completed; the file is unlinked.
    Removed,
    /// At least one recipient was deferred; the file moves to the
    /// deferred area and waits for a later sweep.
    Deferred,
    /// The envelope could not be parsed; the file is set aside for
    /// an operator to inspect.
    Quarantined,
}

#[async_trait]
pub trait Spool: Send + Sync {
    /// Open the active queue file with the provided id for
    /// envelope streaming and completion markers.
    async fn open(&self, id: SpoolId) -> anyhow::Result<QueueFile>;

    /// Unlink the active queue file; every recipient completed.
    async fn remove(&self, id: SpoolId) -> anyhow::Result<()>;

    /// Move the active queue file to the deferred area.
    async fn defer(&self, id: SpoolId) -> anyhow::Result<()>;

    /// Set a damaged queue file aside in the corrupt area.
    async fn quarantine(&self, id: SpoolId) -> anyhow::Result<()>;

    /// Move a deferred queue file back into the active area so a
    /// sweep can admit it again.
    async fn admit_deferred(&self, id: SpoolId) -> anyhow::Result<()>;

    /// Walk the active area and emit an entry for each queue file
    /// found, in unspecified order. Use a bounded channel; the walk
    /// blocks when the receiver falls behind.
    fn enumerate(&self, sender: flume::Sender<SpoolEntry>) -> anyhow::Result<()>;

    /// Walk the deferred area the same way, for retry sweeps.
    fn enumerate_deferred(&self, sender: flume::Sender<SpoolEntry>) -> anyhow::Result<()>;
}

/// An open queue file. Reads are buffered and positioned; completion
/// markers write through immediately so that a crash never repeats a
/// delivery that was already acknowledged.
pub struct QueueFile {
    id: SpoolId,
    file: File,
}

impl QueueFile {
    pub fn new(id: SpoolId, file: File) -> Self {
        Self { id, file }
    }

    pub fn id(&self) -> SpoolId {
        self.id
    }

    /// A record reader positioned at `offset`; offset 0 reads the
    /// envelope from the top, a recipient resume offset continues
    /// where a previous read left off.
    pub fn records_from(
        &mut self,
        offset: u64,
    ) -> Result<envelope::RecordReader<'_, File>, envelope::EnvelopeError> {
        envelope::RecordReader::new(&mut self.file, offset)
    }

    /// Mark the recipient record at `offset` as completed.
    pub fn mark_done(&mut self, offset: u64) -> Result<(), envelope::EnvelopeError> {
        envelope::mark_done(&mut self.file, offset)
    }
}

impl std::fmt::Debug for QueueFile {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("QueueFile").field("id", &self.id).finish()
    }
}

/// Build a queue file image in memory: envelope records, content,
/// terminator. Front-ends and tests use this before handing the
/// bytes to [`Spool`] storage via the filesystem.
pub fn build_queue_file(
    arrival: i64,
    sender: &str,
    recipients: &[&str],
    content: &[u8],
) -> anyhow::Result<(Vec<u8>, Vec<u64>)> {
    let mut buf = Vec::new();
    let mut offsets = Vec::with_capacity(recipients.len());
    {
        let mut w = envelope::RecordWriter::new(&mut buf);
        w.write(&envelope::Record::Time(arrival))?;
        w.write(&envelope::Record::From(sender.to_string()))?;
        for rcpt in recipients {
            offsets.push(w.write(&envelope::Record::Rcpt(rcpt.to_string()))?);
        }
        w.write_content(content)?;
        w.write(&envelope::Record::End)?;
        w.finish()?;
    }
    Ok((buf, offsets))
}

pub(crate) fn fsync_parent_dir(path: &std::path::Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

pub type SpoolHandle = std::sync::Arc<dyn Spool + Send + Sync>;
