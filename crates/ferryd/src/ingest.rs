//! Envelope harvesting: turn queue-file records into the batches the
//! scheduler core consumes, for first admission and for streaming
//! refills alike.

use envelope::{Record, Recipient};
use spool::QueueFile;

/// What one envelope read produced.
#[derive(Debug, Default)]
pub struct Harvest {
    pub arrival: Option<i64>,
    pub sender: Option<String>,
    pub recipients: Vec<Recipient>,
    /// Resume position for the next read; 0 when the end record was
    /// reached.
    pub rcpt_offset: u64,
}

#[derive(Debug)]
pub enum ReadOutcome {
    Batch(Harvest),
    /// The envelope is structurally damaged; quarantine the file.
    Corrupt(String),
}

/// Read envelope records starting at `offset`, harvesting up to
/// `limit` recipients. Recipients already marked done are skipped.
/// Stops early once the recipient budget is full, remembering where
/// to resume.
pub fn read_batch(file: &mut QueueFile, offset: u64, limit: usize) -> anyhow::Result<ReadOutcome> {
    assert!(limit > 0, "read_batch: no recipient slots available");
    let mut harvest = Harvest::default();
    let mut reader = match file.records_from(offset) {
        Ok(reader) => reader,
        Err(envelope::EnvelopeError::Io(err)) => return Err(err.into()),
        Err(err) => return Ok(ReadOutcome::Corrupt(err.to_string())),
    };
    loop {
        match reader.next_record() {
            Ok(Some((at, record))) => match record {
                Record::Time(t) => {
                    harvest.arrival.get_or_insert(t);
                }
                Record::From(sender) => {
                    if harvest.sender.is_none() {
                        harvest.sender = Some(sender);
                    }
                }
                Record::Rcpt(address) => {
                    harvest.recipients.push(Recipient {
                        address,
                        offset: at,
                    });
                    if harvest.recipients.len() >= limit {
                        harvest.rcpt_offset = reader.offset();
                        break;
                    }
                }
                // Delivered on a previous life of this file.
                Record::Done(_) => {}
                Record::Mesg(_) => {}
                Record::End => {
                    harvest.rcpt_offset = 0;
                    break;
                }
            },
            Ok(None) => {
                return Ok(ReadOutcome::Corrupt("missing end record".to_string()));
            }
            Err(envelope::EnvelopeError::Io(err)) => return Err(err.into()),
            Err(err) => return Ok(ReadOutcome::Corrupt(err.to_string())),
        }
    }

    // A first read must have produced the fixed envelope fields
    // before any dispatch can be built from this message.
    if offset == 0 && (harvest.arrival.is_none() || harvest.sender.is_none()) {
        return Ok(ReadOutcome::Corrupt(
            "envelope records out of order".to_string(),
        ));
    }
    Ok(ReadOutcome::Batch(harvest))
}
