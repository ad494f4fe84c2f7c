use crate::{write_varint, Record, EnvelopeError, REC_MESG};
use std::io::Write;

/// Appends records to a queue file being built, reporting the byte
/// offset of each record written. Front-end components use this to
/// lay down the envelope; the scheduler only ever reads.
pub struct RecordWriter<'a, W: Write> {
    inner: &'a mut W,
    offset: u64,
}

impl<'a, W: Write> RecordWriter<'a, W> {
    pub fn new(inner: &'a mut W) -> Self {
        Self { inner, offset: 0 }
    }

    /// Write one record, returning the offset it starts at.
    pub fn write(&mut self, record: &Record) -> Result<u64, EnvelopeError> {
        let payload: Vec<u8> = match record {
            Record::Time(t) => t.to_string().into_bytes(),
            Record::From(addr) | Record::Rcpt(addr) | Record::Done(addr) => {
                addr.clone().into_bytes()
            }
            Record::Mesg(len) => len.to_string().into_bytes(),
            Record::End => vec![],
        };
        self.write_raw(record.tag(), &payload)
    }

    /// Write the content marker followed by the content bytes,
    /// returning the offset of the marker record.
    pub fn write_content(&mut self, content: &[u8]) -> Result<u64, EnvelopeError> {
        let at = self.write_raw(REC_MESG, content.len().to_string().as_bytes())?;
        self.inner.write_all(content)?;
        self.offset += content.len() as u64;
        Ok(at)
    }

    fn write_raw(&mut self, tag: u8, payload: &[u8]) -> Result<u64, EnvelopeError> {
        let at = self.offset;
        self.inner.write_all(&[tag])?;
        let len_bytes = write_varint(&mut self.inner, payload.len() as u64)?;
        self.inner.write_all(payload)?;
        self.offset += 1 + len_bytes as u64 + payload.len() as u64;
        Ok(at)
    }

    pub fn finish(self) -> Result<u64, EnvelopeError> {
        self.inner.flush()?;
        Ok(self.offset)
    }
}
