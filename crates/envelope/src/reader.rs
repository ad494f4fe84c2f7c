use crate::{
    parse_decimal, payload_string, read_varint, EnvelopeError, Record, MAX_PAYLOAD, REC_DONE,
    REC_END, REC_FROM, REC_MESG, REC_RCPT, REC_TIME,
};
use std::io::{BufReader, Read, Seek, SeekFrom};

/// Sequential record reader positioned at a byte offset within a
/// queue file. Tracks the offset of every record it returns so that
/// callers can persist resume positions and completion markers.
pub struct RecordReader<'a, F: Read + Seek> {
    inner: BufReader<&'a mut F>,
    offset: u64,
    done: bool,
}

impl<'a, F: Read + Seek> RecordReader<'a, F> {
    pub fn new(file: &'a mut F, offset: u64) -> Result<Self, EnvelopeError> {
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            inner: BufReader::new(file),
            offset,
            done: false,
        })
    }

    /// The offset the next record would be read from; after `End`
    /// this is the position just past the envelope.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next record, returning its starting offset alongside
    /// it. Returns `None` at end of file and after an `End` record.
    /// The content section introduced by a `Mesg` record is skipped
    /// in full; the caller only ever sees envelope records.
    pub fn next_record(&mut self) -> Result<Option<(u64, Record)>, EnvelopeError> {
        if self.done {
            return Ok(None);
        }
        let at = self.offset;

        let mut tag = [0u8; 1];
        match self.inner.read(&mut tag)? {
            0 => return Ok(None),
            _ => {}
        }

        let (len, len_bytes) = read_varint(&mut self.inner, at)?;
        if len > MAX_PAYLOAD {
            return Err(EnvelopeError::OversizePayload(len, at));
        }
        let mut payload = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut payload)
            .map_err(|_| EnvelopeError::Truncated(at))?;
        self.offset = at + 1 + len_bytes as u64 + len;

        let record = match tag[0] {
            REC_TIME => Record::Time(parse_decimal(&payload, at)?),
            REC_FROM => Record::From(payload_string(payload, at)?),
            REC_RCPT => Record::Rcpt(payload_string(payload, at)?),
            REC_DONE => Record::Done(payload_string(payload, at)?),
            REC_MESG => {
                let content_len = parse_decimal(&payload, at)? as u64;
                self.inner.seek_relative(content_len as i64)?;
                self.offset += content_len;
                Record::Mesg(content_len)
            }
            REC_END => {
                self.done = true;
                Record::End
            }
            other => return Err(EnvelopeError::BadTag(other, at)),
        };
        Ok(Some((at, record)))
    }
}
