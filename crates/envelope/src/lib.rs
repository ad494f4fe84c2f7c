//! Record codec for queue files.
//!
//! A queue file is a flat sequence of records: a single type byte, a
//! varint payload length, then the payload. The envelope section
//! (arrival time, sender, recipients) is followed by a content marker
//! whose payload gives the length of the content section, which
//! readers skip, and a terminating end record.
//!
//! Recipient completion is recorded by overwriting the type byte of a
//! recipient record in place. The payload is left untouched, so no
//! offset recorded anywhere else ever shifts, and a crash between the
//! overwrite and anything else leaves the file consistent.

use std::io::{Read, Seek, SeekFrom, Write};

mod reader;
mod writer;

pub use reader::RecordReader;
pub use writer::RecordWriter;

/// Arrival timestamp; payload is a decimal UNIX time.
pub const REC_TIME: u8 = b'T';
/// Envelope sender; payload is the address (may be empty).
pub const REC_FROM: u8 = b'F';
/// One recipient address.
pub const REC_RCPT: u8 = b'R';
/// A recipient whose delivery has completed; written by overwriting
/// the type byte of a `REC_RCPT` record in place.
pub const REC_DONE: u8 = b'D';
/// Start of message content; payload is the decimal content length.
pub const REC_MESG: u8 = b'M';
/// End of envelope.
pub const REC_END: u8 = b'E';

/// Payloads larger than this are rejected as corrupt rather than
/// allocated; queue files are written by trusted front-ends, so an
/// oversize length can only mean a damaged file.
const MAX_PAYLOAD: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown record type {0:#04x} at offset {1}")]
    BadTag(u8, u64),
    #[error("record payload length {0} exceeds limit at offset {1}")]
    OversizePayload(u64, u64),
    #[error("truncated record at offset {0}")]
    Truncated(u64),
    #[error("record payload is not valid utf-8 at offset {0}")]
    BadUtf8(u64),
    #[error("malformed numeric payload {0:?} at offset {1}")]
    BadNumber(String, u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Time(i64),
    From(String),
    Rcpt(String),
    /// A recipient already delivered on a previous life of this
    /// file; carries the (stale) address for diagnostics.
    Done(String),
    /// Start of content; the value is the content length in bytes.
    Mesg(u64),
    End,
}

impl Record {
    pub fn tag(&self) -> u8 {
        match self {
            Record::Time(_) => REC_TIME,
            Record::From(_) => REC_FROM,
            Record::Rcpt(_) => REC_RCPT,
            Record::Done(_) => REC_DONE,
            Record::Mesg(_) => REC_MESG,
            Record::End => REC_END,
        }
    }
}

/// One recipient as the scheduler tracks it: the address plus the
/// byte offset of its record in the queue file. The offset is the
/// durable identity used to mark the recipient done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub offset: u64,
}

/// Overwrite the type byte of the `REC_RCPT` record at `offset` with
/// `REC_DONE`, marking the recipient as delivered or bounced. Refuses
/// to touch anything that isn't a recipient record.
pub fn mark_done<F: Read + Write + Seek>(file: &mut F, offset: u64) -> Result<(), EnvelopeError> {
    file.seek(SeekFrom::Start(offset))?;
    let mut tag = [0u8; 1];
    file.read_exact(&mut tag)
        .map_err(|_| EnvelopeError::Truncated(offset))?;
    match tag[0] {
        REC_RCPT => {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&[REC_DONE])?;
            file.flush()?;
            Ok(())
        }
        // Completing the same recipient twice is harmless.
        REC_DONE => Ok(()),
        other => Err(EnvelopeError::BadTag(other, offset)),
    }
}

fn write_varint<W: Write>(w: &mut W, mut value: u64) -> std::io::Result<usize> {
    let mut buf = [0u8; 10];
    let mut n = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[n] = byte;
            n += 1;
            break;
        }
        buf[n] = byte | 0x80;
        n += 1;
    }
    w.write_all(&buf[..n])?;
    Ok(n)
}

fn read_varint<R: Read>(r: &mut R, at: u64) -> Result<(u64, usize), EnvelopeError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut n = 0;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)
            .map_err(|_| EnvelopeError::Truncated(at))?;
        n += 1;
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok((value, n));
        }
        shift += 7;
        if shift >= 64 {
            return Err(EnvelopeError::OversizePayload(u64::MAX, at));
        }
    }
}

fn parse_decimal(payload: &[u8], at: u64) -> Result<i64, EnvelopeError> {
    let text =
        std::str::from_utf8(payload).map_err(|_| EnvelopeError::BadUtf8(at))?;
    text.trim()
        .parse()
        .map_err(|_| EnvelopeError::BadNumber(text.to_string(), at))
}

fn payload_string(payload: Vec<u8>, at: u64) -> Result<String, EnvelopeError> {
    String::from_utf8(payload).map_err(|_| EnvelopeError::BadUtf8(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> (Vec<u8>, Vec<u64>) {
        let mut buf = Cursor::new(Vec::new());
        let mut w = RecordWriter::new(&mut buf);
        let mut offsets = vec![];
        offsets.push(w.write(&Record::Time(1700000000)).unwrap());
        offsets.push(w.write(&Record::From("sender@example.com".into())).unwrap());
        offsets.push(w.write(&Record::Rcpt("one@dest.example".into())).unwrap());
        offsets.push(w.write(&Record::Rcpt("two@dest.example".into())).unwrap());
        offsets.push(w.write_content(b"Subject: hi\r\n\r\nbody\r\n").unwrap());
        offsets.push(w.write(&Record::End).unwrap());
        (buf.into_inner(), offsets)
    }

    #[test]
    fn reads_what_was_written() {
        let (data, offsets) = sample();
        let mut cursor = Cursor::new(data);
        let mut r = RecordReader::new(&mut cursor, 0).unwrap();

        let (off, rec) = r.next_record().unwrap().unwrap();
        assert_eq!(off, offsets[0]);
        assert_eq!(rec, Record::Time(1700000000));

        let (_, rec) = r.next_record().unwrap().unwrap();
        assert_eq!(rec, Record::From("sender@example.com".into()));

        let (off, rec) = r.next_record().unwrap().unwrap();
        assert_eq!(off, offsets[2]);
        assert_eq!(rec, Record::Rcpt("one@dest.example".into()));

        let (_, rec) = r.next_record().unwrap().unwrap();
        assert_eq!(rec, Record::Rcpt("two@dest.example".into()));

        // Content section is skipped transparently.
        let (_, rec) = r.next_record().unwrap().unwrap();
        assert!(matches!(rec, Record::Mesg(_)));

        let (_, rec) = r.next_record().unwrap().unwrap();
        assert_eq!(rec, Record::End);
        assert!(r.next_record().unwrap().is_none());
    }

    #[test]
    fn resume_at_recipient_offset() {
        let (data, offsets) = sample();
        let mut cursor = Cursor::new(data);
        // Start reading at the second recipient, as a refill would.
        let mut r = RecordReader::new(&mut cursor, offsets[3]).unwrap();
        let (off, rec) = r.next_record().unwrap().unwrap();
        assert_eq!(off, offsets[3]);
        assert_eq!(rec, Record::Rcpt("two@dest.example".into()));
    }

    #[test]
    fn mark_done_is_offset_stable() {
        let (data, offsets) = sample();
        let mut cursor = Cursor::new(data);
        mark_done(&mut cursor, offsets[2]).unwrap();

        // Marking again is a no-op.
        mark_done(&mut cursor, offsets[2]).unwrap();

        let mut r = RecordReader::new(&mut cursor, offsets[2]).unwrap();
        let (off, rec) = r.next_record().unwrap().unwrap();
        assert_eq!(off, offsets[2]);
        assert_eq!(rec, Record::Done("one@dest.example".into()));

        // The following record is untouched and still where it was.
        let (off, rec) = r.next_record().unwrap().unwrap();
        assert_eq!(off, offsets[3]);
        assert_eq!(rec, Record::Rcpt("two@dest.example".into()));
    }

    #[test]
    fn mark_done_rejects_non_recipient_records() {
        let (data, offsets) = sample();
        let mut cursor = Cursor::new(data);
        let err = mark_done(&mut cursor, offsets[0]).unwrap_err();
        assert!(matches!(err, EnvelopeError::BadTag(REC_TIME, _)));
    }

    #[test]
    fn truncated_file_is_an_error_not_a_panic() {
        let (mut data, _) = sample();
        data.truncate(data.len() - 3);
        let mut cursor = Cursor::new(data);
        let mut r = RecordReader::new(&mut cursor, 0).unwrap();
        let last = loop {
            match r.next_record() {
                Ok(Some(_)) => continue,
                other => break other,
            }
        };
        assert!(matches!(last, Err(EnvelopeError::Truncated(_))));
    }

    #[test]
    fn bad_tag_is_reported_with_offset() {
        let mut data = Vec::new();
        data.push(b'x');
        data.push(0);
        let mut cursor = Cursor::new(data);
        let mut r = RecordReader::new(&mut cursor, 0).unwrap();
        let err = r.next_record().unwrap_err();
        assert!(matches!(err, EnvelopeError::BadTag(b'x', 0)));
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let mut data = Vec::new();
        data.push(REC_RCPT);
        write_varint(&mut data, MAX_PAYLOAD + 1).unwrap();
        let mut cursor = Cursor::new(data);
        let mut r = RecordReader::new(&mut cursor, 0).unwrap();
        let err = r.next_record().unwrap_err();
        assert!(matches!(err, EnvelopeError::OversizePayload(_, 0)));
    }
}
