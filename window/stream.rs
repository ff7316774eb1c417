// ========================================================================================
//                         Forward-only variant record streams
// ========================================================================================

use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error while streaming {source_name}: {source}")]
    Io {
        source_name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record {index} in {source_name}: {message}")]
    Malformed {
        source_name: String,
        index: usize,
        message: String,
    },
    #[error("stream {0} is closed")]
    Closed(String),
}

/// What the window needs to know about a record.
pub trait GenotypeRecord: Send + Sync {
    fn contig(&self) -> &str;
    fn position(&self) -> u32;
    fn variant_id(&self) -> &str;
}

/// A forward-only source of records sorted by contig, then position. Implementations
/// need not be safe for concurrent pulls; the window serializes them.
pub trait GenotypeStream: Send {
    type Record: GenotypeRecord;

    /// The next record, or `None` once the stream is exhausted.
    fn next_record(&mut self) -> Result<Option<Self::Record>, StreamError>;

    fn is_finished(&self) -> bool;

    /// Number of records returned so far.
    fn record_count(&self) -> usize;

    /// Total number of records, when the source knows it up front.
    fn len_hint(&self) -> Option<usize> {
        None
    }

    fn close(&mut self) -> Result<(), StreamError>;
}

/// An in-memory stream over already-materialised records.
#[derive(Debug)]
pub struct VecStream<R> {
    records: VecDeque<R>,
    delivered: usize,
    closed: bool,
}

impl<R> VecStream<R> {
    pub fn new(records: impl IntoIterator<Item = R>) -> Self {
        Self {
            records: records.into_iter().collect(),
            delivered: 0,
            closed: false,
        }
    }
}

impl<R: GenotypeRecord> GenotypeStream for VecStream<R> {
    type Record = R;

    fn next_record(&mut self) -> Result<Option<R>, StreamError> {
        if self.closed {
            return Err(StreamError::Closed("in-memory stream".to_string()));
        }
        let record = self.records.pop_front();
        if record.is_some() {
            self.delivered += 1;
        }
        Ok(record)
    }

    fn is_finished(&self) -> bool {
        self.records.is_empty()
    }

    fn record_count(&self) -> usize {
        self.delivered
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.delivered + self.records.len())
    }

    fn close(&mut self) -> Result<(), StreamError> {
        self.closed = true;
        self.records.clear();
        Ok(())
    }
}

/// A bare locus, enough to drive a window in tests and simple callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locus {
    pub contig: String,
    pub position: u32,
    pub id: String,
}

impl Locus {
    pub fn new(contig: &str, position: u32) -> Self {
        Self {
            contig: contig.to_string(),
            position,
            id: format!("{contig}:{position}"),
        }
    }
}

impl GenotypeRecord for Locus {
    fn contig(&self) -> &str {
        &self.contig
    }

    fn position(&self) -> u32 {
        self.position
    }

    fn variant_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_stream_counts_and_closes() {
        let mut stream = VecStream::new([Locus::new("1", 10), Locus::new("1", 20)]);
        assert!(!stream.is_finished());
        assert_eq!(stream.len_hint(), Some(2));
        assert_eq!(stream.next_record().unwrap().unwrap().id, "1:10");
        assert_eq!(stream.record_count(), 1);
        assert_eq!(stream.next_record().unwrap().unwrap().position, 20);
        assert!(stream.is_finished());
        assert!(stream.next_record().unwrap().is_none());
        assert_eq!(stream.record_count(), 2);

        stream.close().unwrap();
        assert!(matches!(stream.next_record(), Err(StreamError::Closed(_))));
    }
}
