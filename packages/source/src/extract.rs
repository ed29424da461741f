//! Chunked reading of tabular extracts.
//!
//! An extract is a CSV file with a header row and one record per line.
//! [`ExtractReader`] yields it as fixed-size chunks of [`RawRow`] objects
//! keyed by the (raw, untouched) header names, so memory stays bounded no
//! matter how large the file is.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::{RawRow, SourceError};

/// Streams an extract in chunks of at most `chunk_size` rows.
pub struct ExtractReader<R: Read> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    chunk_size: usize,
    finished: bool,
}

impl ExtractReader<File> {
    /// Opens the extract at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the file cannot be opened or has no
    /// header row.
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        Self::from_reader(file, chunk_size, &path.display().to_string())
    }
}

impl<R: Read> ExtractReader<R> {
    /// Wraps any reader producing CSV bytes. `label` is only used in errors.
    ///
    /// A `chunk_size` of zero is treated as one.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the header row cannot be read or is empty.
    pub fn from_reader(inner: R, chunk_size: usize, label: &str) -> Result<Self, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_reader(inner);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_owned())
            .collect();

        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(SourceError::MissingHeader {
                label: label.to_owned(),
            });
        }

        Ok(Self {
            reader,
            headers,
            chunk_size: chunk_size.max(1),
            finished: false,
        })
    }

    /// The raw header names, in file order.
    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Reads the next chunk. Returns `Ok(None)` once the file is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Csv`] if a record cannot be decoded.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<RawRow>>, SourceError> {
        if self.finished {
            return Ok(None);
        }

        let mut chunk = Vec::with_capacity(self.chunk_size);
        let mut record = csv::StringRecord::new();

        while chunk.len() < self.chunk_size {
            if !self.reader.read_record(&mut record)? {
                self.finished = true;
                break;
            }

            let mut map = serde_json::Map::with_capacity(self.headers.len());
            for (i, header) in self.headers.iter().enumerate() {
                let value = record.get(i).unwrap_or("");
                map.insert(header.clone(), serde_json::Value::String(value.to_owned()));
            }
            chunk.push(serde_json::Value::Object(map));
        }

        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }
}

impl<R: Read> Iterator for ExtractReader<R> {
    type Item = Result<Vec<RawRow>, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    const SAMPLE: &str = "\
Unique Key,Created Date,Borough,Latitude
1,01/01/2023 12:00:00 AM,QUEENS,40.7
2,01/02/2023 12:00:00 AM,BRONX,
3,01/03/2023 12:00:00 AM,,40.8
4,01/04/2023 12:00:00 AM,BROOKLYN,40.6
5,01/05/2023 12:00:00 AM,MANHATTAN,40.75
";

    #[test]
    fn yields_fixed_size_chunks() {
        let reader = ExtractReader::from_reader(SAMPLE.as_bytes(), 2, "sample").unwrap();
        let sizes: Vec<usize> = reader.map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn rows_are_keyed_by_raw_headers() {
        let mut reader = ExtractReader::from_reader(SAMPLE.as_bytes(), 10, "sample").unwrap();
        assert_eq!(reader.headers()[0], "Unique Key");
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.len(), 5);
        assert_eq!(chunk[1]["Unique Key"], "2");
        assert_eq!(chunk[1]["Latitude"], "");
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn short_records_are_padded() {
        let data = "a,b,c\n1,2\n";
        let mut reader = ExtractReader::from_reader(data.as_bytes(), 10, "short").unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk[0]["c"], "");
    }

    #[test]
    fn empty_file_has_no_header() {
        let result = ExtractReader::from_reader("".as_bytes(), 10, "empty");
        assert!(matches!(result, Err(SourceError::MissingHeader { .. })));
    }

    #[test]
    fn header_only_file_yields_nothing() {
        let reader = ExtractReader::from_reader("a,b\n".as_bytes(), 10, "header").unwrap();
        assert_eq!(reader.count(), 0);
    }

    #[test]
    fn opens_files_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let reader = ExtractReader::open(file.path(), 3).unwrap();
        let total: usize = reader.map(|c| c.unwrap().len()).sum();
        assert_eq!(total, 5);
    }
}
