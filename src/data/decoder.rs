//! Record decoders for the two on-disk formats
//!
//! Delimited text holds one record per line: `feature_size` float columns
//! followed by the label. Record binary holds length-prefixed frames:
//!
//! ```text
//! u64 LE payload length | u32 LE feature count | f32 LE * count | f32 LE label
//! ```

use crate::{FileFormat, HarnessError, Result, RunConfig, Scenario};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

/// Default for an empty feature cell in delimited text
const MISSING_FEATURE: f32 = 1.0;
/// Default for an empty label cell in delimited text
const MISSING_LABEL: f32 = 0.0;

/// One decoded record
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub features: Vec<f32>,
    pub label: f32,
}

impl Record {
    pub fn new(features: Vec<f32>, label: f32) -> Self {
        Record { features, label }
    }
}

pub type RecordIter = Box<dyn Iterator<Item = Result<Record>> + Send>;

/// Turns one source file into a lazy record sequence
pub trait Decoder: Send + Sync {
    /// Open the file; records are decoded as the iterator is pulled
    fn open(&self, path: &Path) -> Result<RecordIter>;
}

/// Pick the decoder for a configured format
pub fn decoder_for(format: FileFormat, feature_size: usize) -> Box<dyn Decoder> {
    match format {
        FileFormat::RecordBinary => Box::new(BinaryDecoder::new(feature_size)),
        FileFormat::DelimitedText => Box::new(CsvDecoder::new(feature_size)),
    }
}

/// Decoder for a configured source: classification labels are checked
/// against `label_size`, regression labels are taken as read
pub fn decoder_for_config(config: &RunConfig, format: FileFormat) -> Box<dyn Decoder> {
    let decoder = decoder_for(format, config.data.feature_size);
    match config.scenario {
        Scenario::Classification => Box::new(ClassLabelDecoder::new(decoder, config.data.label_size)),
        Scenario::Regression => decoder,
    }
}

fn open_error(path: &Path, e: impl std::fmt::Display) -> HarnessError {
    HarnessError::StreamInitialization {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct CsvDecoder {
    feature_size: usize,
}

impl CsvDecoder {
    pub fn new(feature_size: usize) -> Self {
        CsvDecoder { feature_size }
    }

    fn parse_row(&self, row: &csv::StringRecord, path: &str, index: usize) -> Result<Record> {
        let decode_error = |message: String| HarnessError::Decode {
            path: path.to_string(),
            index,
            message,
        };

        if row.len() != self.feature_size + 1 {
            return Err(decode_error(format!(
                "expected {} columns, found {}",
                self.feature_size + 1,
                row.len()
            )));
        }

        let parse_cell = |cell: &str, default: f32| -> Result<f32> {
            if cell.is_empty() {
                return Ok(default);
            }
            cell.parse::<f32>()
                .map_err(|_| decode_error(format!("cannot parse '{}' as a number", cell)))
        };

        let features = row
            .iter()
            .take(self.feature_size)
            .map(|cell| parse_cell(cell, MISSING_FEATURE))
            .collect::<Result<Vec<f32>>>()?;
        let label = parse_cell(&row[self.feature_size], MISSING_LABEL)?;

        Ok(Record::new(features, label))
    }
}

impl Decoder for CsvDecoder {
    fn open(&self, path: &Path) -> Result<RecordIter> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| open_error(path, e))?;

        let decoder = self.clone();
        let display = path.display().to_string();
        let records = reader
            .into_records()
            .enumerate()
            .map(move |(index, row)| match row {
                Ok(row) => decoder.parse_row(&row, &display, index),
                Err(e) => Err(HarnessError::Decode {
                    path: display.clone(),
                    index,
                    message: e.to_string(),
                }),
            });

        Ok(Box::new(records))
    }
}

#[derive(Debug, Clone)]
pub struct BinaryDecoder {
    feature_size: usize,
}

impl BinaryDecoder {
    pub fn new(feature_size: usize) -> Self {
        BinaryDecoder { feature_size }
    }
}

impl Decoder for BinaryDecoder {
    fn open(&self, path: &Path) -> Result<RecordIter> {
        let file = File::open(path).map_err(|e| open_error(path, e))?;
        Ok(Box::new(BinaryFrames {
            reader: BufReader::new(file),
            path: path.display().to_string(),
            feature_size: self.feature_size,
            index: 0,
            failed: false,
        }))
    }
}

struct BinaryFrames {
    reader: BufReader<File>,
    path: String,
    feature_size: usize,
    index: usize,
    failed: bool,
}

impl BinaryFrames {
    fn decode_error(&self, message: impl Into<String>) -> HarnessError {
        HarnessError::Decode {
            path: self.path.clone(),
            index: self.index,
            message: message.into(),
        }
    }

    /// Returns `Ok(None)` on a clean end of file between frames
    fn read_frame(&mut self) -> Result<Option<Record>> {
        let mut len_bytes = [0u8; 8];
        let mut filled = 0;
        while filled < len_bytes.len() {
            match self.reader.read(&mut len_bytes[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(self.decode_error("truncated frame length")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(HarnessError::Io(e)),
            }
        }

        let payload_len = u64::from_le_bytes(len_bytes) as usize;
        let expected = 4 + 4 * self.feature_size + 4;
        if payload_len != expected {
            return Err(self.decode_error(format!(
                "frame holds {} bytes, expected {} for {} features",
                payload_len, expected, self.feature_size
            )));
        }

        let mut payload = vec![0u8; payload_len];
        self.reader.read_exact(&mut payload).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                self.decode_error("truncated frame payload")
            } else {
                HarnessError::Io(e)
            }
        })?;

        let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        if count != self.feature_size {
            return Err(self.decode_error(format!(
                "record has {} features, expected {}",
                count, self.feature_size
            )));
        }

        let mut floats = payload[4..]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        let features: Vec<f32> = floats.by_ref().take(count).collect();
        let label = floats
            .next()
            .ok_or_else(|| self.decode_error("missing label"))?;

        Ok(Some(Record::new(features, label)))
    }
}

impl Iterator for BinaryFrames {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let frame = self.read_frame().transpose();
        match &frame {
            Some(Ok(_)) => self.index += 1,
            Some(Err(_)) => self.failed = true,
            None => {}
        }
        frame
    }
}

/// Rejects records whose label is not a class index below `classes`
pub struct ClassLabelDecoder {
    inner: Box<dyn Decoder>,
    classes: usize,
}

impl ClassLabelDecoder {
    pub fn new(inner: Box<dyn Decoder>, classes: usize) -> Self {
        ClassLabelDecoder { inner, classes }
    }
}

impl Decoder for ClassLabelDecoder {
    fn open(&self, path: &Path) -> Result<RecordIter> {
        let classes = self.classes;
        let display = path.display().to_string();
        let records = self
            .inner
            .open(path)?
            .enumerate()
            .map(move |(index, record)| {
                let record = record?;
                let label = record.label;
                if label >= 0.0 && label.fract() == 0.0 && (label as usize) < classes {
                    Ok(record)
                } else {
                    Err(HarnessError::Decode {
                        path: display.clone(),
                        index,
                        message: format!("label {} is not a class in 0..{}", label, classes),
                    })
                }
            })
            .scan(false, |failed, record| {
                if *failed {
                    return None;
                }
                *failed = record.is_err();
                Some(record)
            });

        Ok(Box::new(records))
    }
}

/// Writes records in the record-binary frame format
pub struct BinaryRecordWriter {
    writer: BufWriter<File>,
    written: usize,
}

impl BinaryRecordWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(BinaryRecordWriter {
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn write(&mut self, record: &Record) -> Result<()> {
        let payload_len = 4 + 4 * record.features.len() + 4;
        self.writer.write_all(&(payload_len as u64).to_le_bytes())?;
        self.writer
            .write_all(&(record.features.len() as u32).to_le_bytes())?;
        for value in &record.features {
            self.writer.write_all(&value.to_le_bytes())?;
        }
        self.writer.write_all(&record.label.to_le_bytes())?;
        self.written += 1;
        Ok(())
    }

    /// Flush and return the number of records written
    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush()?;
        Ok(self.written)
    }
}

/// Re-encode a delimited-text file as record binary
pub fn convert_csv_to_binary(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    feature_size: usize,
) -> Result<usize> {
    let records = CsvDecoder::new(feature_size).open(input.as_ref())?;
    let mut writer = BinaryRecordWriter::create(output)?;
    for record in records {
        writer.write(&record?)?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_csv_label_in_last_column() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "a.csv", "1.5,2,3,1\n4,5,6,0\n");

        let records: Vec<Record> = CsvDecoder::new(3)
            .open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].features, vec![1.5, 2.0, 3.0]);
        assert_eq!(records[0].label, 1.0);
        assert_eq!(records[1].label, 0.0);
    }

    #[test]
    fn test_csv_empty_cells_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "a.csv", "2,,\n");

        let record = CsvDecoder::new(2).open(&path).unwrap().next().unwrap().unwrap();
        assert_eq!(record.features, vec![2.0, 1.0]);
        assert_eq!(record.label, 0.0);
    }

    #[test]
    fn test_csv_malformed_row_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "a.csv", "1,2,0\n1,abc,1\n");

        let mut records = CsvDecoder::new(2).open(&path).unwrap();
        assert!(records.next().unwrap().is_ok());
        match records.next().unwrap() {
            Err(HarnessError::Decode { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_stream_error() {
        let err = BinaryDecoder::new(2)
            .open(Path::new("/nonexistent/train.bin"))
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::StreamInitialization { .. }));
    }

    #[test]
    fn test_binary_frames_decode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.bin");
        let mut writer = BinaryRecordWriter::create(&path).unwrap();
        writer.write(&Record::new(vec![0.5, -1.0], 1.0)).unwrap();
        writer.write(&Record::new(vec![2.0, 3.0], 0.0)).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let records: Vec<Record> = BinaryDecoder::new(2)
            .open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records[0], Record::new(vec![0.5, -1.0], 1.0));
        assert_eq!(records[1], Record::new(vec![2.0, 3.0], 0.0));
    }

    #[test]
    fn test_truncated_binary_frame_aborts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.bin");
        let mut writer = BinaryRecordWriter::create(&path).unwrap();
        writer.write(&Record::new(vec![0.5, -1.0], 1.0)).unwrap();
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let full = bytes.clone();
        bytes.extend_from_slice(&full[..full.len() - 3]);
        std::fs::write(&path, &bytes).unwrap();

        let results: Vec<Result<Record>> = BinaryDecoder::new(2).open(&path).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(HarnessError::Decode { index: 1, .. })
        ));
    }

    #[test]
    fn test_binary_feature_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.bin");
        let mut writer = BinaryRecordWriter::create(&path).unwrap();
        writer.write(&Record::new(vec![0.5, -1.0, 3.0], 1.0)).unwrap();
        writer.finish().unwrap();

        let first = BinaryDecoder::new(2).open(&path).unwrap().next().unwrap();
        assert!(matches!(first, Err(HarnessError::Decode { .. })));
    }

    #[test]
    fn test_convert_csv_to_binary() {
        let dir = TempDir::new().unwrap();
        let csv_path = write_csv(&dir, "a.csv", "1,2,1\n3,4,0\n5,6,1\n");
        let bin_path = dir.path().join("a.bin");

        assert_eq!(convert_csv_to_binary(&csv_path, &bin_path, 2).unwrap(), 3);

        let records: Vec<Record> = BinaryDecoder::new(2)
            .open(&bin_path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records[2], Record::new(vec![5.0, 6.0], 1.0));
    }

    #[test]
    fn test_out_of_range_class_label_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "a.csv", "1,2,0\n3,4,5\n5,6,1\n");

        let decoder = ClassLabelDecoder::new(Box::new(CsvDecoder::new(2)), 2);
        let mut records = decoder.open(&path).unwrap();
        assert!(records.next().unwrap().is_ok());
        match records.next().unwrap() {
            Err(HarnessError::Decode { index, message, .. }) => {
                assert_eq!(index, 1);
                assert!(message.contains('5'));
            }
            other => panic!("expected decode error, got {:?}", other),
        }
        // The stream ends after the first bad record
        assert!(records.next().is_none());
    }

    #[test]
    fn test_negative_and_fractional_labels_rejected() {
        let dir = TempDir::new().unwrap();
        for content in ["1,2,-1\n", "1,2,0.5\n"] {
            let path = write_csv(&dir, "a.csv", content);
            let decoder = ClassLabelDecoder::new(Box::new(CsvDecoder::new(2)), 2);
            let first = decoder.open(&path).unwrap().next().unwrap();
            assert!(matches!(first, Err(HarnessError::Decode { .. })), "{}", content);
        }
    }

    #[test]
    fn test_regression_labels_are_not_checked() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "a.csv", "1,2,7.25\n");

        let mut config = RunConfig::default();
        config.scenario = Scenario::Regression;
        config.data.feature_size = 2;
        config.data.label_size = 1;
        let records: Vec<Record> = decoder_for_config(&config, FileFormat::DelimitedText)
            .open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records[0].label, 7.25);

        config.scenario = Scenario::Classification;
        config.data.label_size = 2;
        let first = decoder_for_config(&config, FileFormat::DelimitedText)
            .open(&path)
            .unwrap()
            .next()
            .unwrap();
        assert!(matches!(first, Err(HarnessError::Decode { .. })));
    }
}
