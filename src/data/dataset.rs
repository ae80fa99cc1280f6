//! Lazy, batched, shuffled record streams
//!
//! The source files are repeated, cut into fixed size batches and then passed
//! through a bounded shuffle window of whole batches. Batches may straddle an
//! epoch boundary; a finite stream ends with at most one partial batch.

use crate::data::decoder::{Decoder, Record, RecordIter};
use crate::{HarnessError, Result, RunConfig};
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

/// Builds [`DatasetStream`]s over a glob of source files
#[derive(Clone)]
pub struct DatasetPipeline {
    decoder: Arc<dyn Decoder>,
    batch_size: usize,
    epochs: Option<usize>,
    shuffle_buffer_size: usize,
    seed: Option<u64>,
}

impl DatasetPipeline {
    /// Single pass, no shuffling
    pub fn new(decoder: Arc<dyn Decoder>, batch_size: usize) -> Self {
        DatasetPipeline {
            decoder,
            batch_size: batch_size.max(1),
            epochs: Some(1),
            shuffle_buffer_size: 0,
            seed: None,
        }
    }

    /// Pipeline used for training and validation: repeated `epochs` times and
    /// shuffled through a window of three times the training batch size
    pub fn from_config(config: &RunConfig, batch_size: usize, epochs: Option<usize>) -> Self {
        let decoder = crate::data::decoder_for_config(config, config.data.train_file_format);
        DatasetPipeline::new(Arc::from(decoder), batch_size)
            .with_epochs(epochs)
            .with_shuffle_buffer(3 * config.training.train_batch_size)
            .with_seed(config.data.shuffle_seed)
    }

    /// `None` repeats forever
    pub fn with_epochs(mut self, epochs: Option<usize>) -> Self {
        self.epochs = epochs;
        self
    }

    /// Window size in batches; 0 or 1 keeps the original order
    pub fn with_shuffle_buffer(mut self, batches: usize) -> Self {
        self.shuffle_buffer_size = batches;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Resolve the sources and check they can be opened. No record is read.
    pub fn build(&self, pattern: &str) -> Result<DatasetStream> {
        let sources = resolve_sources(pattern)?;
        log::debug!(
            "Dataset {} resolved to {} file(s), batch size {}",
            pattern,
            sources.len(),
            self.batch_size
        );

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(DatasetStream {
            decoder: Arc::clone(&self.decoder),
            sources,
            batch_size: self.batch_size,
            epochs: self.epochs,
            passes: 0,
            source_index: 0,
            current: None,
            records_this_pass: 0,
            upstream_done: false,
            window: Vec::new(),
            window_size: self.shuffle_buffer_size,
            rng,
            failed: false,
        })
    }
}

/// Expand a glob into a sorted list of readable files
pub fn resolve_sources(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for entry in glob::glob(pattern)? {
        let path = entry.map_err(|e| HarnessError::StreamInitialization {
            path: pattern.to_string(),
            message: e.to_string(),
        })?;
        if path.is_file() {
            sources.push(path);
        }
    }

    if sources.is_empty() {
        return Err(HarnessError::StreamInitialization {
            path: pattern.to_string(),
            message: "no files match".to_string(),
        });
    }
    sources.sort();

    for path in &sources {
        File::open(path).map_err(|e| HarnessError::StreamInitialization {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    }

    Ok(sources)
}

/// A pull-based sequence of record batches.
///
/// `next_batch` returns `Ok(None)` once the stream is exhausted; a decode error
/// is returned once and ends the stream.
pub struct DatasetStream {
    decoder: Arc<dyn Decoder>,
    sources: Vec<PathBuf>,
    batch_size: usize,
    epochs: Option<usize>,
    passes: usize,
    source_index: usize,
    current: Option<RecordIter>,
    records_this_pass: usize,
    upstream_done: bool,
    window: Vec<Vec<Record>>,
    window_size: usize,
    rng: StdRng,
    failed: bool,
}

impl DatasetStream {
    pub fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        if self.failed {
            return Ok(None);
        }
        let batch = self.shuffled_batch();
        if batch.is_err() {
            self.failed = true;
        }
        batch
    }

    fn shuffled_batch(&mut self) -> Result<Option<Vec<Record>>> {
        if self.window_size <= 1 {
            return self.next_raw_batch();
        }

        while self.window.len() < self.window_size {
            match self.next_raw_batch()? {
                Some(batch) => self.window.push(batch),
                None => break,
            }
        }

        if self.window.is_empty() {
            return Ok(None);
        }
        let pick = self.rng.gen_range(0..self.window.len());
        Ok(Some(self.window.swap_remove(pick)))
    }

    fn next_raw_batch(&mut self) -> Result<Option<Vec<Record>>> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.next_record()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(if batch.is_empty() { None } else { Some(batch) })
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if self.upstream_done {
                return Ok(None);
            }

            if let Some(records) = self.current.as_mut() {
                match records.next() {
                    Some(record) => {
                        self.records_this_pass += 1;
                        return record.map(Some);
                    }
                    None => {
                        self.current = None;
                        self.source_index += 1;
                    }
                }
            }

            if self.source_index >= self.sources.len() {
                self.passes += 1;
                self.source_index = 0;
                let all_passes_done = self.epochs.is_some_and(|n| self.passes >= n);
                // An empty pass would otherwise spin forever on an infinite stream
                if all_passes_done || self.records_this_pass == 0 {
                    self.upstream_done = true;
                    continue;
                }
                log::debug!("Dataset pass {} complete", self.passes);
                self.records_this_pass = 0;
            }

            if self.current.is_none() {
                self.current = Some(self.decoder.open(&self.sources[self.source_index])?);
            }
        }
    }
}

impl Iterator for DatasetStream {
    type Item = Result<Vec<Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

/// Read every record of a single file into memory
pub fn load_table(decoder: &dyn Decoder, path: &str) -> Result<Vec<Record>> {
    let path = PathBuf::from(path);
    decoder.open(&path)?.collect()
}

/// A batch of records as tensors
#[derive(Debug, Clone)]
pub struct TabularBatch<B: Backend> {
    /// [batch, feature_size]
    pub features: Tensor<B, 2>,
    /// Class indices for classification, [batch]
    pub class_targets: Tensor<B, 1, Int>,
    /// Raw label values for regression, [batch, 1]
    pub value_targets: Tensor<B, 2>,
    /// Labels as read, for host-side metrics
    pub labels: Vec<f32>,
}

/// Turns decoded records into [`TabularBatch`]es
#[derive(Debug, Clone, Copy)]
pub struct TabularBatcher {
    feature_size: usize,
}

impl TabularBatcher {
    pub fn new(feature_size: usize) -> Self {
        TabularBatcher { feature_size }
    }
}

impl<B: Backend> Batcher<B, Record, TabularBatch<B>> for TabularBatcher {
    fn batch(&self, items: Vec<Record>, device: &B::Device) -> TabularBatch<B> {
        let batch_size = items.len();

        let mut feature_data = Vec::with_capacity(batch_size * self.feature_size);
        let mut classes = Vec::with_capacity(batch_size);
        let mut labels = Vec::with_capacity(batch_size);
        for record in &items {
            feature_data.extend_from_slice(&record.features);
            classes.push(record.label.round() as i64);
            labels.push(record.label);
        }

        let features = Tensor::<B, 1>::from_floats(feature_data.as_slice(), device)
            .reshape([batch_size, self.feature_size]);
        let class_targets = Tensor::<B, 1, Int>::from_ints(classes.as_slice(), device);
        let value_targets =
            Tensor::<B, 1>::from_floats(labels.as_slice(), device).reshape([batch_size, 1]);

        TabularBatch {
            features,
            class_targets,
            value_targets,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::decoder::{BinaryRecordWriter, CsvDecoder};
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn write_rows(dir: &TempDir, name: &str, rows: usize, offset: usize) {
        let content: String = (0..rows)
            .map(|i| format!("{},{},{}\n", i + offset, (i + offset) * 2, i % 2))
            .collect();
        std::fs::write(dir.path().join(name), content).unwrap();
    }

    fn pipeline(batch_size: usize) -> DatasetPipeline {
        DatasetPipeline::new(Arc::new(CsvDecoder::new(2)), batch_size)
    }

    fn pattern(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).display().to_string()
    }

    #[test]
    fn test_single_epoch_yields_ceil_batches() {
        let dir = TempDir::new().unwrap();
        write_rows(&dir, "train.csv", 10, 0);

        let stream = pipeline(4).build(&pattern(&dir, "train.csv")).unwrap();
        let sizes: Vec<usize> = stream.map(|b| b.unwrap().len()).collect();

        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_batches_cross_epoch_boundary() {
        let dir = TempDir::new().unwrap();
        write_rows(&dir, "train.csv", 5, 0);

        let stream = pipeline(4)
            .with_epochs(Some(2))
            .build(&pattern(&dir, "train.csv"))
            .unwrap();
        let batches: Vec<Vec<Record>> = stream.map(|b| b.unwrap()).collect();

        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![4, 4, 2]);
        // Second batch starts with the last record of pass one
        assert_eq!(batches[1][0].features[0], 4.0);
        assert_eq!(batches[1][1].features[0], 0.0);
    }

    #[test]
    fn test_glob_spans_files_in_order() {
        let dir = TempDir::new().unwrap();
        write_rows(&dir, "part-0.csv", 3, 0);
        write_rows(&dir, "part-1.csv", 3, 100);

        let stream = pipeline(6).build(&pattern(&dir, "part-*.csv")).unwrap();
        let batches: Vec<Vec<Record>> = stream.map(|b| b.unwrap()).collect();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][3].features[0], 100.0);
    }

    #[test]
    fn test_infinite_stream_keeps_going() {
        let dir = TempDir::new().unwrap();
        write_rows(&dir, "train.csv", 3, 0);

        let mut stream = pipeline(2)
            .with_epochs(None)
            .build(&pattern(&dir, "train.csv"))
            .unwrap();
        for _ in 0..50 {
            assert_eq!(stream.next_batch().unwrap().unwrap().len(), 2);
        }
    }

    #[test]
    fn test_empty_source_ends_infinite_stream() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty.csv"), "").unwrap();

        let mut stream = pipeline(2)
            .with_epochs(None)
            .build(&pattern(&dir, "empty.csv"))
            .unwrap();
        assert!(stream.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_shuffle_keeps_every_batch() {
        let dir = TempDir::new().unwrap();
        write_rows(&dir, "train.csv", 40, 0);

        let stream = pipeline(4)
            .with_shuffle_buffer(3)
            .with_seed(Some(42))
            .build(&pattern(&dir, "train.csv"))
            .unwrap();
        let mut firsts: Vec<f32> = stream.map(|b| b.unwrap()[0].features[0]).collect();
        firsts.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let expected: Vec<f32> = (0..10).map(|i| (i * 4) as f32).collect();
        assert_eq!(firsts, expected);
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let dir = TempDir::new().unwrap();
        write_rows(&dir, "train.csv", 40, 0);
        let build = || {
            pipeline(2)
                .with_shuffle_buffer(6)
                .with_seed(Some(7))
                .build(&pattern(&dir, "train.csv"))
                .unwrap()
                .map(|b| b.unwrap()[0].features[0])
                .collect::<Vec<f32>>()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_missing_source_fails_at_build() {
        let dir = TempDir::new().unwrap();
        let result = pipeline(4).build(&pattern(&dir, "missing-*.csv"));
        assert!(matches!(
            result,
            Err(HarnessError::StreamInitialization { .. })
        ));
    }

    #[test]
    fn test_decode_error_aborts_stream() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.csv"), "1,2,0\n1,2\n3,4,1\n").unwrap();

        let mut stream = pipeline(1).build(&pattern(&dir, "bad.csv")).unwrap();
        assert!(stream.next_batch().unwrap().is_some());
        assert!(matches!(
            stream.next_batch(),
            Err(HarnessError::Decode { .. })
        ));
        assert!(stream.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_binary_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.bin");
        let mut writer = BinaryRecordWriter::create(&path).unwrap();
        for i in 0..7 {
            writer.write(&Record::new(vec![i as f32, 0.0], 1.0)).unwrap();
        }
        writer.finish().unwrap();

        let decoder = crate::data::decoder_for(crate::FileFormat::RecordBinary, 2);
        let stream = DatasetPipeline::new(Arc::from(decoder), 3)
            .build(&path.display().to_string())
            .unwrap();
        assert_eq!(stream.count(), 3);
    }

    #[test]
    fn test_batcher_shapes() {
        let device = NdArrayDevice::default();
        let records = vec![
            Record::new(vec![1.0, 2.0, 3.0], 1.0),
            Record::new(vec![4.0, 5.0, 6.0], 0.0),
        ];
        let batch = Batcher::<TestBackend, Record, TabularBatch<TestBackend>>::batch(
            &TabularBatcher::new(3),
            records,
            &device,
        );

        assert_eq!(batch.features.dims(), [2, 3]);
        assert_eq!(batch.class_targets.dims(), [2]);
        assert_eq!(batch.value_targets.dims(), [2, 1]);
        assert_eq!(batch.labels, vec![1.0, 0.0]);
    }
}
