use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use crate::compress::PageCompressor;
use crate::diff::PageHash;
use crate::error::{RamSnapshotError, Result};
use crate::format::{PageFlag, PageRecord, HEADER_LEN};
use crate::host::SnapshotBackend;

/// Batches in flight between the producer and a background writer.
const QUEUE_DEPTH: usize = 4;

/// A changed page handed to the writer. The bytes are a private copy, so guest memory is only
/// borrowed on the producer side.
#[derive(Debug)]
pub(crate) struct PageJob {
    pub block: usize,
    pub page: u32,
    pub data: Vec<u8>,
    pub hash: PageHash,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WrittenPage {
    pub block: usize,
    pub page: u32,
    pub record: PageRecord,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriterStats {
    pub raw_pages: u64,
    pub compressed_pages: u64,
    pub payload_bytes: u64,
}

/// Appends page payloads to the save stream. Owns the backend until the save is joined.
pub(crate) struct PageWriter<B> {
    backend: B,
    pos: u64,
    compressor: Option<PageCompressor>,
    combine: Vec<u8>,
    written: Vec<WrittenPage>,
    stats: WriterStats,
}

pub(crate) struct FinishedWriter<B> {
    pub backend: B,
    pub end_pos: u64,
    pub written: Vec<WrittenPage>,
    pub stats: WriterStats,
}

impl<B: SnapshotBackend> PageWriter<B> {
    pub fn new(backend: B, compress: bool) -> Self {
        Self {
            backend,
            pos: HEADER_LEN,
            compressor: compress.then(PageCompressor::new),
            combine: Vec::new(),
            written: Vec::new(),
            stats: WriterStats::default(),
        }
    }

    /// Compress (if enabled) and append a batch with a single write.
    pub fn write_batch(&mut self, batch: Vec<PageJob>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let start = self.pos;
        self.combine.clear();
        for job in batch {
            let file_pos = start + self.combine.len() as u64;
            let compressed = self
                .compressor
                .as_mut()
                .and_then(|compressor| compressor.compress(&job.data));
            // Invariant: a page is compressed iff it is stored in fewer bytes than a page.
            let flag = match compressed {
                Some(bytes) => {
                    self.combine.extend_from_slice(bytes);
                    PageFlag::Compressed
                }
                None => {
                    self.combine.extend_from_slice(&job.data);
                    PageFlag::Raw
                }
            };
            let size_on_disk = (start + self.combine.len() as u64 - file_pos) as u32;
            match flag {
                PageFlag::Compressed => self.stats.compressed_pages += 1,
                _ => self.stats.raw_pages += 1,
            }
            self.written.push(WrittenPage {
                block: job.block,
                page: job.page,
                record: PageRecord {
                    flag,
                    file_pos,
                    size_on_disk,
                    hash: Some(job.hash),
                },
            });
        }

        self.backend.write_at(start, &self.combine)?;
        self.pos += self.combine.len() as u64;
        self.stats.payload_bytes += self.combine.len() as u64;
        tracing::trace!(
            offset = start,
            bytes = self.combine.len(),
            "wrote RAM page batch"
        );
        Ok(())
    }

    pub fn finish(self) -> FinishedWriter<B> {
        FinishedWriter {
            backend: self.backend,
            end_pos: self.pos,
            written: self.written,
            stats: self.stats,
        }
    }
}

/// Runs [`PageWriter`] either on the calling thread or on a dedicated worker.
///
/// Both modes share the same writer, so the single-threaded mode exercises exactly the code the
/// worker runs.
pub(crate) struct WriteQueue<B> {
    inline: Option<PageWriter<B>>,
    sender: Option<SyncSender<Vec<PageJob>>>,
    worker: Option<JoinHandle<Result<PageWriter<B>>>>,
}

impl<B: SnapshotBackend + 'static> WriteQueue<B> {
    pub fn inline(writer: PageWriter<B>) -> Self {
        Self {
            inline: Some(writer),
            sender: None,
            worker: None,
        }
    }

    pub fn background(writer: PageWriter<B>) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("ram-saver-writer".to_string())
            .spawn(move || run_worker(writer, receiver))?;
        Ok(Self {
            inline: None,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn submit(&mut self, batch: Vec<PageJob>) -> Result<()> {
        if let Some(writer) = self.inline.as_mut() {
            return writer.write_batch(batch);
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| RamSnapshotError::WriterFailed("page writer already stopped".into()))?;
        if sender.send(batch).is_ok() {
            return Ok(());
        }
        // The worker hung up, which only happens after it failed. Surface its error.
        self.sender = None;
        match self.join_worker() {
            Err(err) => Err(err),
            Ok(_) => Err(RamSnapshotError::WriterFailed(
                "page writer exited early".into(),
            )),
        }
    }

    /// Wait for every submitted batch to be written and hand the writer back.
    pub fn finish(mut self) -> Result<PageWriter<B>> {
        if let Some(writer) = self.inline.take() {
            return Ok(writer);
        }
        self.sender = None;
        self.join_worker()
    }

    fn join_worker(&mut self) -> Result<PageWriter<B>> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| RamSnapshotError::WriterFailed("page writer already stopped".into()))?;
        match worker.join() {
            Ok(result) => result,
            Err(_) => Err(RamSnapshotError::WriterFailed(
                "page writer panicked".into(),
            )),
        }
    }
}

impl<B> Drop for WriteQueue<B> {
    fn drop(&mut self) {
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker<B: SnapshotBackend>(
    mut writer: PageWriter<B>,
    receiver: Receiver<Vec<PageJob>>,
) -> Result<PageWriter<B>> {
    for batch in receiver {
        if let Err(err) = writer.write_batch(batch) {
            tracing::warn!(error = %err, "RAM page writer failed");
            return Err(err);
        }
    }
    Ok(writer)
}
