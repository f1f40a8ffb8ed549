//! Parallel-worker redistribution.
//!
//! When hashed aggregation runs in parallel workers, each worker must own a
//! disjoint key space. Every worker hashes the chosen grouping column of each
//! input row, keeps the rows it owns, and ships the rest to the owning
//! sibling: first through a fixed-size single-producer/single-consumer ring
//! buffer, then through overflow files whose names are published once the
//! sender finishes producing. Consumers drain ring residue and peer files,
//! and the status protocol None → Init → ProduceDone → ConsumeDone (with
//! Error reachable from anywhere) coordinates shutdown.

use std::cell::UnsafeCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quern_error::{QuernError, Result};
use tracing::debug;

use crate::arrays::datum::{DataType, Datum};
use crate::arrays::row::{Row, RowImageKind};
use crate::execution::operators::TupleSource;
use crate::io::buffered_file::BufFile;
use crate::util::hash::hash_state;

/// Worker lifecycle states. Monotone in this order on each worker's own
/// slot, except that Error may be entered from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum WorkerStatus {
    None = 0,
    Init = 1,
    ProduceDone = 2,
    ConsumeDone = 3,
    Error = 4,
}

impl WorkerStatus {
    fn from_u8(v: u8) -> WorkerStatus {
        match v {
            0 => WorkerStatus::None,
            1 => WorkerStatus::Init,
            2 => WorkerStatus::ProduceDone,
            3 => WorkerStatus::ConsumeDone,
            _ => WorkerStatus::Error,
        }
    }
}

/// Pick the worker owning a grouping value: `(value mod 2^W) mod W`, nulls
/// to worker 0.
///
/// Each type selects exactly one arm; integer-family types use the raw value
/// rather than a hash so ownership matches the original engine.
pub fn redistribute_target(datum: &Datum, dtype: DataType, num_workers: usize) -> usize {
    if datum.is_null() {
        debug!("the redistributed column is null");
        return 0;
    }
    let modulus = 1i64 << num_workers.min(62);
    let workers = num_workers as i64;

    let raw: i64 = match dtype {
        DataType::Int64 => datum.try_as_i64().unwrap_or(0),
        DataType::Int32 => datum.try_as_i64().unwrap_or(0),
        DataType::Bool => matches!(datum, Datum::Bool(true)) as i64,
        // Everything else dispatches to the type-specific hash.
        _ => datum.stable_hash(&hash_state()) as u32 as i64,
    };

    ((raw % modulus) % workers).unsigned_abs() as usize
}

/// Fixed-size byte ring with length-prefixed records.
///
/// The sender owns `head`, the receiver owns `tail`; each position is only
/// ever advanced by its owner. Free space is `capacity - 1 - used` so the
/// buffer never fills completely.
pub struct RingBuffer {
    data: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    /// Row-image kind of every record in this buffer; fixed by the first
    /// record written.
    kind: AtomicU8,
    pub ntuples: AtomicU64,
    pub ntuples_buffer: AtomicU64,
    pub ntuples_file: AtomicU64,
}

// SAFETY: the byte region is only written by the sender between head and the
// space it reserved, and only read by the receiver between tail and head;
// head/tail publication uses release/acquire ordering.
unsafe impl Sync for RingBuffer {}
unsafe impl Send for RingBuffer {}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        RingBuffer {
            data: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            kind: AtomicU8::new(0),
            ntuples: AtomicU64::new(0),
            ntuples_buffer: AtomicU64::new(0),
            ntuples_file: AtomicU64::new(0),
        }
    }

    pub fn free_size(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            (self.capacity - head) + tail - 1
        } else {
            tail - head - 1
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Record the buffer's row-image kind, or verify it matches. A kind
    /// change on an in-use buffer is a fatal invariant violation.
    pub fn check_or_set_kind(&self, kind: RowImageKind) -> Result<()> {
        let value = kind.as_u8();
        match self
            .kind
            .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(current) if current == value => Ok(()),
            Err(current) => Err(QuernError::new(format!(
                "Mismatched row-image kind in ring buffer: {current} vs {value}"
            ))),
        }
    }

    pub fn record_kind(&self) -> Result<RowImageKind> {
        RowImageKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    /// Sender side: enqueue one length-prefixed record. The caller must have
    /// checked `free_size() >= data.len() + 4`.
    pub fn put(&self, data: &[u8]) {
        let head = self.head.load(Ordering::Relaxed);
        let len = (data.len() as i32).to_le_bytes();
        let mid = self.copy_in(head, &len);
        self.copy_in(mid, data);
        self.head
            .store((head + 4 + data.len()) % self.capacity, Ordering::Release);
    }

    /// Receiver side: dequeue one record. The caller must have checked
    /// `!is_empty()`.
    pub fn get(&self) -> Vec<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        let mut len_bytes = [0u8; 4];
        let mid = self.copy_out(tail, &mut len_bytes);
        let len = i32::from_le_bytes(len_bytes) as usize;
        let mut data = vec![0u8; len];
        self.copy_out(mid, &mut data);
        self.tail
            .store((tail + 4 + len) % self.capacity, Ordering::Release);
        data
    }

    fn copy_in(&self, pos: usize, src: &[u8]) -> usize {
        let data = self.data.get();
        let first = (self.capacity - pos).min(src.len());
        // SAFETY: sender-owned region, bounds checked against capacity.
        unsafe {
            let base = (*data).as_mut_ptr();
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(pos), first);
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
        }
        (pos + src.len()) % self.capacity
    }

    fn copy_out(&self, pos: usize, dst: &mut [u8]) -> usize {
        let data = self.data.get();
        let first = (self.capacity - pos).min(dst.len());
        // SAFETY: receiver-owned region, bounds checked against capacity.
        unsafe {
            let base = (*data).as_ptr();
            std::ptr::copy_nonoverlapping(base.add(pos), dst.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
        }
        (pos + dst.len()) % self.capacity
    }
}

/// Published descriptor for one sender→receiver overflow file list.
#[derive(Debug, Default)]
pub struct SharedFileList {
    pub kind: Option<RowImageKind>,
    pub file_names: Vec<PathBuf>,
    pub published: bool,
}

/// State shared by all workers of one redistribution.
#[derive(Debug)]
pub struct RedistributeShared {
    num_workers: usize,
    status: Vec<AtomicU8>,
    parallel_error: AtomicBool,
    /// Ring per ordered (sender, receiver) pair, indexed `s * W + r`.
    bufs: Vec<RingBuffer>,
    /// Overflow-file descriptors, same indexing.
    files: Vec<Mutex<SharedFileList>>,
}

impl RedistributeShared {
    /// Shared state sized from the execution configuration.
    pub fn from_config(num_workers: usize, config: &crate::config::ExecConfig) -> Arc<Self> {
        Self::new(num_workers, config.ring_buffer_capacity)
    }

    pub fn new(num_workers: usize, ring_capacity: usize) -> Arc<Self> {
        Arc::new(RedistributeShared {
            num_workers,
            status: (0..num_workers).map(|_| AtomicU8::new(0)).collect(),
            parallel_error: AtomicBool::new(false),
            bufs: (0..num_workers * num_workers)
                .map(|_| RingBuffer::new(ring_capacity))
                .collect(),
            files: (0..num_workers * num_workers)
                .map(|_| Mutex::new(SharedFileList::default()))
                .collect(),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn status_of(&self, worker: usize) -> WorkerStatus {
        WorkerStatus::from_u8(self.status[worker].load(Ordering::Acquire))
    }

    fn set_status(&self, worker: usize, status: WorkerStatus) {
        self.status[worker].store(status as u8, Ordering::Release);
    }

    /// Set when any worker fails; observers abort with a corruption error.
    pub fn raise_parallel_error(&self) {
        self.parallel_error.store(true, Ordering::Release);
    }

    fn check_peers_healthy(&self) -> Result<()> {
        if self.parallel_error.load(Ordering::Acquire) {
            return Err(QuernError::new(
                "Some other worker exited with errors; aborting because of corrupted data",
            ));
        }
        for worker in 0..self.num_workers {
            if self.status_of(worker) == WorkerStatus::Error {
                return Err(QuernError::new(
                    "Some other worker exited with errors; aborting because of corrupted data",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumePhase {
    OpeningFiles,
    Reading,
    Done,
}

/// One worker's handle on a redistribution.
#[derive(Debug)]
pub struct RedistributeWorker {
    shared: Arc<RedistributeShared>,
    worker_idx: usize,
    /// Grouping column whose value picks the owner, and its declared type.
    column: usize,
    dtype: DataType,
    /// Row layout for packed images.
    layout: Vec<DataType>,
    kind: RowImageKind,
    /// Per-target overflow files, created when a ring fills.
    spill_files: Vec<Option<BufFile>>,
    /// Round-robin cursor for opportunistic draining while producing.
    drain_from: usize,
    /// Consume-phase state.
    phase: ConsumePhase,
    opened: Vec<bool>,
    open_files: Vec<(BufFile, RowImageKind)>,
    open_file_idx: usize,
    encode_buf: Vec<u8>,
}

impl RedistributeWorker {
    pub fn new(
        shared: Arc<RedistributeShared>,
        worker_idx: usize,
        column: usize,
        dtype: DataType,
        layout: Vec<DataType>,
    ) -> Self {
        let num_workers = shared.num_workers;
        shared.set_status(worker_idx, WorkerStatus::Init);
        RedistributeWorker {
            shared,
            worker_idx,
            column,
            dtype,
            layout,
            kind: RowImageKind::Packed,
            spill_files: (0..num_workers).map(|_| None).collect(),
            drain_from: (worker_idx + 1) % num_workers.max(1),
            phase: ConsumePhase::OpeningFiles,
            opened: (0..num_workers).map(|_| false).collect(),
            open_files: Vec::new(),
            open_file_idx: 0,
            encode_buf: Vec::new(),
        }
    }

    /// Ship rows as self-describing images instead of packed ones.
    pub fn with_image_kind(mut self, kind: RowImageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn worker_idx(&self) -> usize {
        self.worker_idx
    }

    /// Route one row. Returns the row itself when this worker owns it,
    /// otherwise ships it and may hand back one row drained from a peer so a
    /// worker that never emits cannot deadlock its producers.
    pub fn route(&mut self, row: Row) -> Result<Option<Row>> {
        let num_workers = self.shared.num_workers;
        let target = redistribute_target(row.column(self.column)?, self.dtype, num_workers);
        if target == self.worker_idx {
            return Ok(Some(row));
        }

        self.encode_buf.clear();
        match self.kind {
            RowImageKind::Packed => row.encode_packed(&self.layout, &mut self.encode_buf)?,
            RowImageKind::SelfDescribing => row.encode_tagged(&mut self.encode_buf)?,
        }

        let idx = self.worker_idx * num_workers + target;
        let buf = &self.shared.bufs[idx];
        if buf.free_size() >= self.encode_buf.len() + 4 {
            buf.check_or_set_kind(self.kind)?;
            buf.put(&self.encode_buf);
            buf.ntuples.fetch_add(1, Ordering::Relaxed);
            buf.ntuples_buffer.fetch_add(1, Ordering::Relaxed);
        } else {
            if self.spill_files[target].is_none() {
                let mut shared_file = self.shared.files[idx].lock();
                shared_file.kind = Some(self.kind);
                drop(shared_file);
                self.spill_files[target] = Some(BufFile::create_temp()?);
            }
            let file = self.spill_files[target].as_mut().expect("created above");
            file.write_i32(self.encode_buf.len() as i32)?;
            file.write_all(&self.encode_buf)?;
            buf.ntuples.fetch_add(1, Ordering::Relaxed);
            buf.ntuples_file.fetch_add(1, Ordering::Relaxed);
        }

        self.try_drain_one()
    }

    /// Pull one buffered row from a peer whose ring is filling up.
    fn try_drain_one(&mut self) -> Result<Option<Row>> {
        let num_workers = self.shared.num_workers;
        let mut peer = self.drain_from;
        for _ in 0..num_workers {
            if peer != self.worker_idx {
                let buf = &self.shared.bufs[peer * num_workers + self.worker_idx];
                // Only drain once the peer's buffer is more than a quarter
                // full, to keep the fast path cheap.
                if !buf.is_empty() && buf.free_size() < (buf.capacity() / 4) * 3 {
                    let bytes = buf.get();
                    let kind = buf.record_kind()?;
                    self.drain_from = (peer + 1) % num_workers;
                    return self.decode(&bytes, kind).map(Some);
                }
            }
            peer = (peer + 1) % num_workers;
        }
        Ok(None)
    }

    fn decode(&self, bytes: &[u8], kind: RowImageKind) -> Result<Row> {
        let mut cursor = bytes;
        match kind {
            RowImageKind::Packed => Row::decode_packed(&self.layout, &mut cursor),
            RowImageKind::SelfDescribing => Row::decode_tagged(&mut cursor),
        }
    }

    /// Flush and publish overflow files, then announce ProduceDone.
    pub fn finish_produce(&mut self) -> Result<()> {
        let num_workers = self.shared.num_workers;
        for target in 0..num_workers {
            if target == self.worker_idx {
                continue;
            }
            if let Some(file) = &mut self.spill_files[target] {
                // Repeat until the flush succeeds.
                loop {
                    match file.flush() {
                        Ok(()) => break,
                        Err(err) => {
                            if !matches!(
                                &err,
                                QuernError::Io(io) if io.kind() == std::io::ErrorKind::Interrupted
                            ) {
                                return Err(err);
                            }
                        }
                    }
                }

                let idx = self.worker_idx * num_workers + target;
                let mut shared_file = self.shared.files[idx].lock();
                shared_file.file_names.push(file.path().to_path_buf());
                shared_file.published = true;
            }
        }

        self.shared.set_status(self.worker_idx, WorkerStatus::ProduceDone);
        debug!(worker = self.worker_idx, "redistribution produce done");
        Ok(())
    }

    /// Fetch the next row shipped to this worker. Returns None once every
    /// peer has finished and all residue is drained.
    pub fn consume_next(&mut self) -> Result<Option<Row>> {
        let num_workers = self.shared.num_workers;
        loop {
            self.shared.check_peers_healthy()?;

            // Ring residue takes priority in every phase.
            for peer in 0..num_workers {
                if peer == self.worker_idx {
                    continue;
                }
                let buf = &self.shared.bufs[peer * num_workers + self.worker_idx];
                if !buf.is_empty() {
                    let bytes = buf.get();
                    let kind = buf.record_kind()?;
                    return self.decode(&bytes, kind).map(Some);
                }
            }

            match self.phase {
                ConsumePhase::OpeningFiles => {
                    let mut all_done = true;
                    for peer in 0..num_workers {
                        if peer == self.worker_idx || self.opened[peer] {
                            continue;
                        }
                        if self.shared.status_of(peer) >= WorkerStatus::ProduceDone {
                            self.open_peer_files(peer)?;
                            self.opened[peer] = true;
                        } else {
                            all_done = false;
                        }
                    }
                    if all_done {
                        self.phase = ConsumePhase::Reading;
                    } else {
                        std::thread::sleep(Duration::from_micros(100));
                    }
                }
                ConsumePhase::Reading => {
                    while self.open_file_idx < self.open_files.len() {
                        let (file, kind) = &mut self.open_files[self.open_file_idx];
                        match file.read_i32_opt()? {
                            Some(len) => {
                                let mut bytes = vec![0u8; len as usize];
                                file.read_exact(&mut bytes)?;
                                let kind = *kind;
                                return self.decode(&bytes, kind).map(Some);
                            }
                            None => {
                                self.open_file_idx += 1;
                            }
                        }
                    }
                    self.phase = ConsumePhase::Done;
                    self.shared
                        .set_status(self.worker_idx, WorkerStatus::ConsumeDone);
                    self.dump_buffer_counters();
                }
                ConsumePhase::Done => {
                    // Wait for every peer to finish consuming before closing
                    // out; residue checked above keeps late senders safe.
                    let all_done = (0..num_workers)
                        .all(|w| self.shared.status_of(w) >= WorkerStatus::ConsumeDone);
                    if all_done {
                        self.open_files.clear();
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_micros(100));
                }
            }
        }
    }

    fn open_peer_files(&mut self, peer: usize) -> Result<()> {
        let num_workers = self.shared.num_workers;
        let idx = peer * num_workers + self.worker_idx;
        let shared_file = self.shared.files[idx].lock();
        if !shared_file.published {
            return Ok(());
        }
        let kind = shared_file
            .kind
            .ok_or_else(|| QuernError::new("Published file list is missing its row-image kind"))?;
        for name in &shared_file.file_names {
            let mut file = BufFile::open_path(name)?;
            file.rewind_for_read()?;
            self.open_files.push((file, kind));
        }
        Ok(())
    }

    /// Log the per-buffer counters and verify nothing is left in our
    /// outgoing rings.
    fn dump_buffer_counters(&self) {
        let num_workers = self.shared.num_workers;
        for target in 0..num_workers {
            let idx = self.worker_idx * num_workers + target;
            let buf = &self.shared.bufs[idx];
            debug!(
                worker = self.worker_idx,
                target,
                ntuples = buf.ntuples.load(Ordering::Relaxed),
                ntuples_buffer = buf.ntuples_buffer.load(Ordering::Relaxed),
                ntuples_file = buf.ntuples_file.load(Ordering::Relaxed),
                "redistribution buffer counters"
            );
        }
    }

    /// Mark this worker failed so peers abort instead of waiting forever.
    pub fn report_error(&self) {
        self.shared.set_status(self.worker_idx, WorkerStatus::Error);
        self.shared.raise_parallel_error();
    }
}

/// Wraps a worker's local input, yielding only the rows this worker owns:
/// local rows pass through, foreign rows are shipped, and after the local
/// input is exhausted the shipped-in rows are consumed.
#[derive(Debug)]
pub struct RedistributingSource {
    inner: Box<dyn TupleSource>,
    worker: RedistributeWorker,
    producing: bool,
}

impl RedistributingSource {
    pub fn new(inner: Box<dyn TupleSource>, worker: RedistributeWorker) -> Self {
        RedistributingSource {
            inner,
            worker,
            producing: true,
        }
    }
}

impl TupleSource for RedistributingSource {
    fn next(&mut self) -> Result<Option<Row>> {
        let result = self.next_inner();
        if result.is_err() {
            self.worker.report_error();
        }
        result
    }

    fn rescan(&mut self) -> Result<()> {
        Err(QuernError::new("Redistributed input cannot be rescanned"))
    }
}

impl RedistributingSource {
    fn next_inner(&mut self) -> Result<Option<Row>> {
        while self.producing {
            match self.inner.next()? {
                Some(row) => {
                    if let Some(local) = self.worker.route(row)? {
                        return Ok(Some(local));
                    }
                }
                None => {
                    self.worker.finish_produce()?;
                    self.producing = false;
                }
            }
        }
        self.worker.consume_next()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::testutil::RowVecSource;

    #[test]
    fn ring_buffer_wraps_around() {
        let buf = RingBuffer::new(32);
        buf.check_or_set_kind(RowImageKind::SelfDescribing).unwrap();

        // Interleave puts and gets so positions wrap the 32-byte ring.
        let mut expect = 0u8;
        for round in 0..10u8 {
            let record = [round, round, round];
            assert!(buf.free_size() >= record.len() + 4);
            buf.put(&record);
            if round % 2 == 1 {
                assert_eq!(vec![expect, expect, expect], buf.get());
                expect += 1;
                assert_eq!(vec![expect, expect, expect], buf.get());
                expect += 1;
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn ring_buffer_kind_is_sticky() {
        let buf = RingBuffer::new(64);
        buf.check_or_set_kind(RowImageKind::Packed).unwrap();
        buf.check_or_set_kind(RowImageKind::Packed).unwrap();
        assert!(buf.check_or_set_kind(RowImageKind::SelfDescribing).is_err());
    }

    #[test]
    fn null_and_integer_targets() {
        assert_eq!(0, redistribute_target(&Datum::Null, DataType::Int64, 2));
        // Integer values route by value, not hash.
        for v in 0..16i64 {
            assert_eq!(
                (v % 2) as usize,
                redistribute_target(&Datum::Int64(v), DataType::Int64, 2)
            );
        }
    }

    /// Two workers, interleaved keys: every row is consumed exactly once, by
    /// the worker owning its key.
    #[test]
    fn two_worker_conservation() {
        let num_workers = 2;
        let rows_per_worker = 1000;
        let shared = RedistributeShared::new(num_workers, 1024);
        let layout = vec![DataType::Int64, DataType::Int64];

        let mut handles = Vec::new();
        for worker_idx in 0..num_workers {
            let shared = shared.clone();
            let layout = layout.clone();
            handles.push(std::thread::spawn(move || {
                let input: Vec<Row> = (0..rows_per_worker)
                    .map(|i| {
                        let key = ((i * 7) + worker_idx) % 100;
                        Row::from([Datum::Int64(key as i64), Datum::Int64(1)])
                    })
                    .collect();

                let worker = RedistributeWorker::new(
                    shared,
                    worker_idx,
                    0,
                    DataType::Int64,
                    layout,
                );
                let mut source = RedistributingSource::new(
                    Box::new(RowVecSource::new(input)),
                    worker,
                );

                let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
                while let Some(row) = source.next().unwrap() {
                    let key = row.values[0].try_as_i64().unwrap();
                    *counts.entry(key).or_default() += 1;
                }
                counts
            }));
        }

        let results: Vec<BTreeMap<i64, usize>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Each worker saw only its own keys.
        for (worker_idx, counts) in results.iter().enumerate() {
            for &key in counts.keys() {
                assert_eq!(
                    worker_idx,
                    redistribute_target(&Datum::Int64(key), DataType::Int64, num_workers),
                    "worker {worker_idx} consumed foreign key {key}"
                );
            }
        }

        // The union matches the input multiset.
        let mut total: BTreeMap<i64, usize> = BTreeMap::new();
        for counts in &results {
            for (&key, &n) in counts {
                *total.entry(key).or_default() += n;
            }
        }
        let total_rows: usize = total.values().sum();
        assert_eq!(num_workers * rows_per_worker, total_rows);
        for key in 0..100i64 {
            // Keys are uniform over 0..100 via the i*7 stride.
            assert!(total.contains_key(&key), "missing key {key}");
        }
    }

    /// A peer error aborts the observing worker with a corruption error.
    #[test]
    fn peer_error_propagates() {
        let shared = RedistributeShared::new(2, 256);
        let layout = vec![DataType::Int64];

        let mut worker0 =
            RedistributeWorker::new(shared.clone(), 0, 0, DataType::Int64, layout.clone());
        let worker1 = RedistributeWorker::new(shared.clone(), 1, 0, DataType::Int64, layout);

        worker1.report_error();
        worker0.finish_produce().unwrap();
        assert!(worker0.consume_next().is_err());
    }
}
