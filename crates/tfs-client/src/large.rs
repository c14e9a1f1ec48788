//! Large-file mode
//!
//! A large file is a series of segments, each stored as an ordinary small
//! file, plus an index listing them. The index is itself stored as a small
//! file created in large mode, so its name starts with `L`; that name is what
//! the caller gets back from close.
//!
//! Writes fill a segment-sized tail buffer. Full segments are sealed and
//! uploaded `batch_count` at a time, concurrently, each batch bounded by
//! `batch_timeout`. With a `local_key`, the segments uploaded so far are
//! recorded in a local checkpoint after every batch; reopening with the same
//! key skips segments whose offset, size and CRC match a recorded one.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use tfs_common::checksum::compute_crc32c;
use tfs_common::{Error, NameKind, Result, TfsFileStat};
use tfs_proto::FileInfo;

use crate::client::TfsClient;
use crate::io::LeaseHandle;
use crate::resolver::{Created, Location};

/// One segment of a large file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Position of the segment's first byte in the large file
    pub offset: u64,
    pub size: u64,
    pub crc: u32,
    /// Canonical name of the small file holding the segment
    pub name: String,
}

/// Contents of a large file's index file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndex {
    pub size: u64,
    pub segments: Vec<SegmentInfo>,
}

impl SegmentIndex {
    /// Build an index of a `size`-byte file. Segments must cover it without
    /// gaps or overlaps.
    pub fn new(mut segments: Vec<SegmentInfo>, size: u64) -> Result<Self> {
        segments.sort_by_key(|s| s.offset);
        let index = Self { size, segments };
        index.validate()?;
        Ok(index)
    }

    fn validate(&self) -> Result<()> {
        let mut expected = 0;
        for segment in &self.segments {
            if segment.offset != expected {
                return Err(Error::internal(format!(
                    "segment index has a gap or overlap at offset {expected} (next segment at {})",
                    segment.offset
                )));
            }
            expected += segment.size;
        }
        if expected != self.size {
            return Err(Error::internal(format!(
                "segments cover {expected} bytes of a {}-byte file",
                self.size
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::internal(format!("encode segment index: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let index: Self = bincode::deserialize(bytes)
            .map_err(|e| Error::Protocol(format!("corrupt segment index: {e}")))?;
        index
            .validate()
            .map_err(|e| Error::Protocol(format!("corrupt segment index: {e}")))?;
        Ok(index)
    }

    /// Position in `segments` of the segment holding byte `offset`
    #[must_use]
    pub fn find(&self, offset: u64) -> Option<usize> {
        let i = self
            .segments
            .partition_point(|s| s.offset + s.size <= offset);
        (i < self.segments.len()).then_some(i)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    segments: Vec<SegmentInfo>,
}

/// Local record of uploaded segments
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    known: Vec<SegmentInfo>,
}

impl Checkpoint {
    /// Load the checkpoint at `path`. A missing file is an empty checkpoint;
    /// an unreadable one is ignored.
    pub async fn load(path: &Path) -> Self {
        let known = match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<CheckpointFile>(&bytes) {
                Ok(file) => file.segments,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint");
                Vec::new()
            }
        };
        if !known.is_empty() {
            info!(path = %path.display(), segments = known.len(), "resuming from checkpoint");
        }
        Self {
            path: path.to_path_buf(),
            known,
        }
    }

    fn matching(&self, offset: u64, size: u64, crc: u32) -> Option<&SegmentInfo> {
        self.known
            .iter()
            .find(|s| s.offset == offset && s.size == size && s.crc == crc)
    }

    async fn save(&self, segments: &[SegmentInfo]) -> Result<()> {
        let file = CheckpointFile {
            segments: segments.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::internal(format!("encode checkpoint: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn remove(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove checkpoint");
        }
    }
}

/// Write side of a large descriptor
pub struct LargeWriter {
    cluster: String,
    suffix: String,
    written: u64,
    tail: Vec<u8>,
    /// Full segments waiting for the next batch
    sealed: Vec<(u64, Vec<u8>)>,
    /// Segments of the file so far, uploaded or taken from the checkpoint
    segments: Vec<SegmentInfo>,
    /// Segments uploaded by this descriptor
    fresh: Vec<Location>,
    checkpoint: Option<Checkpoint>,
}

impl LargeWriter {
    pub async fn new(cluster: &str, suffix: &str, local_key: Option<&Path>) -> Self {
        let checkpoint = match local_key {
            Some(path) => Some(Checkpoint::load(path).await),
            None => None,
        };
        Self {
            cluster: cluster.to_string(),
            suffix: suffix.to_string(),
            written: 0,
            tail: Vec::new(),
            sealed: Vec::new(),
            segments: Vec::new(),
            fresh: Vec::new(),
            checkpoint,
        }
    }

    /// Bytes accepted so far
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.written
    }

    fn seal(&mut self) {
        if self.tail.is_empty() {
            return;
        }
        let offset = self.written - self.tail.len() as u64;
        self.sealed.push((offset, std::mem::take(&mut self.tail)));
    }
}

/// Read side of a large descriptor
pub struct LargeReader {
    pub location: Location,
    pub index: SegmentIndex,
    pub info: FileInfo,
}

impl LargeReader {
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.index.size
    }

    /// Metadata of the index file, sized as the whole large file
    #[must_use]
    pub fn stat(&self) -> TfsFileStat {
        let mut stat = self.info.to_stat();
        stat.size = i64::try_from(self.index.size).unwrap_or(i64::MAX);
        stat
    }
}

impl TfsClient {
    /// Create a small file holding `data` and commit it
    async fn store_new_file(
        &self,
        cluster: &str,
        suffix: &str,
        large: bool,
        data: &[u8],
        sync_log: bool,
    ) -> Result<Location> {
        let created = self.resolver.create(cluster, suffix, large, false).await?;
        self.fill_created(created, data, sync_log).await
    }

    /// Write and commit a freshly created file, then drop its lease
    async fn fill_created(
        &self,
        created: Created,
        data: &[u8],
        sync_log: bool,
    ) -> Result<Location> {
        let location = created.location;
        let mut lease = LeaseHandle::new(created.lease_id);

        let result = async {
            let mut offset = 0;
            for chunk in data.chunks(self.tunables.segment_bytes()) {
                self.data
                    .write(&location, Some(lease.next()), offset, chunk.to_vec())
                    .await?;
                offset += chunk.len() as u64;
            }
            let crc = Some(compute_crc32c(data));
            self.data
                .commit(&location, Some(lease.next()), data.len() as u64, crc, sync_log)
                .await
        }
        .await;

        // Releasing an uncommitted lease drops the file with it
        self.release_quietly(&location.cluster, created.lease_id)
            .await;
        result.map(|_| location)
    }

    async fn upload_sealed(&self, w: &mut LargeWriter, sync_log: bool) -> Result<()> {
        while !w.sealed.is_empty() {
            let width = self.tunables.batch_width().min(w.sealed.len());
            let mut batch: Vec<_> = w.sealed.drain(..width).collect();
            let cluster = w.cluster.as_str();

            // Allocations made by this batch, by segment offset
            let started = Mutex::new(Vec::<(u64, Created)>::new());
            let started = &started;

            let mut uploads = FuturesUnordered::new();
            for (offset, data) in &batch {
                let (offset, size) = (*offset, data.len() as u64);
                let crc = compute_crc32c(data);
                if let Some(known) = w
                    .checkpoint
                    .as_ref()
                    .and_then(|c| c.matching(offset, size, crc))
                {
                    debug!(offset, segment = %known.name, "segment already uploaded");
                    w.segments.push(known.clone());
                    continue;
                }
                uploads.push(async move {
                    let created = self.resolver.create(cluster, "", false, false).await?;
                    started.lock().push((offset, created.clone()));
                    let location = self.fill_created(created, data, sync_log).await?;
                    let segment = SegmentInfo {
                        offset,
                        size,
                        crc,
                        name: location.name.encode(),
                    };
                    Ok::<_, Error>((segment, location))
                });
            }

            let deadline = self
                .tunables
                .batch_deadline()
                .map(|limit| (limit, tokio::time::Instant::now() + limit));
            let mut first_error = None;
            loop {
                let next = match deadline {
                    Some((limit, at)) => match tokio::time::timeout_at(at, uploads.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            first_error.get_or_insert(Error::Timeout(format!(
                                "segment batch exceeded {limit:?}"
                            )));
                            break;
                        }
                    },
                    None => uploads.next().await,
                };
                match next {
                    Some(Ok((segment, location))) => {
                        w.segments.push(segment);
                        w.fresh.push(location);
                    }
                    Some(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    None => break,
                }
            }
            // Cancels whatever is still in flight
            drop(uploads);
            w.segments.sort_by_key(|s| s.offset);

            // Files allocated for segments that did not make it: release
            // their leases and let the collector make sure they are gone
            let stored: HashSet<u64> = w.segments.iter().map(|s| s.offset).collect();
            let abandoned: Vec<_> = started
                .lock()
                .drain(..)
                .filter(|(offset, _)| !stored.contains(offset))
                .map(|(_, created)| created)
                .collect();
            for created in abandoned {
                self.release_quietly(&created.location.cluster, created.lease_id)
                    .await;
                self.gc.push(created.location);
            }

            if let Some(checkpoint) = &w.checkpoint
                && let Err(e) = checkpoint.save(&w.segments).await
            {
                warn!(path = %checkpoint.path.display(), error = %e, "failed to save checkpoint");
            }
            if let Some(e) = first_error {
                // Put unstored segments back so a later close retries them
                batch.retain(|(offset, _)| !stored.contains(offset));
                batch.append(&mut w.sealed);
                w.sealed = batch;
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) async fn large_write(
        &self,
        w: &mut LargeWriter,
        data: &[u8],
        sync_log: bool,
    ) -> Result<usize> {
        let segment = self.tunables.segment_bytes();
        let mut rest = data;
        while !rest.is_empty() {
            let room = segment.saturating_sub(w.tail.len()).max(1);
            let (head, tail) = rest.split_at(room.min(rest.len()));
            w.tail.extend_from_slice(head);
            w.written += head.len() as u64;
            rest = tail;

            if w.tail.len() >= segment {
                w.seal();
                if w.sealed.len() >= self.tunables.batch_width() {
                    self.upload_sealed(w, sync_log).await?;
                }
            }
        }
        Ok(data.len())
    }

    /// Upload what is left and store the index. Returns the index's name.
    pub(crate) async fn large_close(&self, w: &mut LargeWriter, sync_log: bool) -> Result<String> {
        w.seal();
        let result = async {
            self.upload_sealed(w, sync_log).await?;
            let index = SegmentIndex::new(w.segments.clone(), w.written)?;
            let location = self
                .store_new_file(&w.cluster, &w.suffix, true, &index.encode()?, sync_log)
                .await?;
            info!(
                file = %location.name,
                size = w.written,
                segments = index.segments.len(),
                "stored large file"
            );
            Ok::<_, Error>(location.name.encode())
        }
        .await;

        match result {
            Ok(name) => {
                if let Some(checkpoint) = &w.checkpoint {
                    checkpoint.remove().await;
                }
                Ok(name)
            }
            Err(e) => {
                // With a checkpoint the segments wait for a resumed write
                if w.checkpoint.is_none() {
                    self.gc.extend(w.fresh.drain(..));
                }
                Err(e)
            }
        }
    }

    /// Give up on a large write. Everything uploaded becomes garbage.
    pub(crate) async fn large_abort(&self, w: &mut LargeWriter) {
        w.tail.clear();
        w.sealed.clear();
        self.gc.extend(w.fresh.drain(..));
        if let Some(checkpoint) = &w.checkpoint {
            checkpoint.remove().await;
        }
    }

    pub(crate) async fn open_large_reader(
        &self,
        name: &str,
        suffix: &str,
        cluster: &str,
        force: bool,
    ) -> Result<LargeReader> {
        let location = self.resolver.resolve(name, suffix, cluster).await?;
        if location.name.kind != NameKind::Large {
            return Err(Error::InvalidFileName(format!("{name} is not a large file")));
        }

        let info = self.data.stat(&location, force, None).await?;
        let mut bytes = vec![0; usize::try_from(info.size).unwrap_or(usize::MAX)];
        let (n, _) = self.fetch(&location, 0, &mut bytes, force, None).await?;
        bytes.truncate(n);
        let index = SegmentIndex::decode(&bytes)?;
        debug!(
            file = %location.name,
            size = index.size,
            segments = index.segments.len(),
            "opened large file"
        );

        Ok(LargeReader {
            location,
            index,
            info,
        })
    }

    pub(crate) async fn large_read_at(
        &self,
        reader: &LargeReader,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut done = 0;
        let mut pos = offset;
        while done < buf.len() {
            let Some(i) = reader.index.find(pos) else {
                break;
            };
            let segment = &reader.index.segments[i];
            let within = pos - segment.offset;
            let want = usize::try_from(segment.size - within)
                .unwrap_or(usize::MAX)
                .min(buf.len() - done);

            let location = self
                .resolver
                .resolve(&segment.name, "", &reader.location.cluster)
                .await?;
            let (n, _) = self
                .fetch(&location, within, &mut buf[done..done + want], false, None)
                .await?;
            if n < want {
                return Err(Error::transfer(format!(
                    "segment {} holds fewer bytes than its index entry",
                    segment.name
                )));
            }
            done += n;
            pos += n as u64;
        }
        Ok(done)
    }
}
