//! Descriptor operations
//!
//! Open, close, read, write, seek and stat on descriptors, plus unlink by
//! name. The table lock is only taken to allocate, look up or remove a
//! descriptor; the data path holds just the descriptor's own mutex, so
//! operations on different descriptors never wait for each other.

use std::path::Path;
use tracing::{debug, warn};

use tfs_common::{
    Error, OpenFlags, OptionFlag, Result, SeekWhence, StatMode, TfsFileStat, UnlinkType,
};
use tfs_proto::FileInfo;

use crate::client::TfsClient;
use crate::fd_table::Fd;
use crate::file::{Body, OpenFile, SmallFile, seek_target};
use crate::io::LeaseHandle;
use crate::large::LargeWriter;
use crate::resolver::Location;
use crate::stats::ClientStats;

impl TfsClient {
    /// Open a file on the default cluster.
    ///
    /// `name` is empty for `CREATE`. `local_key` is the checkpoint path of a
    /// large-file write.
    pub async fn open(
        &self,
        name: &str,
        suffix: &str,
        flags: OpenFlags,
        local_key: Option<&Path>,
    ) -> Result<Fd> {
        let cluster = self.default_server();
        self.open_with_cluster(name, suffix, flags, local_key, &cluster)
            .await
    }

    /// Open a file on the cluster whose name server is at `cluster`
    pub async fn open_with_cluster(
        &self,
        name: &str,
        suffix: &str,
        flags: OpenFlags,
        local_key: Option<&Path>,
        cluster: &str,
    ) -> Result<Fd> {
        self.ensure_live()?;
        flags.validate(!name.is_empty())?;

        let fd = self.fds.reserve()?;
        let file = match self.open_file(name, suffix, flags, local_key, cluster).await {
            Ok(file) => file,
            Err(e) => {
                let _ = self.fds.remove(fd);
                debug!(name, ?flags, error = %e, "open failed");
                return Err(e);
            }
        };

        let name = file.name.clone();
        if let Err(rejected) = self.fds.fill(fd, tokio::sync::Mutex::new(file)) {
            // The table was drained by destroy while we were opening
            let mut file = rejected.into_inner();
            self.abandon(&mut file).await;
            self.ensure_live()?;
            return Err(Error::InvalidFd(fd.raw()));
        }

        ClientStats::incr(&self.stats.opens);
        debug!(%fd, name, ?flags, cluster, "opened");
        Ok(fd)
    }

    async fn open_file(
        &self,
        name: &str,
        suffix: &str,
        flags: OpenFlags,
        local_key: Option<&Path>,
        cluster: &str,
    ) -> Result<OpenFile> {
        let force = flags.contains(OpenFlags::FORCE) && !flags.is_write();

        if flags.is_large() {
            if flags.is_write() {
                let writer = LargeWriter::new(cluster, suffix, local_key).await;
                return Ok(OpenFile::new(flags, String::new(), Body::LargeWrite(writer)));
            }
            let reader = self.open_large_reader(name, suffix, cluster, force).await?;
            return Ok(OpenFile::new(
                flags,
                name.to_string(),
                Body::LargeRead(reader),
            ));
        }

        if flags.contains(OpenFlags::CREATE) {
            let created = self
                .resolver
                .create(cluster, suffix, false, flags.contains(OpenFlags::NEWBLK))
                .await?;
            let name = created.location.name.encode();
            let lease = LeaseHandle::new(created.lease_id);
            let small = SmallFile::new(created.location, Some(lease), true);
            return Ok(OpenFile::new(flags, name, Body::Small(small)));
        }

        let location = self.resolver.resolve(name, suffix, cluster).await?;
        let info = self
            .data
            .stat(&location, force, None)
            .await
            .inspect_err(|e| self.forget_on_connection_error(&location, e))?;

        let lease = if flags.is_write() && !flags.contains(OpenFlags::NOLEASE) {
            let lease = self.resolver.apply_lease(&location).await?;
            Some(LeaseHandle::new(lease.lease_id))
        } else {
            None
        };

        let mut small = SmallFile::new(location, lease, false);
        // Writes update the existing contents in place
        if flags.is_write() {
            small.high_water = info.size;
        }
        small.info = Some(info);
        Ok(OpenFile::new(flags, name.to_string(), Body::Small(small)))
    }

    /// Close a descriptor, committing what was written.
    ///
    /// Returns the canonical name of a created file, otherwise the name the
    /// file was opened with. The descriptor is gone even when this fails.
    pub async fn close(&self, fd: Fd) -> Result<String> {
        self.ensure_live()?;
        let desc = self
            .fds
            .remove(fd)?
            .ok_or(Error::InvalidFd(fd.raw()))?;
        ClientStats::incr(&self.stats.closes);

        let mut guard = desc.lock().await;
        let file = &mut *guard;
        let abort = file.option == OptionFlag::CloseFlagWriteDataFailed;
        let sync_log = file.option != OptionFlag::NoSyncLog;

        let result = match &mut file.body {
            Body::Small(small) if file.flags.is_write() => {
                if abort {
                    small.pending.clear();
                    self.release_small(small).await;
                    return Err(Error::WriteAborted);
                }
                let committed = self.commit_small(small, sync_log).await;
                self.release_small(small).await;
                committed
                    .map(|_| file.name.clone())
                    .map_err(|e| Error::FlushFailed(format!("{}: {e}", file.name)))
            }
            Body::Small(_) | Body::LargeRead(_) => Ok(file.name.clone()),
            Body::LargeWrite(writer) => {
                if abort {
                    self.large_abort(writer).await;
                    return Err(Error::WriteAborted);
                }
                self.large_close(writer, sync_log)
                    .await
                    .map_err(|e| Error::FlushFailed(format!("large file: {e}")))
            }
        };

        match &result {
            Ok(name) => debug!(%fd, name, "closed"),
            Err(e) => warn!(%fd, error = %e, "close failed"),
        }
        result
    }

    /// Read at the current offset and advance it. A short count means end
    /// of file.
    pub async fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.read_inner(fd, buf, None).await.map(|(n, _)| n)
    }

    /// Read like [`TfsClient::read`] and return the metadata the data server
    /// reported with the data
    pub async fn read_with_stat(&self, fd: Fd, buf: &mut [u8]) -> Result<(usize, TfsFileStat)> {
        self.read_inner(fd, buf, None).await
    }

    /// Read at `offset` without touching the descriptor's offset
    pub async fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read_inner(fd, buf, Some(offset)).await.map(|(n, _)| n)
    }

    async fn read_inner(
        &self,
        fd: Fd,
        buf: &mut [u8],
        at: Option<u64>,
    ) -> Result<(usize, TfsFileStat)> {
        self.ensure_live()?;
        let desc = self.fds.get(fd)?;
        let mut guard = desc.lock().await;
        let file = &mut *guard;
        file.require_read()?;

        let offset = at.unwrap_or(file.offset);
        let force = file.flags.contains(OpenFlags::FORCE);
        let (n, stat) = match &mut file.body {
            Body::Small(small) => {
                self.flush_small(small).await?;
                let (n, info) = self
                    .fetch(&small.location, offset, buf, force, small.lease_id())
                    .await?;
                small.info = Some(info);
                (n, info.to_stat())
            }
            Body::LargeRead(reader) => {
                let n = self.large_read_at(reader, offset, buf).await?;
                (n, reader.stat())
            }
            Body::LargeWrite(_) => {
                return Err(Error::NotPermitted(
                    "a large file cannot be read while it is written".into(),
                ));
            }
        };

        if at.is_none() {
            file.offset += n as u64;
        }
        ClientStats::incr(&self.stats.reads);
        ClientStats::add(&self.stats.read_bytes, n as u64);
        Ok((n, stat))
    }

    /// Write at the current offset and advance it
    pub async fn write(&self, fd: Fd, data: &[u8]) -> Result<usize> {
        self.write_inner(fd, data, None).await
    }

    /// Write at `offset` without touching the descriptor's offset
    pub async fn pwrite(&self, fd: Fd, data: &[u8], offset: u64) -> Result<usize> {
        self.write_inner(fd, data, Some(offset)).await
    }

    async fn write_inner(&self, fd: Fd, data: &[u8], at: Option<u64>) -> Result<usize> {
        self.ensure_live()?;
        let desc = self.fds.get(fd)?;
        let mut guard = desc.lock().await;
        let file = &mut *guard;
        file.require_write()?;

        let offset = at.unwrap_or(file.offset);
        let sync_log = file.option != OptionFlag::NoSyncLog;
        let n = match &mut file.body {
            Body::Small(small) => self.write_small(small, offset, data).await?,
            Body::LargeWrite(writer) => {
                if at.is_some() {
                    return Err(Error::NotPermitted(
                        "positional writes are not supported on large files".into(),
                    ));
                }
                if offset != writer.len() {
                    return Err(Error::NotPermitted(format!(
                        "large files are written sequentially (at {}, not {offset})",
                        writer.len()
                    )));
                }
                self.large_write(writer, data, sync_log).await?
            }
            Body::LargeRead(_) => {
                return Err(Error::NotPermitted("large file is open for reading".into()));
            }
        };

        if at.is_none() {
            file.offset += n as u64;
        }
        ClientStats::incr(&self.stats.writes);
        ClientStats::add(&self.stats.write_bytes, n as u64);
        Ok(n)
    }

    /// Move the descriptor's offset. Returns the new absolute offset.
    pub async fn seek(&self, fd: Fd, offset: i64, whence: SeekWhence) -> Result<u64> {
        self.ensure_live()?;
        let desc = self.fds.get(fd)?;
        let mut file = desc.lock().await;

        let target = seek_target(file.offset, file.len(), offset, whence, file.flags.is_write())?;
        if let Body::LargeWrite(writer) = &file.body
            && target != writer.len()
        {
            return Err(Error::NotPermitted(
                "large files are written sequentially".into(),
            ));
        }
        file.offset = target;
        Ok(target)
    }

    /// File metadata. `StatMode::Normal` may answer from what the
    /// descriptor already knows; `StatMode::Force` always asks the server.
    pub async fn fstat(&self, fd: Fd, mode: StatMode) -> Result<TfsFileStat> {
        self.ensure_live()?;
        let desc = self.fds.get(fd)?;
        let mut guard = desc.lock().await;
        let file = &mut *guard;
        let force = file.flags.contains(OpenFlags::FORCE);
        ClientStats::incr(&self.stats.stats);

        match &mut file.body {
            Body::Small(small) => {
                if mode == StatMode::Normal
                    && small.lease.is_none()
                    && let Some(info) = small.info
                {
                    return Ok(info.to_stat());
                }
                self.flush_small(small).await?;
                let info = self
                    .data
                    .stat(&small.location, force, small.lease_id())
                    .await
                    .inspect_err(|e| self.forget_on_connection_error(&small.location, e))?;
                small.info = Some(info);
                Ok(info.to_stat())
            }
            Body::LargeRead(reader) => {
                if mode == StatMode::Force {
                    reader.info = self.data.stat(&reader.location, force, None).await?;
                }
                Ok(reader.stat())
            }
            Body::LargeWrite(writer) => Ok(TfsFileStat {
                size: i64::try_from(writer.len()).unwrap_or(i64::MAX),
                ..TfsFileStat::default()
            }),
        }
    }

    /// Size of the file as the descriptor sees it
    pub async fn get_file_length(&self, fd: Fd) -> Result<i64> {
        self.ensure_live()?;
        let desc = self.fds.get(fd)?;
        let file = desc.lock().await;
        Ok(i64::try_from(file.len()).unwrap_or(i64::MAX))
    }

    pub async fn set_option_flag(&self, fd: Fd, flag: OptionFlag) -> Result<()> {
        self.ensure_live()?;
        let desc = self.fds.get(fd)?;
        desc.lock().await.option = flag;
        Ok(())
    }

    /// Delete, undelete, conceal or reveal a file on the default cluster.
    /// Returns the file's size.
    pub async fn unlink(&self, name: &str, suffix: &str, action: UnlinkType) -> Result<i64> {
        let cluster = self.default_server();
        self.unlink_with_cluster(name, suffix, action, &cluster)
            .await
    }

    pub async fn unlink_with_cluster(
        &self,
        name: &str,
        suffix: &str,
        action: UnlinkType,
        cluster: &str,
    ) -> Result<i64> {
        self.ensure_live()?;
        let location = self.resolver.resolve(name, suffix, cluster).await?;
        let info = self.unlink_location(&location, action).await?;
        ClientStats::incr(&self.stats.unlinks);
        debug!(name, ?action, status = ?info.status, "unlinked");
        Ok(i64::try_from(info.size).unwrap_or(i64::MAX))
    }

    /// Unlink under a short-lived lease so a retried request is applied once
    pub(crate) async fn unlink_location(
        &self,
        location: &Location,
        action: UnlinkType,
    ) -> Result<FileInfo> {
        let lease = self.resolver.apply_lease(location).await?;
        let mut handle = LeaseHandle::new(lease.lease_id);
        let result = self
            .data
            .unlink(location, action, Some(handle.next()))
            .await
            .inspect_err(|e| self.forget_on_connection_error(location, e));
        self.release_quietly(&location.cluster, lease.lease_id)
            .await;
        result
    }

    /// Read into `buf` from `offset` until it is full or the file ends.
    /// Returns the byte count and the metadata of the last response.
    pub(crate) async fn fetch(
        &self,
        location: &Location,
        offset: u64,
        buf: &mut [u8],
        force: bool,
        lease: Option<u64>,
    ) -> Result<(usize, FileInfo)> {
        let chunk = self.tunables.segment_bytes();
        let mut done = 0;
        loop {
            let want = (buf.len() - done).min(chunk);
            let length = u32::try_from(want).unwrap_or(u32::MAX);
            let response = self
                .data
                .read(location, offset + done as u64, length, force, lease)
                .await
                .inspect_err(|e| self.forget_on_connection_error(location, e))?;

            let got = response.data.len().min(want);
            buf[done..done + got].copy_from_slice(&response.data[..got]);
            done += got;
            if got < want || done == buf.len() {
                return Ok((done, response.info));
            }
        }
    }

    async fn write_small(&self, small: &mut SmallFile, offset: u64, data: &[u8]) -> Result<usize> {
        if !small.pending.continues(offset) {
            self.flush_small(small).await?;
        }
        small.stage(offset, data);
        if small.pending.len() >= self.tunables.segment_bytes() {
            self.flush_small(small).await?;
        }
        Ok(data.len())
    }

    /// Send the pending run to the primary, one segment per request
    async fn flush_small(&self, small: &mut SmallFile) -> Result<()> {
        let Some((offset, data)) = small.pending.take() else {
            return Ok(());
        };
        let mut pos = offset;
        for chunk in data.chunks(self.tunables.segment_bytes()) {
            let seq = small.lease.as_mut().map(LeaseHandle::next);
            let written = self
                .data
                .write(&small.location, seq, pos, chunk.to_vec())
                .await
                .inspect_err(|e| self.forget_on_connection_error(&small.location, e))?;
            if written != chunk.len() as u64 {
                return Err(Error::transfer(format!(
                    "short write: {written} of {} bytes",
                    chunk.len()
                )));
            }
            pos += written;
        }
        Ok(())
    }

    async fn commit_small(&self, small: &mut SmallFile, sync_log: bool) -> Result<FileInfo> {
        self.flush_small(small).await?;
        if !small.created
            && !small.dirty
            && let Some(info) = small.info
        {
            // Opened for writing but never written: leave the file alone
            return Ok(info);
        }

        let seq = small.lease.as_mut().map(LeaseHandle::next);
        let crc = small.crc.value_for(small.high_water);
        let info = self
            .data
            .commit(&small.location, seq, small.high_water, crc, sync_log)
            .await?;
        small.info = Some(info);
        Ok(info)
    }

    async fn release_small(&self, small: &mut SmallFile) {
        if let Some(lease) = small.lease.take() {
            self.release_quietly(&small.location.cluster, lease.lease_id)
                .await;
        }
    }

    pub(crate) async fn release_quietly(&self, cluster: &str, lease_id: u64) {
        if let Err(e) = self.resolver.release_lease(cluster, lease_id).await {
            warn!(cluster, lease_id, error = %e, "failed to release lease");
        }
    }

    /// Drop a descriptor without committing anything
    pub(crate) async fn abandon(&self, file: &mut OpenFile) {
        match &mut file.body {
            Body::Small(small) => {
                small.pending.clear();
                self.release_small(small).await;
            }
            Body::LargeWrite(writer) => self.large_abort(writer).await,
            Body::LargeRead(_) => {}
        }
    }

    fn forget_on_connection_error(&self, location: &Location, error: &Error) {
        if error.is_connection_error() {
            self.resolver.invalidate(location);
        }
    }
}
