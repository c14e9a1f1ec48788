//! Shared cluster state
//!
//! One `ClusterStore` backs the name server and every data server of a
//! reference cluster. Replicas therefore never diverge; replica addresses
//! exist so clients can rotate between them.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use tfs_common::{
    BlockId, Error, FileId, FileStatus, Result, UnlinkAction, UnlinkType, checksum::compute_crc32c,
};
use tfs_proto::{
    ApplyLeaseRequest, BlockLocation, ClusterInfo, CommitRequest, CreateFileRequest, FileInfo,
    Lease, NewFile, ReadRequest, ReadResponse, StatRequest, UnlinkRequest, WriteRequest,
};

/// Per-file header overhead counted in `usize`
pub const FILE_HEADER_SIZE: u64 = 32;

/// Cluster layout
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub cluster_id: u8,
    pub server_id: u64,
    /// Copies of each block
    pub replicas: usize,
    /// Files allocated in a block before a new one is opened
    pub files_per_block: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cluster_id: 1,
            server_id: 1,
            replicas: 2,
            files_per_block: 1024,
        }
    }
}

/// Result of a sequenced request and whether it was answered from the
/// replay cache instead of being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome<T> {
    pub value: T,
    pub replayed: bool,
}

impl<T> Outcome<T> {
    const fn applied(value: T) -> Self {
        Self {
            value,
            replayed: false,
        }
    }

    const fn replayed(value: T) -> Self {
        Self {
            value,
            replayed: true,
        }
    }
}

#[derive(Debug, Clone)]
struct BlockMeta {
    servers: Vec<String>,
    version: u32,
    next_seq: u32,
    file_count: u32,
    used: u64,
}

#[derive(Debug, Clone)]
struct StoredFile {
    data: Vec<u8>,
    info: FileInfo,
}

#[derive(Debug, Clone, Copy)]
enum Applied {
    Written(u64),
    Info(FileInfo),
}

#[derive(Debug)]
struct LeaseState {
    block_id: BlockId,
    file_id: FileId,
    staging: Vec<u8>,
    /// The lease came with a newly allocated file
    created: bool,
    committed: bool,
    last_seq: u64,
    last_applied: Option<Applied>,
}

#[derive(Debug, Default)]
struct StoreState {
    blocks: BTreeMap<BlockId, BlockMeta>,
    writable: Option<BlockId>,
    next_block_id: u32,
    next_lease_id: u64,
    files: HashMap<(BlockId, FileId), StoredFile>,
    leases: HashMap<u64, LeaseState>,
}

/// In-memory state of one cluster
pub struct ClusterStore {
    config: StoreConfig,
    data_servers: Vec<String>,
    state: RwLock<StoreState>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn overlay(buf: &mut Vec<u8>, offset: u64, data: &[u8]) -> Result<()> {
    let start = usize::try_from(offset).map_err(|_| Error::invalid_argument("offset overflow"))?;
    let end = start + data.len();
    if buf.len() < end {
        buf.resize(end, 0);
    }
    buf[start..end].copy_from_slice(data);
    Ok(())
}

fn slice_at(data: &[u8], offset: u64, length: u32) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let end = start.saturating_add(length as usize).min(data.len());
    data[start..end].to_vec()
}

fn file_key(block_id: BlockId, file_id: FileId) -> String {
    format!("block {block_id} file {file_id}")
}

impl LeaseState {
    fn check_target(&self, lease_id: u64, block_id: BlockId, file_id: FileId) -> Result<()> {
        if self.block_id != block_id || self.file_id != file_id {
            return Err(Error::invalid_argument(format!(
                "lease {lease_id} does not cover {}",
                file_key(block_id, file_id)
            )));
        }
        Ok(())
    }

    /// Replay check for sequenced requests under this lease
    fn replay(&self, lease_id: u64, seq: u64) -> Result<Option<Applied>> {
        if seq > self.last_seq {
            return Ok(None);
        }
        match self.last_applied {
            Some(applied) if seq == self.last_seq => Ok(Some(applied)),
            _ => Err(Error::invalid_argument(format!(
                "stale sequence {seq} for lease {lease_id} (last {})",
                self.last_seq
            ))),
        }
    }

    fn record(&mut self, seq: u64, applied: Applied) {
        self.last_seq = seq;
        self.last_applied = Some(applied);
    }
}

impl ClusterStore {
    #[must_use]
    pub fn new(config: StoreConfig, data_servers: Vec<String>) -> Self {
        Self {
            config,
            data_servers,
            state: RwLock::new(StoreState {
                next_block_id: 1,
                next_lease_id: 1,
                ..StoreState::default()
            }),
        }
    }

    #[must_use]
    pub fn cluster_info(&self) -> ClusterInfo {
        ClusterInfo {
            cluster_id: self.config.cluster_id,
            server_id: self.config.server_id,
        }
    }

    #[must_use]
    pub fn data_servers(&self) -> &[String] {
        &self.data_servers
    }

    pub fn get_block(&self, block_id: BlockId) -> Result<BlockLocation> {
        let state = self.state.read();
        let block = state
            .blocks
            .get(&block_id)
            .ok_or_else(|| Error::not_found(format!("block {block_id}")))?;
        Ok(BlockLocation {
            block_id,
            servers: block.servers.clone(),
            version: block.version,
        })
    }

    fn allocate_block(&self, state: &mut StoreState) -> Result<BlockId> {
        if self.data_servers.is_empty() {
            return Err(Error::AllocationFailed("no data servers".into()));
        }
        let block_id = BlockId(state.next_block_id);
        state.next_block_id = state
            .next_block_id
            .checked_add(1)
            .ok_or_else(|| Error::AllocationFailed("block ids exhausted".into()))?;

        let n = self.data_servers.len();
        let replicas = self.config.replicas.clamp(1, n);
        let first = block_id.0 as usize % n;
        let servers = (0..replicas)
            .map(|i| self.data_servers[(first + i) % n].clone())
            .collect();

        state.blocks.insert(
            block_id,
            BlockMeta {
                servers,
                version: 1,
                next_seq: 1,
                file_count: 0,
                used: 0,
            },
        );
        state.writable = Some(block_id);
        info!(cluster = self.config.cluster_id, %block_id, "allocated block");
        Ok(block_id)
    }

    pub fn create_file(&self, req: &CreateFileRequest) -> Result<NewFile> {
        let mut state = self.state.write();

        let reusable = state.writable.filter(|id| {
            !req.new_block
                && state
                    .blocks
                    .get(id)
                    .is_some_and(|b| b.file_count < self.config.files_per_block)
        });
        let block_id = match reusable {
            Some(id) => id,
            None => self.allocate_block(&mut state)?,
        };

        let block = state
            .blocks
            .get_mut(&block_id)
            .ok_or_else(|| Error::internal("writable block vanished"))?;
        let seq = block.next_seq;
        block.next_seq += 1;
        block.file_count += 1;
        let servers = block.servers.clone();
        let version = block.version;

        let file_id = FileId::new(seq, req.suffix_hash);
        let ts = now();
        state.files.insert(
            (block_id, file_id),
            StoredFile {
                data: Vec::new(),
                info: FileInfo {
                    file_id,
                    block_offset: 0,
                    size: 0,
                    usize: 0,
                    modify_time: ts,
                    create_time: ts,
                    status: FileStatus::Writing,
                    crc: 0,
                },
            },
        );

        let lease_id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            lease_id,
            LeaseState {
                block_id,
                file_id,
                staging: Vec::new(),
                created: true,
                committed: false,
                last_seq: 0,
                last_applied: None,
            },
        );

        debug!(
            %block_id, %file_id, lease_id, large = req.large, client = %req.client_id,
            "created file"
        );
        Ok(NewFile {
            block_id,
            file_id,
            servers,
            version,
            lease_id,
        })
    }

    pub fn apply_lease(&self, req: &ApplyLeaseRequest) -> Result<Lease> {
        let mut state = self.state.write();
        let staging = match state.files.get(&(req.block_id, req.file_id)) {
            Some(file) if file.info.status != FileStatus::Writing => file.data.clone(),
            _ => return Err(Error::not_found(file_key(req.block_id, req.file_id))),
        };

        let lease_id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            lease_id,
            LeaseState {
                block_id: req.block_id,
                file_id: req.file_id,
                staging,
                created: false,
                committed: false,
                last_seq: 0,
                last_applied: None,
            },
        );
        debug!(block_id = %req.block_id, file_id = %req.file_id, lease_id, "granted lease");
        Ok(Lease { lease_id })
    }

    /// Drop a lease. A created file that was never committed goes with it.
    pub fn release_lease(&self, lease_id: u64) {
        let mut state = self.state.write();
        let Some(lease) = state.leases.remove(&lease_id) else {
            return;
        };
        if lease.created && !lease.committed {
            state.files.remove(&(lease.block_id, lease.file_id));
            debug!(
                lease_id,
                block_id = %lease.block_id,
                file_id = %lease.file_id,
                "dropped uncommitted file"
            );
        }
    }

    pub fn write(&self, req: &WriteRequest) -> Result<Outcome<u64>> {
        let mut state = self.state.write();
        let len = req.data.len() as u64;

        if let Some(lease_id) = req.lease_id {
            let lease = state
                .leases
                .get_mut(&lease_id)
                .ok_or_else(|| Error::LeaseExpired(format!("lease {lease_id}")))?;
            lease.check_target(lease_id, req.block_id, req.file_id)?;
            match lease.replay(lease_id, req.seq)? {
                Some(Applied::Written(n)) => return Ok(Outcome::replayed(n)),
                Some(Applied::Info(_)) => {
                    return Err(Error::invalid_argument(format!(
                        "sequence {} of lease {lease_id} was not a write",
                        req.seq
                    )));
                }
                None => {}
            }
            overlay(&mut lease.staging, req.offset, &req.data)?;
            lease.record(req.seq, Applied::Written(len));
            return Ok(Outcome::applied(len));
        }

        let file = state
            .files
            .get_mut(&(req.block_id, req.file_id))
            .filter(|f| f.info.status == FileStatus::Normal)
            .ok_or_else(|| Error::not_found(file_key(req.block_id, req.file_id)))?;
        overlay(&mut file.data, req.offset, &req.data)?;
        file.info.size = file.data.len() as u64;
        file.info.usize = file.info.size + FILE_HEADER_SIZE;
        file.info.crc = compute_crc32c(&file.data);
        file.info.modify_time = now();
        Ok(Outcome::applied(len))
    }

    pub fn commit(&self, req: &CommitRequest) -> Result<Outcome<FileInfo>> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let size = usize::try_from(req.size).map_err(|_| Error::invalid_argument("size overflow"))?;

        let (data, created) = match req.lease_id {
            Some(lease_id) => {
                let lease = state
                    .leases
                    .get(&lease_id)
                    .ok_or_else(|| Error::LeaseExpired(format!("lease {lease_id}")))?;
                lease.check_target(lease_id, req.block_id, req.file_id)?;
                match lease.replay(lease_id, req.seq)? {
                    Some(Applied::Info(info)) => return Ok(Outcome::replayed(info)),
                    Some(Applied::Written(_)) => {
                        return Err(Error::invalid_argument(format!(
                            "sequence {} of lease {lease_id} was not a commit",
                            req.seq
                        )));
                    }
                    None => {}
                }
                let mut data = lease.staging.clone();
                data.resize(size, 0);
                (data, lease.created && !lease.committed)
            }
            None => {
                let file = state
                    .files
                    .get(&(req.block_id, req.file_id))
                    .filter(|f| f.info.status == FileStatus::Normal)
                    .ok_or_else(|| Error::not_found(file_key(req.block_id, req.file_id)))?;
                let mut data = file.data.clone();
                data.resize(size, 0);
                (data, false)
            }
        };

        let crc = compute_crc32c(&data);
        if let Some(expected) = req.crc
            && expected != crc
        {
            return Err(Error::ChecksumMismatch {
                expected,
                actual: crc,
            });
        }

        let block_offset = if created {
            let block = state
                .blocks
                .get_mut(&req.block_id)
                .ok_or_else(|| Error::not_found(format!("block {}", req.block_id)))?;
            let offset = block.used;
            block.used += req.size + FILE_HEADER_SIZE;
            Some(i32::try_from(offset).unwrap_or(i32::MAX))
        } else {
            None
        };

        let file = state
            .files
            .get_mut(&(req.block_id, req.file_id))
            .ok_or_else(|| Error::not_found(file_key(req.block_id, req.file_id)))?;
        let ts = now();
        if let Some(offset) = block_offset {
            file.info.block_offset = offset;
            file.info.create_time = ts;
            file.info.status = FileStatus::Normal;
        }
        file.info.size = req.size;
        file.info.usize = req.size + FILE_HEADER_SIZE;
        file.info.crc = crc;
        file.info.modify_time = ts;
        file.data.clone_from(&data);
        let info = file.info;

        if let Some(lease_id) = req.lease_id
            && let Some(lease) = state.leases.get_mut(&lease_id)
        {
            lease.staging = data;
            lease.committed = true;
            lease.record(req.seq, Applied::Info(info));
        }

        if req.sync_log {
            debug!(
                block_id = %req.block_id,
                file_id = %req.file_id,
                size = req.size,
                "sync log record"
            );
        }
        Ok(Outcome::applied(info))
    }

    pub fn stat(&self, req: &StatRequest) -> Result<FileInfo> {
        let state = self.state.read();
        let (info, _) = Self::view(&state, req.block_id, req.file_id, req.force, req.lease_id)?;
        Ok(info)
    }

    pub fn read(&self, req: &ReadRequest) -> Result<ReadResponse> {
        let state = self.state.read();
        let (info, data) = Self::view(&state, req.block_id, req.file_id, req.force, req.lease_id)?;
        Ok(ReadResponse {
            data: slice_at(data, req.offset, req.length),
            info,
        })
    }

    /// File contents and metadata as seen by a reader
    fn view(
        state: &StoreState,
        block_id: BlockId,
        file_id: FileId,
        force: bool,
        lease_id: Option<u64>,
    ) -> Result<(FileInfo, &[u8])> {
        let file = state
            .files
            .get(&(block_id, file_id))
            .ok_or_else(|| Error::not_found(file_key(block_id, file_id)))?;

        if let Some(lease) = lease_id.and_then(|id| state.leases.get(&id))
            && lease.block_id == block_id
            && lease.file_id == file_id
        {
            let mut info = file.info;
            info.size = lease.staging.len() as u64;
            return Ok((info, &lease.staging));
        }

        match file.info.status {
            FileStatus::Normal => {}
            FileStatus::Writing => return Err(Error::not_found(file_key(block_id, file_id))),
            FileStatus::Deleted | FileStatus::Concealed if !force => {
                return Err(Error::not_found(format!(
                    "{} is {}",
                    file_key(block_id, file_id),
                    file.info.status
                )));
            }
            FileStatus::Deleted | FileStatus::Concealed => {}
        }
        Ok((file.info, &file.data))
    }

    pub fn unlink(&self, req: &UnlinkRequest) -> Result<Outcome<FileInfo>> {
        let unlink = UnlinkType::from_raw(req.action)?;
        let mut guard = self.state.write();
        let state = &mut *guard;

        if let Some(lease_id) = req.lease_id {
            let lease = state
                .leases
                .get(&lease_id)
                .ok_or_else(|| Error::LeaseExpired(format!("lease {lease_id}")))?;
            lease.check_target(lease_id, req.block_id, req.file_id)?;
            match lease.replay(lease_id, req.seq)? {
                Some(Applied::Info(info)) => return Ok(Outcome::replayed(info)),
                Some(Applied::Written(_)) => {
                    return Err(Error::invalid_argument(format!(
                        "sequence {} of lease {lease_id} was not an unlink",
                        req.seq
                    )));
                }
                None => {}
            }
        }

        let file = state
            .files
            .get_mut(&(req.block_id, req.file_id))
            .filter(|f| f.info.status != FileStatus::Writing)
            .ok_or_else(|| Error::not_found(file_key(req.block_id, req.file_id)))?;

        let target = transition(unlink, file.info.status)?;
        file.info.status = target;
        file.info.modify_time = now();
        let info = file.info;

        if let Some(lease_id) = req.lease_id
            && let Some(lease) = state.leases.get_mut(&lease_id)
        {
            lease.record(req.seq, Applied::Info(info));
        }
        debug!(block_id = %req.block_id, file_id = %req.file_id, ?unlink, %target, "unlinked");
        Ok(Outcome::applied(info))
    }

    /// Number of stored files, committed or not
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.state.read().files.len()
    }

    /// Number of outstanding leases
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.state.read().leases.len()
    }
}

/// Status a file moves to under an unlink action
fn transition(unlink: UnlinkType, status: FileStatus) -> Result<FileStatus> {
    use FileStatus::{Concealed, Deleted, Normal};
    use UnlinkAction::{Conceal, Delete, Reveal, Undelete};

    let target = match (unlink.action, status) {
        (Delete, Normal | Concealed) => Deleted,
        (Undelete, Deleted) | (Reveal, Concealed) => Normal,
        (Conceal, Normal) => Concealed,
        (action, _) if unlink.override_state => match action {
            Delete => Deleted,
            Conceal => Concealed,
            Undelete | Reveal => Normal,
        },
        (action, status) => {
            return Err(Error::StateConflict(format!(
                "cannot {action:?} a {status} file"
            )));
        }
    };
    Ok(target)
}
