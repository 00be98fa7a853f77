//! The append-only index file.
//!
//! Layout: a fixed-size header block at offset zero, followed by
//! variable-length records (tree nodes and id-map snapshots). Records are
//! never rewritten; a mutation appends new records and becomes visible only
//! when a new header is committed. Each record and the header itself carry a
//! CRC32 over the payload, verified on read.
//!
//! [`IndexFile`] is a cheap-clone handle. Cloning it is how readers keep the
//! descriptor alive across header commits: a snapshot holds its own clone,
//! so the underlying file outlives any registry-level replacement.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{SpatialError, SpatialResult};
use crate::vtree::node::{Node, NodeOffset};

/// Reserved space for the header block.
pub const HEADER_BLOCK_SIZE: u64 = 4096;

/// Marker of the current header layout.
pub const HEADER_MAGIC: [u8; 4] = *b"gst\0";

/// Marker written by earlier releases; accepted on open and rewritten.
pub const LEGACY_HEADER_MAGIC: [u8; 4] = *b"rck\0";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The committed state of a group: everything a reader needs to traverse
/// the index at a consistent snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub signature: [u8; 16],
    pub current_seq: u64,
    pub purge_seq: u64,
    pub id_map_root: Option<NodeOffset>,
    pub roots: Vec<Option<NodeOffset>>,
}

impl IndexHeader {
    /// A fresh header for an empty group over `n_indices` trees.
    pub fn empty(signature: [u8; 16], n_indices: usize) -> IndexHeader {
        IndexHeader {
            signature,
            current_seq: 0,
            purge_seq: 0,
            id_map_root: None,
            roots: vec![None; n_indices],
        }
    }
}

struct FileState {
    file: File,
    len: u64,
}

struct IndexFileInner {
    path: PathBuf,
    state: Mutex<FileState>,
}

/// Handle to an open index file. Clones share the descriptor.
#[derive(Clone)]
pub struct IndexFile {
    inner: Arc<IndexFileInner>,
}

impl IndexFile {
    /// Opens the index file at `path`, creating it if absent.
    ///
    /// A readable header whose signature matches `signature` resumes the
    /// stored state. A missing, corrupt or mismatching header resets the
    /// file to an empty group; this is the only error the file recovers
    /// from locally. The legacy header marker is accepted and upgraded in
    /// place.
    pub fn open_or_create(
        path: &Path,
        signature: [u8; 16],
        n_indices: usize,
    ) -> SpatialResult<(IndexFile, IndexHeader)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();

        let index_file = IndexFile {
            inner: Arc::new(IndexFileInner {
                path: path.to_path_buf(),
                state: Mutex::new(FileState { file, len }),
            }),
        };

        if len == 0 {
            log::debug!("creating index file {:?}", path);
            let header = index_file.reset(signature, n_indices)?;
            return Ok((index_file, header));
        }

        match index_file.read_header() {
            Ok((header, legacy)) if header.signature == signature => {
                if legacy {
                    log::warn!("upgrading legacy header marker in {:?}", path);
                    index_file.commit_header(&header)?;
                }
                log::debug!(
                    "opened index file {:?} at seq {}",
                    path,
                    header.current_seq
                );
                Ok((index_file, header))
            }
            Ok(_) => {
                log::warn!("index signature mismatch, resetting {:?}", path);
                let header = index_file.reset(signature, n_indices)?;
                Ok((index_file, header))
            }
            Err(e) => {
                log::warn!("unreadable index header ({}), resetting {:?}", e, path);
                let header = index_file.reset(signature, n_indices)?;
                Ok((index_file, header))
            }
        }
    }

    /// Truncates the file and writes a fresh header for an empty group.
    pub fn reset(&self, signature: [u8; 16], n_indices: usize) -> SpatialResult<IndexHeader> {
        let header = IndexHeader::empty(signature, n_indices);
        {
            let mut state = self.inner.state.lock();
            state.file.set_len(0)?;
            state.len = 0;
            Self::write_header_locked(&mut state, &header)?;
            state.file.sync_all()?;
        }
        Ok(header)
    }

    /// Appends one serialized record, returning its offset.
    pub fn append<T: Serialize>(&self, record: &T) -> SpatialResult<NodeOffset> {
        let payload = bincode::serde::encode_to_vec(record, bincode::config::legacy())
            .map_err(|e| SpatialError::Codec(e.to_string()))?;
        let crc = CRC32.checksum(&payload);

        let mut state = self.inner.state.lock();
        let offset = state.len.max(HEADER_BLOCK_SIZE);
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_u32::<LittleEndian>(payload.len() as u32)?;
        state.file.write_u32::<LittleEndian>(crc)?;
        state.file.write_all(&payload)?;
        state.len = offset + 8 + payload.len() as u64;
        Ok(offset)
    }

    /// Reads back the record at `offset`, verifying its checksum.
    pub fn read<T: DeserializeOwned>(&self, offset: NodeOffset) -> SpatialResult<T> {
        let mut state = self.inner.state.lock();
        state.file.seek(SeekFrom::Start(offset))?;
        let len = state.file.read_u32::<LittleEndian>()? as usize;
        let crc = state.file.read_u32::<LittleEndian>()?;
        let mut payload = vec![0u8; len];
        state.file.read_exact(&mut payload)?;
        drop(state);

        if CRC32.checksum(&payload) != crc {
            return Err(SpatialError::Codec(format!(
                "record checksum mismatch at offset {}",
                offset
            )));
        }
        bincode::serde::decode_from_slice(&payload, bincode::config::legacy())
            .map(|(record, _)| record)
            .map_err(|e| SpatialError::Codec(e.to_string()))
    }

    pub fn append_node(&self, node: &Node) -> SpatialResult<NodeOffset> {
        self.append(node)
    }

    pub fn read_node(&self, offset: NodeOffset) -> SpatialResult<Node> {
        self.read(offset)
    }

    /// Makes `header` the committed state: all previously appended records
    /// are forced to disk before the header block is rewritten, so a
    /// committed header never references non-durable nodes.
    pub fn commit_header(&self, header: &IndexHeader) -> SpatialResult<()> {
        let mut state = self.inner.state.lock();
        state.file.sync_data()?;
        Self::write_header_locked(&mut state, header)?;
        state.file.sync_all()?;
        Ok(())
    }

    fn write_header_locked(state: &mut FileState, header: &IndexHeader) -> SpatialResult<()> {
        let payload = bincode::serde::encode_to_vec(header, bincode::config::legacy())
            .map_err(|e| SpatialError::Codec(e.to_string()))?;
        if payload.len() as u64 + 12 > HEADER_BLOCK_SIZE {
            return Err(SpatialError::Codec(format!(
                "header too large: {} bytes",
                payload.len()
            )));
        }
        let mut block = Vec::with_capacity(HEADER_BLOCK_SIZE as usize);
        block.extend_from_slice(&HEADER_MAGIC);
        block.write_u32::<LittleEndian>(CRC32.checksum(&payload))?;
        block.write_u32::<LittleEndian>(payload.len() as u32)?;
        block.extend_from_slice(&payload);
        block.resize(HEADER_BLOCK_SIZE as usize, 0);

        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&block)?;
        state.len = state.len.max(HEADER_BLOCK_SIZE);
        Ok(())
    }

    /// Reads the committed header. The boolean is true when the block still
    /// carried the legacy marker.
    pub fn read_header(&self) -> SpatialResult<(IndexHeader, bool)> {
        let mut block = vec![0u8; HEADER_BLOCK_SIZE as usize];
        {
            let mut state = self.inner.state.lock();
            state.file.seek(SeekFrom::Start(0))?;
            state.file.read_exact(&mut block)?;
        }

        let marker = [block[0], block[1], block[2], block[3]];
        let legacy = match marker {
            m if m == HEADER_MAGIC => false,
            m if m == LEGACY_HEADER_MAGIC => true,
            m => {
                return Err(SpatialError::Codec(format!(
                    "unknown header marker {:?}",
                    m
                )))
            }
        };

        let mut cursor = &block[4..];
        let crc = cursor.read_u32::<LittleEndian>()?;
        let len = cursor.read_u32::<LittleEndian>()? as usize;
        if len + 12 > HEADER_BLOCK_SIZE as usize {
            return Err(SpatialError::Codec(format!(
                "header length field out of range: {}",
                len
            )));
        }
        let payload = &block[12..12 + len];
        if CRC32.checksum(payload) != crc {
            return Err(SpatialError::Codec("header checksum mismatch".into()));
        }
        let header = bincode::serde::decode_from_slice(payload, bincode::config::legacy())
            .map(|(header, _)| header)
            .map_err(|e| SpatialError::Codec(e.to_string()))?;
        Ok((header, legacy))
    }

    /// Current file length in bytes.
    pub fn len(&self) -> u64 {
        self.inner.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= HEADER_BLOCK_SIZE
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of live handles on this file, snapshots included.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}
