//! Virtual file directory backed by keys under an index subspace.
//!
//! Every file is chunked into fixed-size blocks stored one per key; a small
//! file-reference record keyed by name carries the file id, its length, and
//! the block geometry. Renames touch only the reference. Reads go through the
//! process-wide block cache; writes stream through the agility context so a
//! large file never outgrows one transaction.
//!
//! Layout below the partition data subspace:
//!   `0 · name`              -> file reference
//!   `1 · file-id · block#`  -> (compressed) block bytes
//!   `2 · segment · doc-id`  -> stored-fields record
//!   `3 · name`              -> lock cell
//!   `4`                     -> file-id allocation sequence
//!   `5 · primary-key...`    -> (segment, doc-id) of the document

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::metrics::{self, Metrics};
use crate::tuple::{Subspace, Tuple};

use super::agility::AgilityContext;
use super::block_cache::BlockCache;
use super::lazy::LazyHandle;
use super::lock::DirectoryLock;

const FILE_REF_SUBSPACE: i64 = 0;
const BLOCK_SUBSPACE: i64 = 1;
const STORED_FIELDS_SUBSPACE: i64 = 2;
const LOCK_SUBSPACE: i64 = 3;
const SEQUENCE_SUBSPACE: i64 = 4;
const PRIMARY_KEY_SUBSPACE: i64 = 5;

const FILE_REF_VERSION: u8 = 1;
const COMPRESSION_LEVEL: i32 = 3;

/// Metadata record for one virtual file. Immutable once written except that
/// the length is fixed at close time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    pub id: u64,
    pub length: u64,
    pub block_size: u32,
    pub compressed: bool,
}

impl FileReference {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 22];
        buf[0] = FILE_REF_VERSION;
        LittleEndian::write_u64(&mut buf[1..9], self.id);
        LittleEndian::write_u64(&mut buf[9..17], self.length);
        LittleEndian::write_u32(&mut buf[17..21], self.block_size);
        buf[21] = self.compressed as u8;
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != 22 || data[0] != FILE_REF_VERSION {
            return Err(Error::Corruption("malformed file reference".into()));
        }
        Ok(Self {
            id: LittleEndian::read_u64(&data[1..9]),
            length: LittleEndian::read_u64(&data[9..17]),
            block_size: LittleEndian::read_u32(&data[17..21]),
            compressed: data[21] != 0,
        })
    }

    pub fn num_blocks(&self) -> u64 {
        self.length.div_ceil(self.block_size as u64)
    }
}

/// File-like namespace over one partition's data subspace.
pub struct KvDirectory {
    subspace: Subspace,
    /// Stable per-(group, partition) id; part of every block-cache key.
    instance_id: u64,
    agility: Arc<AgilityContext>,
    block_cache: Arc<BlockCache>,
    metrics: Arc<Metrics>,
    block_size: usize,
    compression: bool,
    lock_window_ms: i64,
    file_refs: RwLock<FxHashMap<String, FileReference>>,
}

impl KvDirectory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subspace: Subspace,
        instance_id: u64,
        agility: Arc<AgilityContext>,
        block_cache: Arc<BlockCache>,
        metrics: Arc<Metrics>,
        block_size: usize,
        compression: bool,
        lock_window_ms: i64,
    ) -> Self {
        Self {
            subspace,
            instance_id,
            agility,
            block_cache,
            metrics,
            block_size,
            compression,
            lock_window_ms,
            file_refs: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn agility(&self) -> &Arc<AgilityContext> {
        &self.agility
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    // --- key construction -------------------------------------------------

    fn file_ref_key(&self, name: &str) -> Vec<u8> {
        self.subspace
            .pack(&Tuple::new().push_int(FILE_REF_SUBSPACE).push_str(name))
    }

    fn file_ref_range(&self) -> (Vec<u8>, Vec<u8>) {
        self.subspace
            .subspace(&Tuple::new().push_int(FILE_REF_SUBSPACE))
            .range()
    }

    fn block_key(&self, file_id: u64, block_no: u64) -> Vec<u8> {
        self.subspace.pack(
            &Tuple::new()
                .push_int(BLOCK_SUBSPACE)
                .push_int(file_id as i64)
                .push_int(block_no as i64),
        )
    }

    fn block_range(&self, file_id: u64) -> (Vec<u8>, Vec<u8>) {
        self.subspace
            .subspace(
                &Tuple::new()
                    .push_int(BLOCK_SUBSPACE)
                    .push_int(file_id as i64),
            )
            .range()
    }

    fn stored_fields_key(&self, segment: &str, doc_id: u32) -> Vec<u8> {
        self.subspace.pack(
            &Tuple::new()
                .push_int(STORED_FIELDS_SUBSPACE)
                .push_str(segment)
                .push_int(doc_id as i64),
        )
    }

    fn stored_fields_range(&self, segment: &str) -> (Vec<u8>, Vec<u8>) {
        self.subspace
            .subspace(
                &Tuple::new()
                    .push_int(STORED_FIELDS_SUBSPACE)
                    .push_str(segment),
            )
            .range()
    }

    pub(crate) fn lock_key(&self, name: &str) -> Vec<u8> {
        self.subspace
            .pack(&Tuple::new().push_int(LOCK_SUBSPACE).push_str(name))
    }

    fn sequence_key(&self) -> Vec<u8> {
        self.subspace.pack(&Tuple::new().push_int(SEQUENCE_SUBSPACE))
    }

    fn primary_key_key(&self, primary_key: &Tuple) -> Vec<u8> {
        self.subspace
            .pack(&Tuple::new().push_int(PRIMARY_KEY_SUBSPACE).concat(primary_key))
    }

    // --- namespace operations ---------------------------------------------

    /// All file names, sorted.
    pub async fn list_all(&self) -> Result<Vec<String>> {
        let (begin, end) = self.file_ref_range();
        let entries = self.agility.get_range(&begin, &end, None, false).await?;
        let subspace = self
            .subspace
            .subspace(&Tuple::new().push_int(FILE_REF_SUBSPACE));
        let mut names = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            names.push(subspace.unpack(&key)?.get_str(0)?.to_string());
        }
        Ok(names)
    }

    /// The file reference for `name`, if the file exists.
    pub async fn file_reference(&self, name: &str) -> Result<Option<FileReference>> {
        if let Some(reference) = self.file_refs.read().get(name) {
            return Ok(Some(reference.clone()));
        }
        let value = self.agility.get(&self.file_ref_key(name)).await?;
        match value {
            Some(value) => {
                let reference = FileReference::decode(&value)?;
                self.file_refs
                    .write()
                    .insert(name.to_string(), reference.clone());
                Ok(Some(reference))
            }
            None => Ok(None),
        }
    }

    pub async fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.file_reference(name).await?.is_some())
    }

    pub async fn file_length(&self, name: &str) -> Result<u64> {
        self.file_reference(name)
            .await?
            .map(|r| r.length)
            .ok_or_else(|| Error::FileNotFound(name.to_string()))
    }

    /// Open `name` for writing. Fails if the file already exists; files are
    /// immutable once closed and blocks are never overwritten.
    pub async fn create_output(self: &Arc<Self>, name: &str) -> Result<KvIndexOutput> {
        if self.file_exists(name).await? {
            return Err(Error::InvalidArgument(format!(
                "file already exists: {name}"
            )));
        }
        let id = self.allocate_file_id().await?;
        Ok(KvIndexOutput {
            directory: Arc::clone(self),
            name: name.to_string(),
            id,
            buffer: Vec::with_capacity(self.block_size),
            next_block: 0,
            length: 0,
        })
    }

    async fn allocate_file_id(&self) -> Result<u64> {
        let key = self.sequence_key();
        self.agility
            .apply(|txn| async move {
                let next = match txn.get(&key).await? {
                    Some(raw) if raw.len() == 8 => LittleEndian::read_u64(&raw) + 1,
                    Some(_) => return Err(Error::Corruption("malformed file sequence".into())),
                    None => 1,
                };
                let mut raw = [0u8; 8];
                LittleEndian::write_u64(&mut raw, next);
                txn.set(&key, &raw);
                Ok(next)
            })
            .await
    }

    /// Open `name` for reading. The file reference is resolved lazily on
    /// first access, once, shared by every slice of this input.
    pub fn open_input(self: &Arc<Self>, name: &str) -> KvIndexInput {
        let directory = Arc::clone(self);
        let owned_name = name.to_string();
        let handle = LazyHandle::new(move || async move {
            directory
                .file_reference(&owned_name)
                .await?
                .ok_or(Error::FileNotFound(owned_name))
        });
        KvIndexInput {
            directory: Arc::clone(self),
            name: name.to_string(),
            reference: Arc::new(handle),
            window: None,
        }
    }

    pub async fn delete_file(&self, name: &str) -> Result<()> {
        let reference = self
            .file_reference(name)
            .await?
            .ok_or_else(|| Error::FileNotFound(name.to_string()))?;
        self.agility.clear(&self.file_ref_key(name)).await?;
        let (begin, end) = self.block_range(reference.id);
        self.agility.clear_range(&begin, &end).await?;
        self.file_refs.write().remove(name);
        Ok(())
    }

    /// Metadata-only rename, performed in a single sub-transaction.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_key = self.file_ref_key(from);
        let to_key = self.file_ref_key(to);
        let from_name = from.to_string();
        let reference = self
            .agility
            .apply(|txn| async move {
                let raw = txn
                    .get(&from_key)
                    .await?
                    .ok_or(Error::FileNotFound(from_name))?;
                txn.set(&to_key, &raw);
                txn.clear(&from_key);
                FileReference::decode(&raw)
            })
            .await?;
        let mut refs = self.file_refs.write();
        refs.remove(from);
        refs.insert(to.to_string(), reference);
        Ok(())
    }

    /// Acquire the named advisory lock within this directory's subspace.
    pub async fn obtain_lock(&self, name: &str) -> Result<DirectoryLock> {
        DirectoryLock::obtain(
            Arc::clone(&self.agility),
            Arc::clone(&self.metrics),
            name.to_string(),
            self.lock_key(name),
            self.lock_window_ms,
        )
        .await
    }

    /// Flush pending writes (commits the agility context's sub-transaction
    /// when agile).
    pub async fn close(&self) -> Result<()> {
        self.agility.flush().await
    }

    // --- block IO ----------------------------------------------------------

    async fn write_block(&self, file_id: u64, block_no: u64, data: &[u8]) -> Result<()> {
        let payload = if self.compression {
            zstd::stream::encode_all(data, COMPRESSION_LEVEL).map_err(Error::Io)?
        } else {
            data.to_vec()
        };
        self.agility.set(&self.block_key(file_id, block_no), &payload).await
    }

    async fn read_block(&self, reference: &FileReference, block_no: u64) -> Result<Arc<Vec<u8>>> {
        let cache_key = (self.instance_id, reference.id, block_no);
        let compressed = reference.compressed;
        self.block_cache
            .get_or_load(cache_key, || async move {
                let raw = self
                    .agility
                    .get(&self.block_key(reference.id, block_no))
                    .await?
                    .ok_or_else(|| {
                        Error::Corruption(format!(
                            "missing block {block_no} of file id {}",
                            reference.id
                        ))
                    })?;
                if compressed {
                    zstd::stream::decode_all(&raw[..])
                        .map_err(|e| Error::Corruption(format!("block decompression failed: {e}")))
                } else {
                    Ok(raw)
                }
            })
            .await
    }

    // --- stored fields ------------------------------------------------------

    pub async fn write_stored_fields(
        &self,
        segment: &str,
        doc_id: u32,
        record: &[u8],
    ) -> Result<()> {
        let key = self.stored_fields_key(segment, doc_id);
        metrics::add(
            &self.metrics.write_stored_fields_bytes,
            (key.len() + record.len()) as u64,
        );
        self.agility.set(&key, record).await
    }

    pub async fn read_stored_fields(&self, segment: &str, doc_id: u32) -> Result<Option<Vec<u8>>> {
        metrics::increment(&self.metrics.wait_get_stored_fields);
        self.agility.get(&self.stored_fields_key(segment, doc_id)).await
    }

    /// One range read over every stored-fields record of a segment, in
    /// ascending doc-id order.
    pub async fn scan_stored_fields(&self, segment: &str) -> Result<Vec<(u32, Vec<u8>)>> {
        let (begin, end) = self.stored_fields_range(segment);
        let entries = self.agility.get_range(&begin, &end, None, false).await?;
        let subspace = self.subspace.subspace(
            &Tuple::new()
                .push_int(STORED_FIELDS_SUBSPACE)
                .push_str(segment),
        );
        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let doc_id = subspace.unpack(&key)?.get_int(0)? as u32;
            records.push((doc_id, value));
        }
        Ok(records)
    }

    /// Drop every stored-fields record of a segment.
    pub async fn clear_stored_fields(&self, segment: &str) -> Result<()> {
        metrics::increment(&self.metrics.delete_stored_fields);
        let (begin, end) = self.stored_fields_range(segment);
        self.agility.clear_range(&begin, &end).await
    }

    // --- primary-key index --------------------------------------------------

    pub async fn primary_key_set(
        &self,
        primary_key: &Tuple,
        segment: &str,
        doc_id: u32,
    ) -> Result<()> {
        let value = Tuple::new().push_str(segment).push_int(doc_id as i64).pack();
        self.agility.set(&self.primary_key_key(primary_key), &value).await
    }

    pub async fn primary_key_clear(&self, primary_key: &Tuple) -> Result<()> {
        self.agility.clear(&self.primary_key_key(primary_key)).await
    }

    pub async fn primary_key_get(&self, primary_key: &Tuple) -> Result<Option<(String, u32)>> {
        match self.agility.get(&self.primary_key_key(primary_key)).await? {
            Some(raw) => {
                let tuple = Tuple::unpack(&raw)?;
                Ok(Some((
                    tuple.get_str(0)?.to_string(),
                    tuple.get_int(1)? as u32,
                )))
            }
            None => Ok(None),
        }
    }
}

/// Append-only writer for one virtual file. Full blocks are flushed as they
/// fill; the file reference (with the final length) is written at close.
pub struct KvIndexOutput {
    directory: Arc<KvDirectory>,
    name: String,
    id: u64,
    buffer: Vec<u8>,
    next_block: u64,
    length: u64,
}

impl KvIndexOutput {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes_written(&self) -> u64 {
        self.length
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.length += data.len() as u64;
        self.buffer.extend_from_slice(data);
        let block_size = self.directory.block_size;
        while self.buffer.len() >= block_size {
            let rest = self.buffer.split_off(block_size);
            let block = std::mem::replace(&mut self.buffer, rest);
            self.directory
                .write_block(self.id, self.next_block, &block)
                .await?;
            self.next_block += 1;
        }
        Ok(())
    }

    /// Finalize the file: flush the trailing partial block and publish the
    /// file reference.
    pub async fn close(mut self) -> Result<FileReference> {
        if !self.buffer.is_empty() {
            let block = std::mem::take(&mut self.buffer);
            self.directory
                .write_block(self.id, self.next_block, &block)
                .await?;
        }
        let reference = FileReference {
            id: self.id,
            length: self.length,
            block_size: self.directory.block_size as u32,
            compressed: self.directory.compression,
        };
        self.directory
            .agility
            .set(&self.directory.file_ref_key(&self.name), &reference.encode())
            .await?;
        self.directory
            .file_refs
            .write()
            .insert(self.name.clone(), reference.clone());
        Ok(reference)
    }
}

/// Reader over one virtual file, or a slice of it. Stateless and thread-safe:
/// every read names its own offset, and slices clone cursor state instead of
/// sharing it.
#[derive(Clone)]
pub struct KvIndexInput {
    directory: Arc<KvDirectory>,
    name: String,
    reference: Arc<LazyHandle<FileReference>>,
    /// `(offset, length)` when this input is a slice of the file.
    window: Option<(u64, u64)>,
}

impl KvIndexInput {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn len(&self) -> Result<u64> {
        match self.window {
            Some((_, len)) => Ok(len),
            None => Ok(self.reference.get().await?.length),
        }
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// A sub-slice view sharing the lazily resolved file reference.
    pub async fn slice(&self, offset: u64, length: u64) -> Result<KvIndexInput> {
        let base_len = self.len().await?;
        if offset + length > base_len {
            return Err(Error::UnexpectedEof(format!(
                "slice {offset}+{length} beyond end of {} (len {base_len})",
                self.name
            )));
        }
        let base_offset = self.window.map(|(o, _)| o).unwrap_or(0);
        Ok(KvIndexInput {
            directory: Arc::clone(&self.directory),
            name: self.name.clone(),
            reference: Arc::clone(&self.reference),
            window: Some((base_offset + offset, length)),
        })
    }

    /// Read `length` bytes starting at `offset` within this input.
    pub async fn read_bytes(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let reference = self.reference.get().await?;
        let (base_offset, window_len) = match self.window {
            Some((o, l)) => (o, l),
            None => (0, reference.length),
        };
        if offset + length > window_len {
            return Err(Error::UnexpectedEof(format!(
                "read {offset}+{length} beyond end of {} (len {window_len})",
                self.name
            )));
        }

        let block_size = reference.block_size as u64;
        let mut out = Vec::with_capacity(length as usize);
        let mut position = base_offset + offset;
        let end = base_offset + offset + length;
        while position < end {
            let block_no = position / block_size;
            let within = (position % block_size) as usize;
            let block = self.directory.read_block(&reference, block_no).await?;
            let take = ((end - position) as usize).min(block.len() - within);
            out.extend_from_slice(&block[within..within + take]);
            position += take as u64;
        }
        Ok(out)
    }

    /// The whole file (or slice) in one call.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let len = self.len().await?;
        self.read_bytes(0, len).await
    }
}
