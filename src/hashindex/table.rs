//! Local Hash Table
//!
//! The top component of the index: directory, buckets, null bucket and the
//! metadata page behind one get/put/remove API.
//!
//! ## Responsibilities
//! - Create and open the four page files of a table
//! - Route keys to buckets and keep the record count
//! - Reject oversized keys and entries before anything is written
//! - Bracket every mutation in a component of the caller's atomic operation
//!
//! Bucket split and directory growth live in `split.rs`, merges in
//! `merge.rs`, hash-order walks in `navigation.rs`.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::atomic::{self, AtomicOperation};
use crate::codec::{BinarySerializer, HashFunction};
use crate::config::Config;
use crate::error::{PageHashError, Result};
use crate::page::{DurablePage, FileId, FilePageCache, PageCache};

use super::bucket::{self, HashBucket, UpdateResult};
use super::metadata::MetadataPage;
use super::null_bucket::NullBucket;
use super::path::{BucketPath, PathSegment};
use super::{
    bucket_pointer, HashTableDirectory, NodePointer, BUCKET_FILE_EXTENSION,
    DIRECTORY_FILE_EXTENSION, HASH_CODE_SIZE, LEVEL_MASK, MAX_LEVEL_DEPTH, MAX_LEVEL_SIZE,
    METADATA_FILE_EXTENSION, NULL_BUCKET_FILE_EXTENSION,
};

/// Decision returned by a put validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation<V> {
    /// Leave the table untouched; the put reports `false`
    Ignore,

    /// Store this value instead of the one passed to the put
    Store(V),
}

/// Callback consulted by `validated_put` with (key, previous value, new value)
pub(super) type Validator<'v, K, V> =
    dyn FnMut(Option<&K>, Option<&V>, &V) -> Result<Validation<V>> + 'v;

/// Shape of a table, reported by [`LocalHashTable::check_invariants`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Entries under non-null keys
    pub entries: u64,

    /// Whether the null key holds a value
    pub null_entry: bool,

    /// Buckets reachable from the directory
    pub buckets: u64,

    pub max_bucket_depth: u8,

    /// Allocated directory nodes, root included
    pub directory_nodes: u32,

    /// Node slots in the directory file, free ones included
    pub directory_slots: u32,
}

/// Durable extendible hash table.
///
/// ## Concurrency:
/// - `state_lock`: readers (get, navigation, size) share it, mutations
///   hold it exclusively for their whole duration
/// - pages are locked one at a time through cache guards, except during
///   split and merge which hold the two buckets involved
///
/// Iteration helpers return entries in hash-code order, not key order.
pub struct LocalHashTable<K, V, C: PageCache = FilePageCache> {
    name: String,

    pub(super) cache: Arc<C>,

    pub(super) key_serializer: Arc<dyn BinarySerializer<K>>,

    pub(super) value_serializer: Arc<dyn BinarySerializer<V>>,

    pub(super) hash_function: Arc<dyn HashFunction<K>>,

    max_key_size: usize,

    null_key_supported: bool,

    pub(super) merge_threshold: f64,

    pub(super) directory: HashTableDirectory<C>,

    metadata_file: FileId,

    pub(super) bucket_file: FileId,

    null_bucket_file: FileId,

    pub(super) state_lock: RwLock<()>,
}

impl<K, V, C> LocalHashTable<K, V, C>
where
    K: Ord + Clone,
    C: PageCache,
{
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a table named `name`: 256 empty buckets of depth 8 behind a
    /// root node.
    pub fn create(
        name: &str,
        cache: Arc<C>,
        config: &Config,
        key_serializer: Arc<dyn BinarySerializer<K>>,
        value_serializer: Arc<dyn BinarySerializer<V>>,
        hash_function: Arc<dyn HashFunction<K>>,
        op: &dyn AtomicOperation,
    ) -> Result<Self> {
        config.validate()?;

        atomic::in_component(op, name, || {
            // Step 1: metadata page with the codec ids
            let metadata_file = cache.add_file(&format!("{name}{METADATA_FILE_EXTENSION}"))?;
            {
                let mut page = cache.add_page(metadata_file)?;
                MetadataPage::new(&mut *page).init(key_serializer.id(), value_serializer.id());
            }

            // Step 2: bucket, null bucket and directory files
            let bucket_file = cache.add_file(&format!("{name}{BUCKET_FILE_EXTENSION}"))?;
            let null_bucket_file =
                cache.add_file(&format!("{name}{NULL_BUCKET_FILE_EXTENSION}"))?;
            let directory = HashTableDirectory::create(
                Arc::clone(&cache),
                &format!("{name}{DIRECTORY_FILE_EXTENSION}"),
            )?;

            let table = Self {
                name: name.to_string(),
                cache,
                key_serializer,
                value_serializer,
                hash_function,
                max_key_size: config.max_key_size,
                null_key_supported: config.null_key_supported,
                merge_threshold: config.merge_threshold,
                directory,
                metadata_file,
                bucket_file,
                null_bucket_file,
                state_lock: RwLock::new(()),
            };

            // Step 3: root node and its buckets
            table.init_hash_tree_state()?;

            tracing::debug!(name, "hash table created");
            Ok(table)
        })
    }

    /// Open a table created earlier in the same data directory
    pub fn open(
        name: &str,
        cache: Arc<C>,
        config: &Config,
        key_serializer: Arc<dyn BinarySerializer<K>>,
        value_serializer: Arc<dyn BinarySerializer<V>>,
        hash_function: Arc<dyn HashFunction<K>>,
    ) -> Result<Self> {
        config.validate()?;

        let metadata_file = cache.open_file(&format!("{name}{METADATA_FILE_EXTENSION}"))?;
        let (key_id, value_id) = {
            let page = cache.load_for_read(metadata_file, 0)?;
            let metadata = MetadataPage::new(&*page);
            (metadata.key_serializer_id(), metadata.value_serializer_id())
        };
        if key_id != key_serializer.id() || value_id != value_serializer.id() {
            return Err(PageHashError::Serialization(format!(
                "table {name} was created with serializers ({key_id}, {value_id}), opened with ({}, {})",
                key_serializer.id(),
                value_serializer.id()
            )));
        }

        let bucket_file = cache.open_file(&format!("{name}{BUCKET_FILE_EXTENSION}"))?;
        let null_bucket_file = cache.open_file(&format!("{name}{NULL_BUCKET_FILE_EXTENSION}"))?;
        let directory = HashTableDirectory::open(
            Arc::clone(&cache),
            &format!("{name}{DIRECTORY_FILE_EXTENSION}"),
        )?;

        tracing::debug!(name, "hash table opened");
        Ok(Self {
            name: name.to_string(),
            cache,
            key_serializer,
            value_serializer,
            hash_function,
            max_key_size: config.max_key_size,
            null_key_supported: config.null_key_supported,
            merge_threshold: config.merge_threshold,
            directory,
            metadata_file,
            bucket_file,
            null_bucket_file,
            state_lock: RwLock::new(()),
        })
    }

    fn init_hash_tree_state(&self) -> Result<()> {
        self.cache.truncate(self.bucket_file)?;

        let mut root = vec![0i64; MAX_LEVEL_SIZE];
        for word in root.iter_mut() {
            let mut page = self.cache.add_page(self.bucket_file)?;
            let index = page.index();
            self.bucket(&mut *page).init(MAX_LEVEL_DEPTH);
            *word = bucket_pointer(index);
        }

        let root_node = self.directory.add_new_node(0, 0, MAX_LEVEL_DEPTH, &root)?;
        if root_node != 0 {
            return Err(PageHashError::corrupted(format!(
                "root of table {} allocated as node {}",
                self.name, root_node
            )));
        }

        self.write_metadata(|metadata| {
            metadata.set_free_bucket_head(0);
            metadata.reset_buckets_per_depth();
            metadata.set_buckets_at_depth(MAX_LEVEL_DEPTH, MAX_LEVEL_SIZE as i64);
        })
    }

    /// Remove every entry and shrink back to the initial 256 buckets
    pub fn clear(&self, op: &dyn AtomicOperation) -> Result<()> {
        let _guard = self.state_lock.write();

        atomic::in_component(op, &self.name, || {
            self.cache.truncate(self.null_bucket_file)?;
            self.directory.clear()?;
            self.write_metadata(|metadata| metadata.set_records_count(0))?;
            self.init_hash_tree_state()?;

            tracing::debug!(name = %self.name, "hash table cleared");
            Ok(())
        })
    }

    /// Write every dirty page of the table back and force it to disk
    pub fn flush(&self) -> Result<()> {
        let _guard = self.state_lock.read();

        self.cache.flush(self.metadata_file)?;
        self.directory.flush()?;
        self.cache.flush(self.bucket_file)?;
        self.cache.flush(self.null_bucket_file)
    }

    pub fn close(self) -> Result<()> {
        let Self {
            name,
            cache,
            directory,
            metadata_file,
            bucket_file,
            null_bucket_file,
            ..
        } = self;

        directory.close(true)?;
        cache.close_file(bucket_file, true)?;
        cache.close_file(null_bucket_file, true)?;
        cache.close_file(metadata_file, true)?;

        tracing::debug!(name = %name, "hash table closed");
        Ok(())
    }

    /// Close the table and remove its files
    pub fn delete(self) -> Result<()> {
        let Self {
            name,
            cache,
            directory,
            metadata_file,
            bucket_file,
            null_bucket_file,
            ..
        } = self;

        directory.delete()?;
        cache.delete_file(bucket_file)?;
        cache.delete_file(null_bucket_file)?;
        cache.delete_file(metadata_file)?;

        tracing::debug!(name = %name, "hash table deleted");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_null_key_supported(&self) -> bool {
        self.null_key_supported
    }

    // =========================================================================
    // Page Views
    // =========================================================================

    pub(super) fn bucket<P>(&self, page: P) -> HashBucket<'_, P, K, V>
    where
        P: Deref<Target = DurablePage>,
    {
        HashBucket::new(page, &*self.key_serializer, &*self.value_serializer)
    }

    pub(super) fn read_metadata<R>(
        &self,
        f: impl FnOnce(&MetadataPage<&DurablePage>) -> R,
    ) -> Result<R> {
        let page = self.cache.load_for_read(self.metadata_file, 0)?;
        Ok(f(&MetadataPage::new(&*page)))
    }

    pub(super) fn write_metadata<R>(
        &self,
        f: impl FnOnce(&mut MetadataPage<&mut DurablePage>) -> R,
    ) -> Result<R> {
        let mut page = self.cache.load_for_write(self.metadata_file, 0)?;
        Ok(f(&mut MetadataPage::new(&mut *page)))
    }

    fn change_size(&self, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        self.write_metadata(|metadata| {
            let count = metadata.records_count();
            metadata.set_records_count(count + delta);
        })
    }

    /// Persisted record count, null key included
    pub fn size(&self) -> Result<u64> {
        let _guard = self.state_lock.read();
        let count = self.read_metadata(|metadata| metadata.records_count())?;
        if count < 0 {
            return Err(PageHashError::corrupted(format!(
                "table {} has negative record count {}",
                self.name, count
            )));
        }
        Ok(count as u64)
    }

    // =========================================================================
    // Directory Walk
    // =========================================================================

    /// Walk from the root to the slot holding the bucket of `hash_code`
    pub fn get_bucket(&self, hash_code: u64) -> Result<BucketPath> {
        let mut path = BucketPath::new();
        let mut node = 0u32;
        let mut offset = 0usize;
        let mut local = self.directory.get_node_local_depth(0)?;
        let mut global = local;

        loop {
            if local == 0 || local > MAX_LEVEL_DEPTH || global > HASH_CODE_SIZE {
                return Err(PageHashError::corrupted(format!(
                    "node {} of table {} has local depth {} at global depth {}",
                    node, self.name, local, global
                )));
            }

            let item = (hash_code >> (HASH_CODE_SIZE - global)) as usize
                & (LEVEL_MASK >> (MAX_LEVEL_DEPTH - local));
            path.push(PathSegment {
                node_index: node,
                hash_map_offset: offset,
                item_index: item,
                local_depth: local,
                global_depth: global,
            });

            match self.directory.get_pointer(node, offset + item)? {
                NodePointer::Bucket(_) => return Ok(path),
                NodePointer::Child {
                    node: child,
                    offset: child_offset,
                } => {
                    node = child;
                    offset = child_offset as usize;
                    local = self.directory.get_node_local_depth(child)?;
                    global += local;
                }
            }
        }
    }

    /// Bucket page referenced by the leaf slot of `path`
    pub(super) fn bucket_page(&self, path: &BucketPath) -> Result<u64> {
        let leaf = path.leaf()?;
        match self.directory.get_pointer(leaf.node_index, leaf.slot())? {
            NodePointer::Bucket(page) => Ok(page),
            NodePointer::Child { node, .. } => Err(PageHashError::corrupted(format!(
                "path leaf {}:{} points at node {} instead of a bucket",
                leaf.node_index,
                leaf.slot(),
                node
            ))),
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    fn check_null_key(&self) -> Result<()> {
        if !self.null_key_supported {
            return Err(PageHashError::NullKeyNotSupported(self.name.clone()));
        }
        Ok(())
    }

    fn check_key_size(&self, key: &K) -> Result<()> {
        let size = self.key_serializer.object_size(key);
        if size > self.max_key_size {
            return Err(PageHashError::KeyTooLarge {
                size,
                max: self.max_key_size,
            });
        }
        Ok(())
    }

    fn check_entry_size(&self, key: &K, value: &V) -> Result<()> {
        let size = bucket::entry_footprint(
            self.key_serializer.object_size(key),
            self.value_serializer.object_size(value),
        );
        let capacity = bucket::bucket_capacity(self.cache.page_size());
        if size > capacity {
            return Err(PageHashError::EntryTooLarge { size, capacity });
        }
        Ok(())
    }

    fn check_null_value_size(&self, value: &V) -> Result<()> {
        let size = self.value_serializer.object_size(value);
        let capacity = NullBucket::<&DurablePage, V>::capacity_for(self.cache.page_size());
        if size > capacity {
            return Err(PageHashError::EntryTooLarge { size, capacity });
        }
        Ok(())
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Value stored under `key`; `None` addresses the null key
    pub fn get(&self, key: Option<&K>) -> Result<Option<V>> {
        let _guard = self.state_lock.read();

        let Some(key) = key else {
            return self.get_null();
        };
        let key = self.key_serializer.preprocess(key);
        let hash_code = self.hash_function.hash_code(&key);

        let path = self.get_bucket(hash_code)?;
        let page = self.bucket_page(&path)?;
        let guard = self.cache.load_for_read(self.bucket_file, page)?;
        self.bucket(&*guard).find(hash_code, &key)
    }

    fn get_null(&self) -> Result<Option<V>> {
        self.check_null_key()?;
        if self.cache.filled_up_to(self.null_bucket_file)? == 0 {
            return Ok(None);
        }
        let page = self.cache.load_for_read(self.null_bucket_file, 0)?;
        NullBucket::new(&*page, &*self.value_serializer).value()
    }

    // =========================================================================
    // Put
    // =========================================================================

    /// Insert or overwrite the value of `key`
    pub fn put(&self, op: &dyn AtomicOperation, key: Option<&K>, value: V) -> Result<()> {
        self.do_put(op, key, value, None).map(|_| ())
    }

    /// Put guarded by `validator`, which sees the previous and the new value
    /// and may veto the write or substitute the stored value. Returns
    /// whether anything was written.
    pub fn validated_put<F>(
        &self,
        op: &dyn AtomicOperation,
        key: Option<&K>,
        value: V,
        mut validator: F,
    ) -> Result<bool>
    where
        F: FnMut(Option<&K>, Option<&V>, &V) -> Result<Validation<V>>,
    {
        let validator: &mut Validator<'_, K, V> = &mut validator;
        self.do_put(op, key, value, Some(validator))
    }

    fn do_put(
        &self,
        op: &dyn AtomicOperation,
        key: Option<&K>,
        value: V,
        validator: Option<&mut Validator<'_, K, V>>,
    ) -> Result<bool> {
        let _guard = self.state_lock.write();

        let key = key.map(|key| self.key_serializer.preprocess(key));
        match key.as_deref() {
            None => {
                self.check_null_key()?;
                self.check_null_value_size(&value)?;
            }
            Some(key) => {
                self.check_key_size(key)?;
                self.check_entry_size(key, &value)?;
            }
        }

        atomic::in_component(op, &self.name, || match key.as_deref() {
            None => self.put_null(value, validator),
            Some(key) => self.put_keyed(key, value, validator),
        })
    }

    fn put_null(&self, value: V, validator: Option<&mut Validator<'_, K, V>>) -> Result<bool> {
        let mut page = if self.cache.filled_up_to(self.null_bucket_file)? == 0 {
            self.cache.add_page(self.null_bucket_file)?
        } else {
            self.cache.load_for_write(self.null_bucket_file, 0)?
        };
        let mut bucket = NullBucket::new(&mut *page, &*self.value_serializer);

        let previous = bucket.value()?;
        let value = match validator {
            None => value,
            Some(validator) => match validator(None, previous.as_ref(), &value)? {
                Validation::Ignore => return Ok(false),
                Validation::Store(value) => value,
            },
        };

        bucket.set_value(&value)?;
        drop(page);

        if previous.is_none() {
            self.change_size(1)?;
        }
        Ok(true)
    }

    fn put_keyed(
        &self,
        key: &K,
        value: V,
        validator: Option<&mut Validator<'_, K, V>>,
    ) -> Result<bool> {
        let hash_code = self.hash_function.hash_code(key);
        let mut validator = validator;
        let mut value = value;
        let mut size_diff = 0i64;

        loop {
            let path = self.get_bucket(hash_code)?;
            let page_index = self.bucket_page(&path)?;
            let mut page = self.cache.load_for_write(self.bucket_file, page_index)?;
            let mut bucket = self.bucket(&mut *page);

            let found = bucket.binary_search(hash_code, key)?;

            // The validator sees the state before the first attempt only
            if let Some(validator) = validator.take() {
                let previous = match found {
                    Ok(index) => Some(bucket.value(index)?),
                    Err(_) => None,
                };
                match validator(Some(key), previous.as_ref(), &value)? {
                    Validation::Ignore => return Ok(false),
                    Validation::Store(replacement) => {
                        self.check_entry_size(key, &replacement)?;
                        value = replacement;
                    }
                }
            }

            if let Ok(index) = found {
                match bucket.update_entry(index, &value)? {
                    UpdateResult::Unchanged | UpdateResult::Updated => {
                        drop(page);
                        self.change_size(size_diff)?;
                        return Ok(true);
                    }
                    UpdateResult::SizeMismatch => {
                        bucket.delete_entry(index)?;
                        size_diff -= 1;
                    }
                }
            }

            if bucket.add_entry(hash_code, key, &value)? {
                drop(page);
                self.change_size(size_diff + 1)?;
                return Ok(true);
            }

            // Bucket is full: split it, fix the directory, then retry
            let split = self.split_bucket(&mut bucket)?;
            drop(page);
            self.update_directory_after_split(&path, &split)?;
        }
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Remove `key`, returning its value if it was present
    pub fn remove(&self, op: &dyn AtomicOperation, key: Option<&K>) -> Result<Option<V>> {
        let _guard = self.state_lock.write();

        let key = key.map(|key| self.key_serializer.preprocess(key));
        if key.is_none() {
            self.check_null_key()?;
        }

        atomic::in_component(op, &self.name, || match key.as_deref() {
            None => self.remove_null(),
            Some(key) => self.remove_keyed(key),
        })
    }

    fn remove_null(&self) -> Result<Option<V>> {
        if self.cache.filled_up_to(self.null_bucket_file)? == 0 {
            return Ok(None);
        }

        let mut page = self.cache.load_for_write(self.null_bucket_file, 0)?;
        let mut bucket = NullBucket::new(&mut *page, &*self.value_serializer);
        let previous = bucket.value()?;
        if previous.is_some() {
            bucket.remove_value();
            drop(page);
            self.change_size(-1)?;
        }
        Ok(previous)
    }

    fn remove_keyed(&self, key: &K) -> Result<Option<V>> {
        let hash_code = self.hash_function.hash_code(key);
        let path = self.get_bucket(hash_code)?;
        let page_index = self.bucket_page(&path)?;

        let removed = {
            let mut page = self.cache.load_for_write(self.bucket_file, page_index)?;
            let mut bucket = self.bucket(&mut *page);
            let Ok(index) = bucket.binary_search(hash_code, key)? else {
                return Ok(None);
            };

            let removed = bucket.delete_entry(index)?;
            self.merge_buckets_after_deletion(&path, &mut bucket)?;
            removed
        };

        self.change_size(-1)?;
        self.merge_nodes_after_deletion(&path)?;
        Ok(Some(removed.value))
    }

    // =========================================================================
    // Consistency Check
    // =========================================================================

    /// Walk every bucket in hash order and verify depths, ordering and the
    /// record count
    pub fn check_invariants(&self) -> Result<TableStats> {
        let _guard = self.state_lock.read();
        let mut stats = TableStats::default();
        let mut previous_hash: Option<u64> = None;

        let mut cursor = Some(self.get_bucket(0)?);
        while let Some(path) = cursor {
            let leaf = path.leaf()?;
            let page = self.bucket_page(&path)?;
            let guard = self.cache.load_for_read(self.bucket_file, page)?;
            let bucket = self.bucket(&*guard);

            let depth = bucket.depth();
            if depth < MAX_LEVEL_DEPTH || depth > leaf.global_depth {
                return Err(PageHashError::corrupted(format!(
                    "bucket {} has depth {} under a node of global depth {}",
                    page, depth, leaf.global_depth
                )));
            }

            let prefix = path.prefix() >> (leaf.global_depth - depth);
            for index in 0..bucket.size() {
                let hash_code = bucket.hash_code(index)?;
                if super::hash_prefix(hash_code, depth) != prefix {
                    return Err(PageHashError::corrupted(format!(
                        "entry {} of bucket {} with hash {:#018x} does not share prefix {:#x}/{}",
                        index, page, hash_code, prefix, depth
                    )));
                }
                if index > 0 && bucket.compare_at(index - 1, hash_code, &bucket.key(index)?)?
                    != std::cmp::Ordering::Less
                {
                    return Err(PageHashError::corrupted(format!(
                        "bucket {page} is not sorted at entry {index}"
                    )));
                }
                if previous_hash.is_some_and(|previous| previous > hash_code) {
                    return Err(PageHashError::corrupted(format!(
                        "bucket {page} breaks hash order across buckets"
                    )));
                }
                previous_hash = Some(hash_code);
            }

            stats.entries += bucket.size() as u64;
            stats.buckets += 1;
            stats.max_bucket_depth = stats.max_bucket_depth.max(depth);

            drop(guard);
            cursor = self.next_bucket_to_find(&path, depth)?;
        }

        stats.null_entry = self.null_key_supported && self.get_null()?.is_some();

        let records = self.read_metadata(|metadata| metadata.records_count())?;
        let expected = stats.entries + u64::from(stats.null_entry);
        if records < 0 || records as u64 != expected {
            return Err(PageHashError::corrupted(format!(
                "table {} records {} entries but holds {}",
                self.name, records, expected
            )));
        }

        stats.directory_slots = self.directory.tree_size()?;
        for node in 0..stats.directory_slots {
            if self.directory.is_allocated(node)? {
                stats.directory_nodes += 1;
            }
        }

        tracing::debug!(name = %self.name, ?stats, "table invariants hold");
        Ok(stats)
    }
}

impl<K, V, C: PageCache> std::fmt::Debug for LocalHashTable<K, V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHashTable")
            .field("name", &self.name)
            .field("null_key_supported", &self.null_key_supported)
            .field("max_key_size", &self.max_key_size)
            .finish()
    }
}
