//! Table Metadata Page
//!
//! ```text
//! ┌──────────────┬─────────────┬────────┬──────────┬──────────────┬─────────────────────┐
//! │ Page Hdr (16)│ Records (8) │ Key(1) │ Value(1) │ Free Head (8)│ Buckets/Depth 65x8  │
//! └──────────────┴─────────────┴────────┴──────────┴──────────────┴─────────────────────┘
//! ```
//! Key and Value hold the serializer ids the table was created with. Free
//! Head is the bucket pointer word of the first reusable bucket page
//! (0 = none).

use std::ops::{Deref, DerefMut};

use crate::page::{DurablePage, PAGE_HEADER_SIZE};

use super::HASH_CODE_SIZE;

const RECORDS_COUNT_OFFSET: usize = PAGE_HEADER_SIZE;
const KEY_SERIALIZER_OFFSET: usize = RECORDS_COUNT_OFFSET + 8;
const VALUE_SERIALIZER_OFFSET: usize = KEY_SERIALIZER_OFFSET + 1;
const FREE_BUCKET_HEAD_OFFSET: usize = VALUE_SERIALIZER_OFFSET + 1;
const BUCKETS_PER_DEPTH_OFFSET: usize = FREE_BUCKET_HEAD_OFFSET + 8;

pub(crate) struct MetadataPage<P> {
    page: P,
}

impl<P: Deref<Target = DurablePage>> MetadataPage<P> {
    pub(crate) fn new(page: P) -> Self {
        Self { page }
    }

    pub(crate) fn records_count(&self) -> i64 {
        self.page.get_i64(RECORDS_COUNT_OFFSET)
    }

    pub(crate) fn key_serializer_id(&self) -> u8 {
        self.page.get_u8(KEY_SERIALIZER_OFFSET)
    }

    pub(crate) fn value_serializer_id(&self) -> u8 {
        self.page.get_u8(VALUE_SERIALIZER_OFFSET)
    }

    pub(crate) fn free_bucket_head(&self) -> i64 {
        self.page.get_i64(FREE_BUCKET_HEAD_OFFSET)
    }

    pub(crate) fn buckets_at_depth(&self, depth: u8) -> i64 {
        self.page
            .get_i64(BUCKETS_PER_DEPTH_OFFSET + depth as usize * 8)
    }
}

impl<P: DerefMut<Target = DurablePage>> MetadataPage<P> {
    /// Empty table state for the given serializers
    pub(crate) fn init(&mut self, key_serializer_id: u8, value_serializer_id: u8) {
        self.page.clear_body();
        self.page.set_u8(KEY_SERIALIZER_OFFSET, key_serializer_id);
        self.page.set_u8(VALUE_SERIALIZER_OFFSET, value_serializer_id);
    }

    pub(crate) fn set_records_count(&mut self, count: i64) {
        self.page.set_i64(RECORDS_COUNT_OFFSET, count);
    }

    pub(crate) fn set_free_bucket_head(&mut self, pointer: i64) {
        self.page.set_i64(FREE_BUCKET_HEAD_OFFSET, pointer);
    }

    pub(crate) fn set_buckets_at_depth(&mut self, depth: u8, count: i64) {
        self.page
            .set_i64(BUCKETS_PER_DEPTH_OFFSET + depth as usize * 8, count);
    }

    pub(crate) fn add_buckets_at_depth(&mut self, depth: u8, delta: i64) {
        let count = self.buckets_at_depth(depth);
        self.set_buckets_at_depth(depth, count + delta);
    }

    pub(crate) fn reset_buckets_per_depth(&mut self) {
        for depth in 0..=HASH_CODE_SIZE {
            self.set_buckets_at_depth(depth, 0);
        }
    }
}
