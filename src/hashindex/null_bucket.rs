//! Null-Key Bucket
//!
//! One page holding the optional value stored under the null key.
//!
//! ```text
//! ┌──────────────┬─────────────┬──────────────────┐
//! │ Page Hdr (16)│ Present (1) │ Value (var)      │
//! └──────────────┴─────────────┴──────────────────┘
//! ```

use std::ops::{Deref, DerefMut};

use crate::codec::BinarySerializer;
use crate::error::{PageHashError, Result};
use crate::page::{DurablePage, PAGE_HEADER_SIZE};

const PRESENT_OFFSET: usize = PAGE_HEADER_SIZE;
const VALUE_OFFSET: usize = PRESENT_OFFSET + 1;

pub(crate) struct NullBucket<'a, P, V> {
    page: P,
    values: &'a dyn BinarySerializer<V>,
}

impl<'a, P, V> NullBucket<'a, P, V>
where
    P: Deref<Target = DurablePage>,
{
    pub(crate) fn new(page: P, values: &'a dyn BinarySerializer<V>) -> Self {
        Self { page, values }
    }

    /// Largest value the page can hold
    pub(crate) fn capacity_for(page_size: usize) -> usize {
        page_size - VALUE_OFFSET
    }

    pub(crate) fn value(&self) -> Result<Option<V>> {
        if self.page.get_u8(PRESENT_OFFSET) == 0 {
            return Ok(None);
        }
        let value = self.values.deserialize(&self.page.bytes()[VALUE_OFFSET..])?;
        Ok(Some(value))
    }
}

impl<'a, P, V> NullBucket<'a, P, V>
where
    P: DerefMut<Target = DurablePage>,
{
    pub(crate) fn set_value(&mut self, value: &V) -> Result<()> {
        let size = self.values.object_size(value);
        let capacity = Self::capacity_for(self.page.page_size());
        if size > capacity {
            return Err(PageHashError::EntryTooLarge { size, capacity });
        }

        let bytes = self.page.bytes_mut();
        self.values
            .serialize(value, &mut bytes[VALUE_OFFSET..VALUE_OFFSET + size])?;
        self.page.set_u8(PRESENT_OFFSET, 1);
        Ok(())
    }

    pub(crate) fn remove_value(&mut self) {
        self.page.set_u8(PRESENT_OFFSET, 0);
    }
}
