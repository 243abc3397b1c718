use std::{mem, ptr, ptr::NonNull};

use crate::{
    block::{BlockHeader, BLOCK_HEADER_SIZE},
    glue::{GlueNode, Link},
    registry::RecordDescriptor,
};

/// Byte offset of the embedded first block header within a data page.
pub(crate) const FIRST_BLOCK_OFFSET: usize = mem::offset_of!(DataPage, first_block);

/// One OS page owned by exactly one record.
///
/// The page header sits at the page base; the first block header is
/// physically part of it and the arena of `<header, payload>` spans runs
/// from there to the page end.
///
/// ```text
/// page base
/// v
/// +--------+------+------+--------------+~~~~~~~~~~~~~~~~~~~~~~~+
/// | record | prev | next | first block  |  payload ... arena    |
/// +--------+------+------+--------------+~~~~~~~~~~~~~~~~~~~~~~~+
///                                                       page end ^
/// ```
#[repr(C)]
pub(crate) struct DataPage {
    /// The record this page belongs to.
    pub record: NonNull<RecordDescriptor>,
    /// Previous page of the record's page list.
    pub prev: Link<DataPage>,
    /// Next page of the record's page list.
    pub next: Link<DataPage>,
    /// First block of the arena, embedded in the page header.
    pub first_block: BlockHeader,
}

/// Payload bytes a completely free page offers: everything past the first
/// block's header.
pub(crate) fn payload_capacity(page_size: usize) -> usize {
    page_size - FIRST_BLOCK_OFFSET - BLOCK_HEADER_SIZE
}

impl DataPage {
    /// Writes a fresh page header over `base` and returns the page. The
    /// first block spans the full payload capacity and starts out free,
    /// with no intra-page neighbours and an unchained glue node.
    pub(crate) unsafe fn format(
        base: NonNull<u8>,
        record: NonNull<RecordDescriptor>,
        page_size: usize,
    ) -> NonNull<DataPage> {
        let page = base.cast::<DataPage>();

        unsafe {
            ptr::write(
                page.as_ptr(),
                DataPage {
                    record,
                    prev: None,
                    next: None,
                    first_block: BlockHeader {
                        is_free: true,
                        data_block_size: payload_capacity(page_size) as u32,
                        offset: FIRST_BLOCK_OFFSET as u32,
                        prev: None,
                        next: None,
                        glue: GlueNode::new(),
                    },
                },
            );
        }

        page
    }

    /// The embedded first block header.
    pub(crate) unsafe fn first_block(page: NonNull<DataPage>) -> NonNull<BlockHeader> {
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*page.as_ptr()).first_block)) }
    }

    /// Recovers the hosting page from any of its block headers by walking
    /// back the header's recorded byte offset.
    pub(crate) unsafe fn hosting(block: NonNull<BlockHeader>) -> NonNull<DataPage> {
        unsafe {
            let offset = block.as_ref().offset as usize;

            NonNull::new_unchecked(block.as_ptr().cast::<u8>().sub(offset).cast())
        }
    }

    /// First byte past the page.
    pub(crate) unsafe fn end(page: NonNull<DataPage>, page_size: usize) -> *mut u8 {
        unsafe { page.as_ptr().cast::<u8>().add(page_size) }
    }

    /// A page is empty when its first block is free again and alone in the
    /// intra-page chain. Empty pages must not be retained.
    pub(crate) unsafe fn is_empty(page: NonNull<DataPage>) -> bool {
        unsafe {
            let first = &page.as_ref().first_block;

            first.is_free && first.prev.is_none() && first.next.is_none()
        }
    }
}

/// Prepends `page` to its record's data-page list.
pub(crate) unsafe fn attach(mut record: NonNull<RecordDescriptor>, mut page: NonNull<DataPage>) {
    unsafe {
        page.as_mut().prev = None;
        page.as_mut().next = record.as_ref().first_page;

        if let Some(mut old_head) = record.as_ref().first_page {
            old_head.as_mut().prev = Some(page);
        }
        record.as_mut().first_page = Some(page);
    }
}

/// Unlinks `page` from its record's data-page list. Both neighbours are
/// relinked, wherever the page sits in the list.
pub(crate) unsafe fn detach(mut record: NonNull<RecordDescriptor>, page: NonNull<DataPage>) {
    unsafe {
        match page.as_ref().prev {
            Some(mut prev) => prev.as_mut().next = page.as_ref().next,
            None => record.as_mut().first_page = page.as_ref().next,
        }

        if let Some(mut next) = page.as_ref().next {
            next.as_mut().prev = page.as_ref().prev;
        }
    }
}

/// Walks a record's data pages from the head of its page list.
pub(crate) struct PageIter {
    current: Link<DataPage>,
}

impl PageIter {
    pub(crate) fn starting_at(head: Link<DataPage>) -> Self {
        Self { current: head }
    }
}

impl Iterator for PageIter {
    type Item = NonNull<DataPage>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = self.current?;

        unsafe {
            self.current = page.as_ref().next;
        }

        Some(page)
    }
}
