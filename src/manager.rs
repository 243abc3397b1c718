use std::{mem, ptr, ptr::NonNull};

use log::trace;

use crate::{
    block::{self, BlockHeader, BlockIter, BLOCK_HEADER_SIZE},
    glue::{GlueNode, Link},
    kernel,
    page::{self, DataPage, PageIter},
    registry::{self, RecordDescriptor, RegisterError, RegistryPage},
    utils::align,
};

/// The memory manager: page size plus the head of the registry spine.
///
/// Construct one with [`StructAlloc::new`] before anything else; every
/// operation goes through it. There is no destructor, the process exit
/// tears everything down.
///
/// The manager hands out arrays of *registered* elements only. Callers
/// first declare a named record with a fixed element size, then request
/// `units` elements of it at a time:
///
/// ```text
///  register(name, size) ---> registry spine grows
///  xcalloc(name, units) ---> lookup -> largest free block -> split -> payload
///  xfree(payload)       ---> header -> absorb slack -> coalesce -> maybe unmap
/// ```
pub struct StructAlloc {
    page_size: usize,
    spine: Link<RegistryPage>,
}

impl StructAlloc {
    /// Reads the OS page size and sets up an empty registry.
    pub fn new() -> Self {
        let page_size = kernel::page_size();

        debug_assert!(page::payload_capacity(page_size) % mem::align_of::<BlockHeader>() == 0);

        Self {
            page_size,
            spine: None,
        }
    }

    /// Virtual memory page size the manager was initialized with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Largest request one page can satisfy: the payload bytes left of a
    /// fresh page once the page header is in place.
    pub fn payload_capacity(&self) -> usize {
        page::payload_capacity(self.page_size)
    }

    /// Declares a record: a name bound to a fixed element size.
    ///
    /// The name is copied with bounded length ([`MAX_STRUCT_NAME_SIZE`]).
    /// Registration fails when the size cannot fit a page or the name is
    /// taken; records are never unregistered.
    ///
    /// [`MAX_STRUCT_NAME_SIZE`]: crate::registry::MAX_STRUCT_NAME_SIZE
    pub fn register(&mut self, name: &str, size: usize) -> Result<(), RegisterError> {
        unsafe { registry::register(&mut self.spine, self.page_size, name, size) }
    }

    /// Allocates a zero-filled array of `units` elements of the named
    /// record and returns the payload pointer.
    ///
    /// Returns null when the name is not registered, when the request
    /// exceeds one page's payload capacity, or when the OS refuses a page.
    pub fn xcalloc(&mut self, name: &str, units: u32) -> *mut u8 {
        unsafe {
            let Some(record) = registry::lookup(self.spine, name) else {
                return ptr::null_mut();
            };

            let Some(requested) = (units as usize).checked_mul(record.as_ref().size) else {
                return ptr::null_mut();
            };
            if requested > self.payload_capacity() {
                return ptr::null_mut();
            }

            let Some(block) = self.reserve_block(record, requested as u32) else {
                return ptr::null_mut();
            };

            // zero the payload bytes the block accounts for
            let payload = BlockHeader::payload(block);
            ptr::write_bytes(payload.as_ptr(), 0, block.as_ref().data_block_size as usize);

            payload.as_ptr()
        }
    }

    /// Gives a block back and lets the page shrink out of existence when
    /// nothing of it is in use anymore.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer previously returned by
    /// [`StructAlloc::xcalloc`] on this manager and not freed since.
    pub unsafe fn xfree(&mut self, payload: *mut u8) {
        unsafe {
            let block = BlockHeader::from_payload(payload);

            debug_assert!(
                !block.as_ref().is_free,
                "freed a block that is already free"
            );

            self.release_block(block);
        }
    }

    /// Picks the record's largest free block, or extends the record with a
    /// fresh page when none fits, then splits the candidate down to the
    /// request.
    unsafe fn reserve_block(
        &mut self,
        record: NonNull<RecordDescriptor>,
        requested: u32,
    ) -> Option<NonNull<BlockHeader>> {
        unsafe {
            let largest = record
                .as_ref()
                .free_blocks
                .head()
                .map(|node| BlockHeader::from_glue(node));

            match largest {
                Some(block) if block.as_ref().data_block_size >= requested => {
                    split_free_block(record, block, requested).then_some(block)
                }
                _ => {
                    let page = self.map_data_page(record)?;
                    let first = DataPage::first_block(page);

                    split_free_block(record, first, requested).then_some(first)
                }
            }
        }
    }

    /// Maps one fresh data page for `record` and prepends it to the
    /// record's page list. Its first block spans the full capacity.
    unsafe fn map_data_page(
        &mut self,
        record: NonNull<RecordDescriptor>,
    ) -> Option<NonNull<DataPage>> {
        let base = kernel::request_vm_pages(1, self.page_size)?;

        unsafe {
            let page_ptr = DataPage::format(base, record, self.page_size);
            page::attach(record, page_ptr);

            trace!(
                "mapped data page {:p} for record {:?}",
                page_ptr.as_ptr(),
                record.as_ref().name()
            );

            Some(page_ptr)
        }
    }

    /// The free engine: reabsorbs invisible slack, coalesces with free
    /// neighbours eagerly, and returns the hosting page to the OS when it
    /// empties.
    unsafe fn release_block(&mut self, mut block: NonNull<BlockHeader>) {
        unsafe {
            let page_ptr = DataPage::hosting(block);
            let mut record = page_ptr.as_ref().record;

            block.as_mut().is_free = true;

            // hard-fragmentation slack is invisible to the chain; physical
            // addresses are authoritative, sibling metadata is not
            let physical_end = BlockHeader::next_by_size(block).as_ptr().cast::<u8>();
            let slack = match block.as_ref().next {
                Some(next) => next.as_ptr().cast::<u8>().offset_from(physical_end),
                None => DataPage::end(page_ptr, self.page_size).offset_from(physical_end),
            };
            block.as_mut().data_block_size += slack as u32;

            let mut merged = block;

            if let Some(next) = block.as_ref().next {
                if next.as_ref().is_free {
                    record.as_mut().free_blocks.remove(BlockHeader::glue_of(next));
                    block::merge_free_pair(block, next);
                }
            }

            if let Some(prev) = block.as_ref().prev {
                if prev.as_ref().is_free {
                    // the predecessor's chain key is about to grow: unlink it
                    // first, the final merged block is inserted exactly once
                    record.as_mut().free_blocks.remove(BlockHeader::glue_of(prev));
                    block::merge_free_pair(prev, block);
                    merged = prev;
                }
            }

            if DataPage::is_empty(page_ptr) {
                page::detach(record, page_ptr);

                trace!(
                    "released empty data page {:p} of record {:?}",
                    page_ptr.as_ptr(),
                    record.as_ref().name()
                );

                kernel::release_vm_pages(page_ptr.as_ptr().cast(), 1, self.page_size);
                return;
            }

            insert_free_block(record, merged);
        }
    }

    /// Prints every registered record as `name: size`, newest registry
    /// page first.
    pub fn print_registered_records(&self) {
        for record in registry::RecordIter::starting_at(self.spine) {
            unsafe {
                let record = record.as_ref();

                println!("{}: {}", record.name(), record.size);
            }
        }
    }

    /// Prints every data page and block of the named record, or of all
    /// records when `name` is None.
    pub fn print_memory_usage(&self, name: Option<&str>) {
        println!("\nPage Size = {}\n", self.page_size);

        for record_ptr in registry::RecordIter::starting_at(self.spine) {
            unsafe {
                let record = record_ptr.as_ref();

                if let Some(name) = name {
                    if !record.name_matches(name) {
                        continue;
                    }
                }

                println!("{}: {}", record.name(), record.size);

                for (page_number, page_ptr) in
                    PageIter::starting_at(record.first_page).enumerate()
                {
                    println!("\tPage Number: {page_number}");

                    for (index, block) in
                        BlockIter::starting_at(DataPage::first_block(page_ptr)).enumerate()
                    {
                        let header = block.as_ref();
                        let status = if header.is_free { "F R E E D" } else { "ALLOCATED" };
                        let prev = header.prev.map_or(ptr::null_mut(), NonNull::as_ptr);
                        let next = header.next.map_or(ptr::null_mut(), NonNull::as_ptr);

                        println!(
                            "\t\t{:14p}\tBlock: {:5}\tStatus: {}\tBlock Size: {:5}\tOffset: {:5}\tPrev: {:14p}\tNext: {:14p}",
                            block.as_ptr(),
                            index,
                            status,
                            header.data_block_size,
                            header.offset,
                            prev,
                            next,
                        );
                    }
                }
            }
        }
    }

    /// Prints per record the total, free and allocated block counts plus
    /// the application memory usage those allocations amount to.
    pub fn print_block_usage(&self) {
        println!();

        for record_ptr in registry::RecordIter::starting_at(self.spine) {
            unsafe {
                let record = record_ptr.as_ref();

                let mut allocated: usize = 0;
                let mut free: usize = 0;

                for page_ptr in PageIter::starting_at(record.first_page) {
                    for block in BlockIter::starting_at(DataPage::first_block(page_ptr)) {
                        if block.as_ref().is_free {
                            free += 1;
                        } else {
                            allocated += 1;
                        }
                    }
                }

                println!(
                    "{:<20}\tTBC: {:5}\tFBC: {:5}\tABC: {:5}\tAppMemUsage: {:10}",
                    record.name(),
                    allocated + free,
                    free,
                    allocated,
                    allocated * (BLOCK_HEADER_SIZE + record.size),
                );
            }
        }
    }
}

impl Default for StructAlloc {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits free `block` down to `requested` payload bytes.
///
/// The block leaves the free chain, is marked allocated and records the
/// request verbatim. The remainder becomes a new free block when it can
/// host a header plus at least one byte of payload; smaller remainders
/// stay invisible behind the payload until the free engine reabsorbs them.
///
/// A carved header must land pointer-aligned, so the carve point is the
/// requested size rounded up to the header alignment; the padding in
/// between rides behind the payload as invisible slack, just like a
/// hard-fragmentation remainder.
unsafe fn split_free_block(
    mut record: NonNull<RecordDescriptor>,
    mut block: NonNull<BlockHeader>,
    requested: u32,
) -> bool {
    unsafe {
        debug_assert!(block.as_ref().is_free);

        if block.as_ref().data_block_size < requested {
            return false;
        }

        let available = block.as_ref().data_block_size;

        block.as_mut().is_free = false;
        block.as_mut().data_block_size = requested;
        record.as_mut().free_blocks.remove(BlockHeader::glue_of(block));

        // free payloads are multiples of the header alignment, so the
        // carve point never overshoots the available span
        debug_assert!(available as usize % mem::align_of::<BlockHeader>() == 0);
        let carve_offset = align(requested as usize, mem::align_of::<BlockHeader>()) as u32;
        let remaining = available - carve_offset;

        // exact fit, nothing to carve
        if remaining == 0 {
            return true;
        }

        // hard internal fragmentation: no room for a header and a payload
        // byte, the slack stays attached to the allocated block
        if remaining as usize <= BLOCK_HEADER_SIZE {
            return true;
        }

        // soft internal fragmentation or a full split, same surgery either
        // way: carve a free block at the aligned point behind the payload
        let carved = NonNull::new_unchecked(
            block
                .as_ptr()
                .cast::<u8>()
                .add(BLOCK_HEADER_SIZE + carve_offset as usize)
                .cast::<BlockHeader>(),
        );
        ptr::write(
            carved.as_ptr(),
            BlockHeader {
                is_free: true,
                data_block_size: remaining - BLOCK_HEADER_SIZE as u32,
                offset: block.as_ref().offset + BLOCK_HEADER_SIZE as u32 + carve_offset,
                prev: None,
                next: None,
                glue: GlueNode::new(),
            },
        );
        block::bind_after(block, carved);
        insert_free_block(record, carved);

        true
    }
}

/// Threads a free block into its record's priority chain, largest payload
/// first.
unsafe fn insert_free_block(mut record: NonNull<RecordDescriptor>, block: NonNull<BlockHeader>) {
    unsafe {
        debug_assert!(block.as_ref().is_free);

        record.as_mut().free_blocks.priority_insert(
            BlockHeader::glue_of(block),
            block::free_block_cmp,
            BlockHeader::GLUE_OFFSET,
        );
    }
}
