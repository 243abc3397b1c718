use std::{mem, ptr, ptr::NonNull, str};

use log::trace;
use thiserror::Error;

use crate::{
    glue::{GlueList, Link},
    kernel,
    page::DataPage,
};

/// Record names are stored inline in their descriptor, truncated to this
/// many bytes.
pub const MAX_STRUCT_NAME_SIZE: usize = 32;

/// Why a registration was refused.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegisterError {
    /// The element could not be hosted even by one whole fresh page.
    #[error("element size {size} exceeds the OS page size {page_size}")]
    ElementTooLarge { size: usize, page_size: usize },
    /// A descriptor with this name already exists somewhere in the spine.
    #[error("a record named {0:?} is already registered")]
    DuplicateName(String),
    /// The OS refused a page for the registry spine.
    #[error("the OS refused a page for the record registry")]
    OutOfMemory,
}

/// Per-record allocator state: the element size plus the two structures the
/// allocation and free engines work on, the record's data-page list and its
/// free-block priority chain.
///
/// Descriptors live inside registry pages, never on any heap: the allocator
/// must not depend on another allocator for its own bookkeeping.
#[repr(C)]
pub(crate) struct RecordDescriptor {
    name: [u8; MAX_STRUCT_NAME_SIZE],
    /// Fixed element size in bytes.
    pub size: usize,
    /// Head of this record's data-page list.
    pub first_page: Link<DataPage>,
    /// Free blocks of all of this record's pages, ordered by descending
    /// payload size. The head is always the largest.
    pub free_blocks: GlueList,
}

impl RecordDescriptor {
    pub(crate) fn new(name: &str, size: usize) -> Self {
        let mut bytes = [0u8; MAX_STRUCT_NAME_SIZE];
        let len = name.len().min(MAX_STRUCT_NAME_SIZE);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);

        Self {
            name: bytes,
            size,
            first_page: None,
            free_blocks: GlueList::new(),
        }
    }

    /// Bounded comparison, truncating the candidate the same way the
    /// registration copy truncates the stored name.
    pub(crate) fn name_matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_STRUCT_NAME_SIZE);

        self.name[..len] == bytes[..len] && (len == MAX_STRUCT_NAME_SIZE || self.name[len] == 0)
    }

    /// The stored (possibly truncated) record name.
    pub(crate) fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_STRUCT_NAME_SIZE);

        str::from_utf8(&self.name[..end]).unwrap_or("<non-utf8>")
    }
}

/// One page of the registry spine: a small header followed by descriptor
/// slots up to [`RegistryPage::slot_capacity`]. Fresh pages are prepended,
/// so only the spine head can have unused slots.
#[repr(C)]
pub(crate) struct RegistryPage {
    /// Next (older) page of the spine.
    pub next: Link<RegistryPage>,
    /// Occupied slots; always the first `used` of this page.
    pub used: usize,
}

impl RegistryPage {
    /// Descriptors that fit one page alongside the page header.
    pub(crate) fn slot_capacity(page_size: usize) -> usize {
        (page_size - mem::size_of::<RegistryPage>()) / mem::size_of::<RecordDescriptor>()
    }

    /// The `index`-th descriptor slot, right past the page header.
    ///
    /// **SAFETY**: `index` must be below the slot capacity of the page.
    pub(crate) unsafe fn slot(page: NonNull<RegistryPage>, index: usize) -> NonNull<RecordDescriptor> {
        unsafe {
            let first = page.as_ptr().add(1).cast::<RecordDescriptor>();

            NonNull::new_unchecked(first.add(index))
        }
    }
}

/// Places a new descriptor in the spine.
///
/// The name is copied with bounded length; a fresh registry page is
/// prepended when the spine head is full. Registry pages are never given
/// back to the OS.
pub(crate) unsafe fn register(
    spine: &mut Link<RegistryPage>,
    page_size: usize,
    name: &str,
    size: usize,
) -> Result<(), RegisterError> {
    if size > page_size {
        return Err(RegisterError::ElementTooLarge { size, page_size });
    }

    if unsafe { lookup(*spine, name) }.is_some() {
        return Err(RegisterError::DuplicateName(name.to_owned()));
    }

    unsafe {
        let mut head = match *spine {
            Some(head) if head.as_ref().used < RegistryPage::slot_capacity(page_size) => head,
            _ => {
                let base =
                    kernel::request_vm_pages(1, page_size).ok_or(RegisterError::OutOfMemory)?;
                let page = base.cast::<RegistryPage>();

                ptr::write(
                    page.as_ptr(),
                    RegistryPage {
                        next: *spine,
                        used: 0,
                    },
                );
                *spine = Some(page);

                trace!("mapped a fresh registry page at {:p}", page.as_ptr());

                page
            }
        };

        let index = head.as_ref().used;
        ptr::write(
            RegistryPage::slot(head, index).as_ptr(),
            RecordDescriptor::new(name, size),
        );
        head.as_mut().used = index + 1;
    }

    trace!("registered record {name:?}, element size {size}");

    Ok(())
}

/// Linear scan of the spine for a descriptor with this name.
pub(crate) unsafe fn lookup(
    spine: Link<RegistryPage>,
    name: &str,
) -> Option<NonNull<RecordDescriptor>> {
    RecordIter::starting_at(spine).find(|record| unsafe { record.as_ref().name_matches(name) })
}

/// Walks every descriptor of the spine, newest page first.
pub(crate) struct RecordIter {
    page: Link<RegistryPage>,
    index: usize,
}

impl RecordIter {
    pub(crate) fn starting_at(spine: Link<RegistryPage>) -> Self {
        Self {
            page: spine,
            index: 0,
        }
    }
}

impl Iterator for RecordIter {
    type Item = NonNull<RecordDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let page = self.page?;

            unsafe {
                if self.index < page.as_ref().used {
                    let slot = RegistryPage::slot(page, self.index);
                    self.index += 1;

                    return Some(slot);
                }

                self.page = page.as_ref().next;
                self.index = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Registry pages are never unmapped, leaking them here matches the
    // process-lifetime contract.

    #[test]
    fn register_then_lookup() {
        let page_size = kernel::page_size();
        let mut spine = None;

        unsafe {
            register(&mut spine, page_size, "employee", 96).unwrap();
            register(&mut spine, page_size, "station", 160).unwrap();

            let record = lookup(spine, "employee").unwrap();
            assert_eq!(96, record.as_ref().size);
            assert_eq!("employee", record.as_ref().name());
            assert!(record.as_ref().first_page.is_none());
            assert!(record.as_ref().free_blocks.is_empty());

            assert!(lookup(spine, "missing").is_none());
        }
    }

    #[test]
    fn duplicate_names_are_refused() {
        let page_size = kernel::page_size();
        let mut spine = None;

        unsafe {
            register(&mut spine, page_size, "employee", 96).unwrap();

            assert_eq!(
                Err(RegisterError::DuplicateName("employee".into())),
                register(&mut spine, page_size, "employee", 96)
            );
        }
    }

    #[test]
    fn oversized_elements_are_refused() {
        let page_size = kernel::page_size();
        let mut spine = None;

        unsafe {
            assert_eq!(
                Err(RegisterError::ElementTooLarge {
                    size: page_size + 1,
                    page_size
                }),
                register(&mut spine, page_size, "huge", page_size + 1)
            );
        }

        assert!(spine.is_none());
    }

    #[test]
    fn spine_grows_when_the_head_page_fills_up() {
        let page_size = kernel::page_size();
        let capacity = RegistryPage::slot_capacity(page_size);
        let mut spine = None;

        unsafe {
            for i in 0..=capacity {
                register(&mut spine, page_size, &format!("record-{i}"), 32).unwrap();
            }

            let head = spine.unwrap();
            assert!(head.as_ref().next.is_some());
            assert_eq!(1, head.as_ref().used);

            // every record stays reachable across spine pages
            for i in 0..=capacity {
                assert!(lookup(spine, &format!("record-{i}")).is_some());
            }
            assert_eq!(capacity + 1, RecordIter::starting_at(spine).count());
        }
    }

    #[test]
    fn names_are_truncated_to_the_bound() {
        let page_size = kernel::page_size();
        let mut spine = None;

        let long = "a".repeat(MAX_STRUCT_NAME_SIZE + 8);
        let same_prefix = format!("{}bbb", "a".repeat(MAX_STRUCT_NAME_SIZE));

        unsafe {
            register(&mut spine, page_size, &long, 48).unwrap();

            assert!(lookup(spine, &long).is_some());
            // only the first MAX_STRUCT_NAME_SIZE bytes take part in the compare
            assert_eq!(
                Err(RegisterError::DuplicateName(same_prefix.clone())),
                register(&mut spine, page_size, &same_prefix, 48)
            );

            let record = lookup(spine, &long).unwrap();
            assert_eq!(MAX_STRUCT_NAME_SIZE, record.as_ref().name().len());
        }
    }
}
