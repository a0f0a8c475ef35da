//! Physical memory interface consumed by the VMX core.
//!
//! Page allocation and address translation belong to the loader; the core only needs a
//! zeroed, page-aligned page for every VMCS and bitmap, and the physical address of it.

use {
    crate::error::HypervisorError,
    alloc::boxed::Box,
    static_assertions::const_assert_eq,
    x86::bits64::paging::BASE_PAGE_SIZE,
};

/// One 4 KiB, 4 KiB-aligned page.
#[repr(C, align(4096))]
pub struct Page(pub [u8; BASE_PAGE_SIZE]);

const_assert_eq!(core::mem::size_of::<Page>(), BASE_PAGE_SIZE);
const_assert_eq!(core::mem::align_of::<Page>(), BASE_PAGE_SIZE);

impl Page {
    pub fn zeroed() -> Box<Self> {
        Box::new(Self([0; BASE_PAGE_SIZE]))
    }
}

/// Page allocation and address translation supplied by the environment.
pub trait PhysicalMemory {
    /// Returns a zero-initialised page and its physical address.
    fn alloc_page(&mut self) -> Result<(Box<Page>, u64), HypervisorError>;

    /// Gives back a page obtained from [`PhysicalMemory::alloc_page`].
    fn free_page(&mut self, page: Box<Page>);

    /// Translates a virtual address of hypervisor memory into its physical address.
    fn translate(&self, virtual_address: u64) -> Result<u64, HypervisorError>;
}

/// Memory for identity-mapped environments such as UEFI, where physical == virtual.
///
/// Pages come from the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMapped;

impl PhysicalMemory for IdentityMapped {
    fn alloc_page(&mut self) -> Result<(Box<Page>, u64), HypervisorError> {
        let page = Page::zeroed();
        let physical_address = self.translate(&*page as *const Page as u64)?;
        log::trace!("Allocated page at {:#x}", physical_address);
        Ok((page, physical_address))
    }

    fn free_page(&mut self, page: Box<Page>) {
        log::trace!("Freeing page at {:#x}", &*page as *const Page as u64);
        drop(page);
    }

    fn translate(&self, virtual_address: u64) -> Result<u64, HypervisorError> {
        if virtual_address == 0 {
            return Err(HypervisorError::AddressTranslationFailed(virtual_address));
        }
        Ok(virtual_address)
    }
}
