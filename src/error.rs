use core::alloc::Layout;

/// The allocator could not provide memory for a control block.
///
/// Returned by the fallible (`try_*`) constructors. When this is returned no control block exists,
/// and no reference count has been handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("failed to allocate a {size}-byte control block (alignment {align})")]
pub struct AllocError {
    size: usize,
    align: usize,
}

impl AllocError {
    pub(crate) fn new(layout: Layout) -> Self {
        Self {
            size: layout.size(),
            align: layout.align(),
        }
    }

    /// The layout that could not be allocated.
    pub fn layout(&self) -> Layout {
        // Safety: we only ever store the size and alignment of a valid `Layout`.
        unsafe { Layout::from_size_align_unchecked(self.size, self.align) }
    }
}
