use crate::Basic;

bitflags::bitflags! {
    /// Optional features a filesystem may support.
    ///
    /// Wrappers never widen what they delegate to: composing filesystems
    /// yields the intersection of their capabilities.
    pub struct Capability: u32 {
        /// Files can be written to.
        const WRITE = 1 << 0;
        /// Files can be read from.
        const READ = 1 << 1;
        /// Files can be opened for reading and writing at the same time.
        const READ_AND_WRITE = 1 << 2;
        /// Files can be seeked.
        const SEEK = 1 << 3;
        /// Files can be truncated.
        const TRUNCATE = 1 << 4;
        /// Files can be advisory locked.
        const LOCK = 1 << 5;

        /// What a filesystem is assumed to support when it says nothing.
        const DEFAULT = Self::WRITE.bits
            | Self::READ.bits
            | Self::READ_AND_WRITE.bits
            | Self::SEEK.bits
            | Self::TRUNCATE.bits
            | Self::LOCK.bits;
    }
}

impl Default for Capability {
    fn default() -> Self {
        Capability::DEFAULT
    }
}

/// The capabilities `fs` reports.
pub fn capabilities<F: Basic + ?Sized>(fs: &F) -> Capability {
    fs.capabilities()
}

/// Whether `fs` supports every capability in `required`.
pub fn capability_check<F: Basic + ?Sized>(fs: &F, required: Capability) -> bool {
    fs.capabilities().contains(required)
}
