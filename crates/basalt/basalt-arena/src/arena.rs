use std::fs::File;
use std::sync::Arc;

use basalt_core::align::MAX_ALIGN;
use basalt_core::{Error, Result};
use memmap2::MmapMut;

/// Access mode of an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Writes are visible to every process mapping the same backing.
    Shared,
    /// Private copy-on-write mapping. Local writes (including lock state)
    /// land in a private copy; updates by other processes may stop being
    /// visible once a page has been copied.
    Readonly,
}

enum Backing {
    Map {
        // Kept alive for the lifetime of the mapping.
        _file: File,
        _map: MmapMut,
    },
    Raw,
}

struct Inner {
    _backing: Backing,
    ptr: *mut u8,
    len: usize,
    mode: Mode,
}

// The pointed-to region is process-shared by design; all mutation goes
// through the transport mutex.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// A contiguous byte region of fixed size, shared between processes.
///
/// Cloning an `Arena` is cheap and yields a handle to the same mapping;
/// the mapping is released when the last clone drops.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<Inner>,
}

fn validate_len(len: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::InvalidArg("arena size must be positive"));
    }
    if len % MAX_ALIGN != 0 {
        return Err(Error::InvalidArg("arena size must be max-aligned"));
    }
    Ok(())
}

impl Arena {
    /// Map `file` in its entirety. The size is read from the file; the
    /// arena never truncates or resizes the backing.
    pub fn from_file(file: File, mode: Mode) -> Result<Arena> {
        let len = file.metadata().map_err(Error::Sys)?.len() as usize;
        validate_len(len)?;
        let mut map = match mode {
            Mode::Shared => unsafe { MmapMut::map_mut(&file) },
            Mode::Readonly => unsafe { memmap2::MmapOptions::new().map_copy(&file) },
        }
        .map_err(Error::Sys)?;
        let ptr = map.as_mut_ptr();
        Ok(Arena {
            inner: Arc::new(Inner {
                _backing: Backing::Map { _file: file, _map: map },
                ptr,
                len,
                mode,
            }),
        })
    }

    /// Wrap an already-mapped byte region.
    ///
    /// # Safety
    /// `ptr..ptr+len` must stay valid and writable for the lifetime of the
    /// arena and every clone, and must have shared-memory semantics if more
    /// than one process uses it.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize, mode: Mode) -> Result<Arena> {
        if ptr.is_null() {
            return Err(Error::InvalidArg("arena pointer must not be null"));
        }
        validate_len(len)?;
        Ok(Arena {
            inner: Arc::new(Inner {
                _backing: Backing::Raw,
                ptr,
                len,
                mode,
            }),
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.inner.len)
            .field("mode", &self.inner.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_size() {
        let mut buf = vec![0u8; 100];
        let err = unsafe { Arena::from_raw(buf.as_mut_ptr(), 100, Mode::Shared) }.unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
    }

    #[test]
    fn raw_region_roundtrip() {
        let mut buf = vec![0u8; 4096];
        let arena = unsafe { Arena::from_raw(buf.as_mut_ptr(), buf.len(), Mode::Shared) }.unwrap();
        assert_eq!(arena.len(), 4096);
        assert_eq!(arena.mode(), Mode::Shared);
        let clone = arena.clone();
        assert_eq!(clone.ptr(), arena.ptr());
    }
}
