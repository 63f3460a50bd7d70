use std::fs;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use basalt_core::{Error, Result, env};
use tracing::debug;

use crate::arena::{Arena, Mode};

/// Options applied when the backing file does not exist yet.
///
/// These never change existing files.
#[derive(Clone, Copy, Debug)]
pub struct CreateOptions {
    /// File size. Files are zero-filled on creation.
    pub size: u64,
    /// File mode.
    pub mode: u32,
    /// Mode for directories created along the way.
    pub dir_mode: u32,
}

/// Options applied when mapping the file.
#[derive(Clone, Copy, Debug)]
pub struct OpenOptions {
    /// Map copy-on-write instead of shared.
    pub readonly: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct FileOptions {
    pub create: CreateOptions,
    pub open: OpenOptions,
}

/// 16 MiB, universal read+write, shared mapping.
impl Default for FileOptions {
    fn default() -> Self {
        FileOptions {
            create: CreateOptions {
                size: 16 * 1024 * 1024,
                mode: 0o666,
                dir_mode: 0o777,
            },
            open: OpenOptions { readonly: false },
        }
    }
}

/// A file-backed [`Arena`].
///
/// Relative paths resolve against the configured root (`A0_ROOT`, default
/// `/dev/shm/alephzero`). Missing files and directories are created
/// automatically; the file persists after the handle is dropped.
pub struct ArenaFile {
    path: PathBuf,
    arena: Arena,
}

fn resolve(path: &str) -> PathBuf {
    if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new(env::root()).join(path)
    }
}

fn make_parents(path: &Path, dir_mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(dir_mode)
                .create(parent)
                .map_err(Error::Sys)?;
        }
    }
    Ok(())
}

impl ArenaFile {
    /// Open `path` with [`FileOptions::default`].
    pub fn open(path: &str) -> Result<ArenaFile> {
        ArenaFile::open_with(path, FileOptions::default())
    }

    pub fn open_with(path: &str, opts: FileOptions) -> Result<ArenaFile> {
        let path = resolve(path);
        make_parents(&path, opts.create.dir_mode)?;

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(opts.create.mode)
            .open(&path)
            .map_err(Error::Sys)?;

        // A freshly created file has length zero; size it now. set_len
        // zero-fills, which is what the transport's lazy init relies on.
        let len = file.metadata().map_err(Error::Sys)?.len();
        if len == 0 {
            debug!(path = %path.display(), size = opts.create.size, "creating arena file");
            file.set_len(opts.create.size).map_err(Error::Sys)?;
        }

        let mode = if opts.open.readonly {
            Mode::Readonly
        } else {
            Mode::Shared
        };
        let arena = Arena::from_file(file, mode)?;
        Ok(ArenaFile { path, arena })
    }

    /// Absolute path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Hand out the arena; the mapping stays alive through its clones.
    pub fn into_arena(self) -> Arena {
        self.arena
    }

    /// Remove the backing file at `path`. Existing mappings stay valid.
    pub fn remove(path: &str) -> Result<()> {
        let path = resolve(path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Sys(e)),
        }
    }

    /// Remove the file or directory at `path`, including subdirectories.
    pub fn remove_all(path: &str) -> Result<()> {
        let path = resolve(path);
        let res = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Sys(e)),
        }
    }
}
