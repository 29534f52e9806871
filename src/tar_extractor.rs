use crate::error::{Error, IoContext, Result};
use filetime::FileTime;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

/// Synthetic UID/GID window that unprivileged extraction maps ownership into.
/// A blank range (`count == 0`) leaves everything owned by the invoking user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UidRange {
    pub shift: u32,
    pub count: u32,
}

impl UidRange {
    pub fn blank() -> Self {
        Self::default()
    }

    pub fn is_blank(&self) -> bool {
        self.count == 0
    }

    pub fn map(&self, id: u64) -> Option<u32> {
        if id < u64::from(self.count) {
            self.shift.checked_add(id as u32)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Running as root: unpack uid/gid exactly as recorded.
    Preserve,
    /// Unprivileged: shift recorded ids into the range, or drop them.
    Shift(UidRange),
}

impl Ownership {
    pub fn for_current_process(range: UidRange) -> Self {
        if nix::unistd::geteuid().is_root() {
            Ownership::Preserve
        } else {
            Ownership::Shift(range)
        }
    }
}

/// Normalizes a path from a tar archive to be safe for extraction
/// Removes any attempts to escape the root directory
pub(crate) fn normalize_tar_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for comp in p.components() {
        match comp {
            Component::CurDir => { /* skip "." */ }
            Component::ParentDir => {
                // Don't allow escaping the root
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            // Ignore absolute paths and Windows prefixes
            Component::RootDir | Component::Prefix(_) => { /* ignore */ }
        }
    }

    out
}

struct PendingDir {
    dest: PathBuf,
    mode: Option<u32>,
    mtime: Option<u64>,
    uid: Option<u64>,
    gid: Option<u64>,
}

fn open_archive(tar_path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(tar_path).map_err(|e| Error::at_path("open layer", tar_path, e))?;

    let mut buf_reader = BufReader::new(file);
    let mut magic_bytes = [0u8; 2];
    let is_gzip = match buf_reader.read_exact(&mut magic_bytes) {
        Ok(()) => magic_bytes == [0x1f, 0x8b],
        // Shorter than two bytes cannot be gzip
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(Error::io(format!("failed to read {}", tar_path.display()), e)),
    };

    // Reopen the file since we consumed some bytes
    let file = File::open(tar_path).map_err(|e| Error::at_path("open layer", tar_path, e))?;
    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(tar::Archive::new(reader))
}

#[cfg(unix)]
fn shift_owner(path: &Path, uid: Option<u64>, gid: Option<u64>, ownership: &Ownership) {
    let (uid, gid) = match ownership {
        Ownership::Preserve => (uid.map(|u| u as u32), gid.map(|g| g as u32)),
        Ownership::Shift(range) if !range.is_blank() => {
            (uid.and_then(|u| range.map(u)), gid.and_then(|g| range.map(g)))
        }
        Ownership::Shift(_) => return,
    };
    if uid.is_none() && gid.is_none() {
        return;
    }
    if let Err(e) = std::os::unix::fs::lchown(path, uid, gid) {
        log::warn!("Failed to set owner of {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn shift_owner(_path: &Path, _uid: Option<u64>, _gid: Option<u64>, _ownership: &Ownership) {}

/// Unpacks one layer blob (plain or gzipped tar) into `extract_dir`.
///
/// The layer is unpacked on its own: whiteout markers (`.wh.*`) are layer
/// content and land on disk verbatim, nothing is merged with lower layers.
/// When `filter` is set only the listed paths (relative, normalized) are
/// unpacked. Directory modes and mtimes are applied after all their children
/// are written so the tree re-archives to the same bytes.
pub fn extract_tar(
    tar_path: &Path,
    extract_dir: &Path,
    filter: Option<&HashSet<PathBuf>>,
    ownership: &Ownership,
) -> Result<()> {
    fs::create_dir_all(extract_dir)
        .io_context(|| format!("failed to create {}", extract_dir.display()))?;

    let mut archive = open_archive(tar_path)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_preserve_ownerships(*ownership == Ownership::Preserve);

    let mut pending_dirs = Vec::new();
    let entries = archive
        .entries()
        .io_context(|| format!("failed to read {}", tar_path.display()))?;

    for entry_result in entries {
        let mut entry =
            entry_result.io_context(|| format!("failed to read entry of {}", tar_path.display()))?;
        let rel_path = {
            let raw = entry
                .path()
                .io_context(|| format!("invalid entry path in {}", tar_path.display()))?;
            normalize_tar_path(&raw)
        };
        if rel_path.as_os_str().is_empty() {
            continue;
        }
        if let Some(filter) = filter {
            if !filter.contains(&rel_path) {
                log::trace!("Filtered out {}", rel_path.display());
                continue;
            }
        }

        let header = entry.header();
        let entry_type = header.entry_type();
        let dest = extract_dir.join(&rel_path);
        let uid = header.uid().ok();
        let gid = header.gid().ok();

        match entry_type {
            tar::EntryType::Directory => {
                fs::create_dir_all(&dest)
                    .io_context(|| format!("failed to create directory {}", dest.display()))?;
                pending_dirs.push(PendingDir {
                    dest,
                    mode: header.mode().ok(),
                    mtime: header.mtime().ok(),
                    uid,
                    gid,
                });
            }
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo
                if *ownership != Ownership::Preserve =>
            {
                log::debug!(
                    "Skipping device node {} (requires root)",
                    rel_path.display()
                );
            }
            tar::EntryType::XGlobalHeader | tar::EntryType::XHeader => {}
            _ => {
                // Replace a directory that a lower entry created at the same path
                if let Ok(metadata) = fs::symlink_metadata(&dest) {
                    if metadata.is_dir() && entry_type != tar::EntryType::Directory {
                        fs::remove_dir_all(&dest).ok();
                    }
                }

                log::trace!("Unpacking {}", dest.display());
                let unpacked = entry
                    .unpack_in(extract_dir)
                    .io_context(|| format!("failed to unpack {}", dest.display()))?;
                if !unpacked {
                    log::warn!("Skipped entry escaping layer root: {}", rel_path.display());
                    continue;
                }
                if !matches!(ownership, Ownership::Preserve) {
                    shift_owner(&dest, uid, gid, ownership);
                }
            }
        }
    }

    // Deepest directories first, so setting a parent's mtime is not undone
    // by touching a child.
    for dir in pending_dirs.into_iter().rev() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = dir.mode {
                fs::set_permissions(&dir.dest, fs::Permissions::from_mode(mode & 0o7777))
                    .io_context(|| format!("failed to set mode on {}", dir.dest.display()))?;
            }
        }
        shift_owner(&dir.dest, dir.uid, dir.gid, ownership);
        if let Some(mtime) = dir.mtime {
            let mtime = FileTime::from_unix_time(mtime as i64, 0);
            if let Err(e) = filetime::set_file_mtime(&dir.dest, mtime) {
                log::warn!("Failed to set mtime on {}: {}", dir.dest.display(), e);
            }
        }
    }

    Ok(())
}
