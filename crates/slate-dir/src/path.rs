//! Path resolution.
//!
//! Paths are peeled one component at a time: leading slashes skipped,
//! component of at most `DIRSIZ` bytes, trailing slashes skipped. Absolute
//! paths start at the root inode, relative ones at the caller's working
//! directory. Every intermediate component must be a directory.

use crate::dirlookup;
use slate_error::{FsError, Result};
use slate_inode::{FsContext, Iref};
use slate_ondisk::InodeType;
use slate_types::{DIRSIZ, DirName};

/// Split the next path element off `path`.
///
/// Returns the element and the remainder (with no leading slashes), or
/// `None` when the path is exhausted. A component longer than `DIRSIZ`
/// is an error.
///
/// Examples:
/// - `skipelem("a/bb/c")` → `("a", "bb/c")`
/// - `skipelem("///a//bb")` → `("a", "bb")`
/// - `skipelem("a")` → `("a", "")`
/// - `skipelem("")`, `skipelem("////")` → `None`
pub fn skipelem(path: &str) -> Result<Option<(DirName, &str)>> {
    let bytes = path.as_bytes();
    let mut i = 0;

    while i < bytes.len() && bytes[i] == b'/' {
        i += 1;
    }
    if i == bytes.len() {
        return Ok(None);
    }

    let start = i;
    while i < bytes.len() && bytes[i] != b'/' {
        i += 1;
    }
    let elem = &bytes[start..i];
    if elem.len() > DIRSIZ {
        return Err(FsError::BadPath { limit: DIRSIZ });
    }
    let name = DirName::new(elem).ok_or(FsError::BadPath { limit: DIRSIZ })?;

    while i < bytes.len() && bytes[i] == b'/' {
        i += 1;
    }
    Ok(Some((name, &path[i..])))
}

/// Walk `path`, returning the final inode — or, with `parent`, the final
/// component's parent along with the component itself.
fn namex(
    fs: &FsContext,
    cwd: &Iref,
    path: &str,
    parent: bool,
) -> Result<(Iref, Option<DirName>)> {
    let mut ip = if path.starts_with('/') {
        fs.root()
    } else {
        cwd.clone()
    };
    let mut rest = path;

    while let Some((name, next)) = skipelem(rest)? {
        assert!(
            ip.itype() != InodeType::Free,
            "namex: walked onto a free inode"
        );
        if ip.itype() != InodeType::Dir {
            return Err(FsError::NotADirectory);
        }
        if parent && next.is_empty() {
            // Stop one level early.
            return Ok((ip, Some(name)));
        }

        let Some(next_ip) = dirlookup(fs, &ip, name)? else {
            return Err(FsError::NotFound(name.to_string()));
        };
        ip = next_ip;
        rest = next;
    }

    if parent {
        // The path ran out before yielding a final component.
        return Err(FsError::NotFound(path.to_string()));
    }
    Ok((ip, None))
}

/// Resolve `path` to an inode handle.
pub fn namei(fs: &FsContext, cwd: &Iref, path: &str) -> Result<Iref> {
    namex(fs, cwd, path, false).map(|(ip, _)| ip)
}

/// Resolve `path` to the parent of its final component, returning the
/// component as well.
pub fn nameiparent(fs: &FsContext, cwd: &Iref, path: &str) -> Result<(Iref, DirName)> {
    let (ip, name) = namex(fs, cwd, path, true)?;
    Ok((ip, name.expect("parent walks always yield a component")))
}
