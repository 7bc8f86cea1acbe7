//! Path resolution.
//!
//! Paths inside a mount are resolved component-by-component under the meta
//! read lock: each component hashes into its parent's bucket and the chain
//! is compared byte-exact. Normalization collapses `.` and `..` during the
//! walk; `..` at the mount root is a no-op.

use pbfs_error::{PbfsError, Result};
use pbfs_meta::MetaStore;
use pbfs_ondisk::InodeKind;
use pbfs_types::{BirthTime, Ino, Oid, MAX_NAMELEN, MAX_PATHLEN};

/// Outcome of a path walk, feeding open/rename/unlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameInfo {
    /// Directory that holds (or would hold) the final component.
    pub parent: Ino,
    /// The resolved target, if present.
    pub target: Option<ResolvedTarget>,
    /// Final path component ("" when the path names the root itself).
    pub final_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub ino: Ino,
    pub kind: InodeKind,
    pub birth_time: BirthTime,
    /// The dentry that named the target (absent for the root).
    pub dentry: Option<(Oid, BirthTime)>,
}

fn inode_kind(store: &MetaStore, ino: Ino) -> Result<(InodeKind, BirthTime)> {
    let record = store.get(pbfs_ondisk::MetaKind::Inode, Oid(ino.0))?;
    let inode = record.as_inode()?;
    Ok((inode.kind, inode.birth_time))
}

/// Resolve `path` (already stripped of the `/<pbd>` prefix, absolute within
/// the mount) to a [`NameInfo`]. The caller holds the meta read lock.
pub fn resolve(store: &MetaStore, path: &str) -> Result<NameInfo> {
    if path.len() > MAX_PATHLEN {
        return Err(PbfsError::NameTooLong);
    }

    // Walk with an ino stack so `..` can back out of a component.
    let mut stack: Vec<(Ino, Option<(Oid, BirthTime)>, String)> =
        vec![(Ino::ROOT, None, String::new())];

    let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
    while let Some(component) = components.next() {
        if component.len() > MAX_NAMELEN {
            return Err(PbfsError::NameTooLong);
        }
        if component == "." {
            continue;
        }
        if component == ".." {
            if stack.len() > 1 {
                stack.pop();
            }
            continue;
        }

        let dir_ino = stack.last().expect("stack never empties").0;
        let (dir_kind, _) = inode_kind(store, dir_ino)?;
        if !matches!(dir_kind, InodeKind::Dir) {
            return Err(PbfsError::NotDirectory);
        }

        match store.lookup_dentry(dir_ino, component) {
            Some(dentry) => {
                let (kind, _) = inode_kind(store, dentry.child)?;
                if components.peek().is_some() && !matches!(kind, InodeKind::Dir) {
                    return Err(PbfsError::NotDirectory);
                }
                stack.push((
                    dentry.child,
                    Some((dentry.oid, dentry.birth_time)),
                    component.to_owned(),
                ));
            }
            None => {
                if components.peek().is_some() {
                    return Err(PbfsError::NotFound(format!(
                        "missing path component {component:?}"
                    )));
                }
                // Final component absent: report the parent for creation.
                return Ok(NameInfo {
                    parent: dir_ino,
                    target: None,
                    final_name: component.to_owned(),
                });
            }
        }
    }

    let (ino, dentry, final_name) = stack.pop().expect("stack never empties");
    let parent = stack.last().map_or(Ino::ROOT, |(parent, _, _)| *parent);
    let (kind, birth_time) = inode_kind(store, ino)?;
    Ok(NameInfo {
        parent,
        target: Some(ResolvedTarget {
            ino,
            kind,
            birth_time,
            dentry,
        }),
        final_name,
    })
}

/// Normalize `path` against `cwd` (both mount-absolute) into an absolute
/// path without `.`/`..` components.
pub fn absolute(cwd: &str, path: &str) -> Result<String> {
    let joined = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), path)
    };
    if joined.len() > MAX_PATHLEN {
        return Err(PbfsError::NameTooLong);
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in joined.split('/').filter(|c| !c.is_empty()) {
        match component {
            "." => {}
            ".." => {
                parts.pop();
            }
            other => {
                if other.len() > MAX_NAMELEN {
                    return Err(PbfsError::NameTooLong);
                }
                parts.push(other);
            }
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Split `/pbd/rest` into the device name and the mount-relative remainder.
pub fn split_device(path: &str) -> Result<(&str, &str)> {
    let trimmed = path
        .strip_prefix('/')
        .ok_or_else(|| PbfsError::Invalid(format!("path must be absolute, got {path:?}")))?;
    let (pbd, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
    if pbd.is_empty() {
        return Err(PbfsError::Invalid("empty device name in path".to_owned()));
    }
    Ok((pbd, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbfs_dev::RamDevice;
    use pbfs_journal::{Journal, JournalRegion};
    use pbfs_meta::tx::Tx;
    use pbfs_ondisk::{DirEntryRec, InodeRec, MetaKind, MetaRecord};
    use pbfs_types::{Epoch, Geometry, HostId, Interrupt, TxId};

    /// Build `/dir/file` through real transactions.
    fn store_with_tree() -> MetaStore {
        let geo = Geometry::new(512, 512, 4096, 64 * 4096).expect("geometry");
        let mut store = MetaStore::new(geo, 1).expect("store");
        let dev = RamDevice::new(512 * 1024, 512);
        let region = JournalRegion {
            off: 4096,
            len: 128 * 1024,
        };
        let ir = Interrupt::none();
        let (mut journal, _) = Journal::open(&ir, &dev, region, TxId(0)).expect("journal");

        let mut tx = Tx::begin();
        let root = tx
            .alloc_with(&mut store, MetaKind::Inode, |oid, birth| {
                MetaRecord::Inode(InodeRec {
                    ino: Ino(oid.0),
                    kind: InodeKind::Dir,
                    size: 0,
                    nblocks: 0,
                    mtime: 0,
                    ctime: 0,
                    refcount: 1,
                    first_blktag: None,
                    parent: None,
                    birth_time: birth,
                })
            })
            .expect("root");
        assert_eq!(root, Oid(Ino::ROOT.0));
        let dir = tx
            .alloc_with(&mut store, MetaKind::Inode, |oid, birth| {
                MetaRecord::Inode(InodeRec {
                    ino: Ino(oid.0),
                    kind: InodeKind::Dir,
                    size: 0,
                    nblocks: 0,
                    mtime: 0,
                    ctime: 0,
                    refcount: 1,
                    first_blktag: None,
                    parent: Some(Ino::ROOT),
                    birth_time: birth,
                })
            })
            .expect("dir");
        let file = tx
            .alloc_with(&mut store, MetaKind::Inode, |oid, birth| {
                MetaRecord::Inode(InodeRec {
                    ino: Ino(oid.0),
                    kind: InodeKind::File,
                    size: 0,
                    nblocks: 0,
                    mtime: 0,
                    ctime: 0,
                    refcount: 1,
                    first_blktag: None,
                    parent: Some(Ino(dir.0)),
                    birth_time: birth,
                })
            })
            .expect("file");
        tx.alloc_with(&mut store, MetaKind::DirEntry, |oid, birth| {
            MetaRecord::DirEntry(DirEntryRec {
                oid,
                parent: Ino::ROOT,
                child: Ino(dir.0),
                next: None,
                birth_time: birth,
                name: "dir".to_owned(),
            })
        })
        .expect("dir entry");
        tx.alloc_with(&mut store, MetaKind::DirEntry, |oid, birth| {
            MetaRecord::DirEntry(DirEntryRec {
                oid,
                parent: Ino(dir.0),
                child: Ino(file.0),
                next: None,
                birth_time: birth,
                name: "file".to_owned(),
            })
        })
        .expect("file entry");
        tx.commit(&ir, &dev, &mut journal, &mut store, HostId(1), Epoch(1))
            .expect("commit");
        store
    }

    #[test]
    fn resolve_root() {
        let store = store_with_tree();
        let info = resolve(&store, "/").expect("resolve");
        let target = info.target.expect("target");
        assert_eq!(target.ino, Ino::ROOT);
        assert!(matches!(target.kind, InodeKind::Dir));
        assert!(target.dentry.is_none());
        assert_eq!(info.final_name, "");
    }

    #[test]
    fn resolve_nested_file() {
        let store = store_with_tree();
        let info = resolve(&store, "/dir/file").expect("resolve");
        let target = info.target.expect("target");
        assert!(matches!(target.kind, InodeKind::File));
        assert_eq!(info.parent, Ino(1));
        assert_eq!(info.final_name, "file");
        assert!(target.dentry.is_some());
    }

    #[test]
    fn resolve_absent_final_component() {
        let store = store_with_tree();
        let info = resolve(&store, "/dir/new.txt").expect("resolve");
        assert!(info.target.is_none());
        assert_eq!(info.parent, Ino(1));
        assert_eq!(info.final_name, "new.txt");
    }

    #[test]
    fn resolve_missing_intermediate() {
        let store = store_with_tree();
        assert!(matches!(
            resolve(&store, "/nope/file"),
            Err(PbfsError::NotFound(_))
        ));
    }

    #[test]
    fn resolve_file_as_directory() {
        let store = store_with_tree();
        assert!(matches!(
            resolve(&store, "/dir/file/deeper"),
            Err(PbfsError::NotDirectory)
        ));
    }

    #[test]
    fn dotdot_at_root_is_noop() {
        let store = store_with_tree();
        let info = resolve(&store, "/../../dir").expect("resolve");
        assert_eq!(info.target.expect("target").ino, Ino(1));
    }

    #[test]
    fn dot_components_collapse() {
        let store = store_with_tree();
        let info = resolve(&store, "/dir/./../dir/file").expect("resolve");
        assert!(info.target.is_some());
        assert_eq!(info.final_name, "file");
    }

    #[test]
    fn component_too_long() {
        let store = store_with_tree();
        let long = format!("/{}", "x".repeat(MAX_NAMELEN + 1));
        assert!(matches!(resolve(&store, &long), Err(PbfsError::NameTooLong)));
    }

    #[test]
    fn absolute_normalizes() {
        assert_eq!(absolute("/", "a/b").expect("abs"), "/a/b");
        assert_eq!(absolute("/a", "b").expect("abs"), "/a/b");
        assert_eq!(absolute("/a/b", "../c").expect("abs"), "/a/c");
        assert_eq!(absolute("/a", "/b").expect("abs"), "/b");
        assert_eq!(absolute("/", "../..").expect("abs"), "/");
    }

    #[test]
    fn split_device_parses() {
        assert_eq!(split_device("/pbd0/a/b").expect("split"), ("pbd0", "a/b"));
        assert_eq!(split_device("/pbd0").expect("split"), ("pbd0", ""));
        assert!(split_device("relative/path").is_err());
        assert!(split_device("//x").is_err());
    }
}
