//! In-memory mutable filesystem, serving as the root mount.
//!
//! A tree of directories and byte-vector files behind one global lock.
//! Open files stay valid across tree changes: handles reference the file
//! object itself, not its path.

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use spin::Mutex;

use super::{
    DirentBuf, FileLike, Filesystem, OpenFlags, Stat, DT_DIR, DT_REG, S_IFDIR, S_IFREG,
};
use crate::errno::{Errno, Result};

/// A regular tmpfs file.
struct TmpfsFile {
    data: Mutex<Vec<u8>>,
}

impl FileLike for TmpfsFile {
    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let pos = (pos as usize).min(data.len());
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        Ok(n)
    }

    fn write(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();
        let pos = pos as usize;

        if pos + buf.len() > data.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn stat(&self) -> Stat {
        Stat {
            mode: S_IFREG | 0o644,
            size: self.data.lock().len() as u64,
        }
    }
}

enum Entry {
    Dir(BTreeMap<String, Entry>),
    File(Arc<TmpfsFile>),
}

static ROOT: Mutex<BTreeMap<String, Entry>> = Mutex::new(BTreeMap::new());

/// Walks to the directory holding the last path component. Returns an error
/// when an intermediate component is missing or a file.
fn walk_parent<'t>(
    root: &'t mut BTreeMap<String, Entry>,
    path: &str,
) -> Result<(&'t mut BTreeMap<String, Entry>, String)> {
    let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    let last = components.pop().ok_or(Errno::EINVAL)?;

    let mut dir = root;
    for comp in components {
        dir = match dir.get_mut(comp) {
            Some(Entry::Dir(sub)) => sub,
            Some(Entry::File(_)) => return Err(Errno::ENOTDIR),
            None => return Err(Errno::ENOENT),
        };
    }

    Ok((dir, last.to_string()))
}

/// A directory handle; listings re-walk the tree under the lock.
struct TmpfsDir {
    path: String,
}

impl TmpfsDir {
    fn list(&self) -> Result<Vec<(u32, String)>> {
        let mut root = ROOT.lock();

        let dir = if self.path.is_empty() {
            &mut *root
        } else {
            match walk_parent(&mut root, &self.path)? {
                (parent, last) => match parent.get_mut(&last) {
                    Some(Entry::Dir(sub)) => sub,
                    Some(Entry::File(_)) => return Err(Errno::ENOTDIR),
                    None => return Err(Errno::ENOENT),
                },
            }
        };

        Ok(dir
            .iter()
            .map(|(name, entry)| {
                let ty = match entry {
                    Entry::Dir(_) => DT_DIR,
                    Entry::File(_) => DT_REG,
                };
                (ty, name.clone())
            })
            .collect())
    }
}

impl FileLike for TmpfsDir {
    fn stat(&self) -> Stat {
        Stat {
            mode: S_IFDIR | 0o755,
            size: 0,
        }
    }

    fn getdents(&self, pos: u64, sink: &mut DirentBuf) -> Result<u64> {
        let entries = self.list()?;
        let mut next = pos;

        for (ty, name) in entries.iter().skip(pos as usize) {
            if !sink.push(*ty, name) {
                break;
            }
            next += 1;
        }

        Ok(next)
    }
}

/// Filesystem entry point of the tmpfs root.
pub struct Tmpfs;

/// The tmpfs singleton.
pub static TMP_FS: Tmpfs = Tmpfs;

impl Filesystem for Tmpfs {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<dyn FileLike>> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Ok(Arc::new(TmpfsDir {
                path: String::new(),
            }));
        }

        let mut root = ROOT.lock();
        let (parent, last) = walk_parent(&mut root, path)?;

        match parent.get(&last) {
            Some(Entry::File(file)) => Ok(file.clone()),
            Some(Entry::Dir(_)) => Ok(Arc::new(TmpfsDir {
                path: String::from(path),
            })),
            None if flags.create() => {
                let file = Arc::new(TmpfsFile {
                    data: Mutex::new(Vec::new()),
                });
                parent.insert(last, Entry::File(file.clone()));
                Ok(file)
            }
            None => Err(Errno::ENOENT),
        }
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(Errno::EEXIST);
        }

        let mut root = ROOT.lock();
        let (parent, last) = walk_parent(&mut root, path)?;

        if parent.contains_key(&last) {
            return Err(Errno::EEXIST);
        }
        parent.insert(last, Entry::Dir(BTreeMap::new()));

        Ok(())
    }
}

/// Creates the initial directories.
pub fn init() -> Result<()> {
    let mut root = ROOT.lock();
    root.entry(String::from("tmp"))
        .or_insert_with(|| Entry::Dir(BTreeMap::new()));
    Ok(())
}
