//! Device filesystem, mounted at `/dev`.
//!
//! Flat namespace of kernel endpoints: the `zero` and `null` constants,
//! one character device per serial port, and symlinks such as `console`.
//! Character devices pair a transmit callback with a receive ring buffer
//! that drivers fill from interrupt context.

use alloc::{string::String, sync::Arc, vec::Vec};
use spin::Mutex;

use super::{
    DirentBuf, FileLike, Filesystem, OpenFlags, Stat, DT_LNK, DT_REG, S_IFCHR, S_IFLNK, S_IFREG,
};
use crate::errno::{Errno, Result};
use crate::ringbuf::RingBuf;

/// Receive buffer depth of a character device.
const CHARDEV_RING: usize = 1024;

enum NodeKind {
    /// `/dev/zero`.
    Zero,
    /// `/dev/null`.
    Null,
    /// A character device: transmit callback plus receive ring.
    Chardev {
        tx: fn(&[u8]),
        rx: Mutex<RingBuf<CHARDEV_RING>>,
    },
    /// A name alias for another node.
    Symlink { target: String },
}

/// One devfs entry.
pub struct DevfsNode {
    name: String,
    kind: NodeKind,
}

impl DevfsNode {
    /// The node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends bytes out through a character device. No-op on other nodes.
    pub fn sink_write(&self, buf: &[u8]) {
        if let NodeKind::Chardev { tx, .. } = &self.kind {
            tx(buf);
        }
    }

    /// Feeds received bytes into a character device's ring; oldest bytes
    /// fall out when the ring is full.
    pub fn push_input(&self, buf: &[u8]) {
        if let NodeKind::Chardev { rx, .. } = &self.kind {
            let mut rx = rx.lock();
            for b in buf {
                rx.push(*b);
            }
        }
    }

    fn dirent_type(&self) -> u32 {
        match self.kind {
            NodeKind::Symlink { .. } => DT_LNK,
            _ => DT_REG,
        }
    }
}

impl FileLike for DevfsNode {
    fn read(&self, _pos: u64, buf: &mut [u8]) -> Result<usize> {
        match &self.kind {
            NodeKind::Zero => {
                buf.fill(0);
                Ok(buf.len())
            }
            NodeKind::Null => Ok(0),
            NodeKind::Chardev { rx, .. } => Ok(rx.lock().read(buf)),
            NodeKind::Symlink { .. } => Err(Errno::EBADF),
        }
    }

    fn write(&self, _pos: u64, buf: &[u8]) -> Result<usize> {
        match &self.kind {
            NodeKind::Zero | NodeKind::Null => Ok(buf.len()),
            NodeKind::Chardev { tx, .. } => {
                tx(buf);
                Ok(buf.len())
            }
            NodeKind::Symlink { .. } => Err(Errno::EBADF),
        }
    }

    fn stat(&self) -> Stat {
        let mode = match self.kind {
            NodeKind::Chardev { .. } => S_IFCHR | 0o666,
            NodeKind::Symlink { .. } => S_IFLNK | 0o777,
            _ => S_IFREG | 0o666,
        };
        Stat { mode, size: 0 }
    }
}

static NODES: Mutex<Vec<Arc<DevfsNode>>> = Mutex::new(Vec::new());

fn find(name: &str) -> Result<Arc<DevfsNode>> {
    NODES
        .lock()
        .iter()
        .find(|n| n.name == name)
        .cloned()
        .ok_or(Errno::ENOENT)
}

/// Looks up a node by name, following one level of symlink.
pub fn lookup(name: &str) -> Result<Arc<DevfsNode>> {
    let node = find(name)?;
    match &node.kind {
        NodeKind::Symlink { target } => find(target),
        _ => Ok(node),
    }
}

fn register(node: DevfsNode) -> Result<Arc<DevfsNode>> {
    let mut nodes = NODES.lock();
    if nodes.iter().any(|n| n.name == node.name) {
        return Err(Errno::EEXIST);
    }

    let node = Arc::new(node);
    nodes.push(node.clone());
    Ok(node)
}

/// Registers a character device with a transmit callback.
pub fn register_chardev(name: &str, tx: fn(&[u8])) -> Result<Arc<DevfsNode>> {
    register(DevfsNode {
        name: String::from(name),
        kind: NodeKind::Chardev {
            tx,
            rx: Mutex::new(RingBuf::new()),
        },
    })
}

/// Registers `dst` as a symlink to the existing node `src`.
pub fn register_symlink(dst: &str, src: &str) -> Result<()> {
    find(src)?;
    match register(DevfsNode {
        name: String::from(dst),
        kind: NodeKind::Symlink {
            target: String::from(src),
        },
    }) {
        Ok(_) => Ok(()),
        // Rebinding the console on a second init call is fine
        Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(e),
    }
}

/// The `/dev` directory itself.
struct DevfsRoot;

impl FileLike for DevfsRoot {
    fn stat(&self) -> Stat {
        Stat {
            mode: super::S_IFDIR | 0o755,
            size: 0,
        }
    }

    fn getdents(&self, pos: u64, sink: &mut DirentBuf) -> Result<u64> {
        let nodes = NODES.lock();
        let mut next = pos;

        for node in nodes.iter().skip(pos as usize) {
            if !sink.push(node.dirent_type(), &node.name) {
                break;
            }
            next += 1;
        }

        Ok(next)
    }
}

/// Filesystem entry point of `/dev`.
pub struct Devfs;

/// The devfs singleton.
pub static DEV_FS: Devfs = Devfs;

impl Filesystem for Devfs {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<dyn FileLike>> {
        if path.is_empty() {
            return Ok(Arc::new(DevfsRoot));
        }

        let node = lookup(path)?;

        // Write-only nodes do not exist here; only check the obvious
        if flags.may_write() {
            if let NodeKind::Symlink { .. } = node.kind {
                return Err(Errno::EBADF);
            }
        }

        Ok(node)
    }
}

/// Registers the constant nodes.
pub fn init() -> Result<()> {
    register(DevfsNode {
        name: String::from("zero"),
        kind: NodeKind::Zero,
    })?;
    register(DevfsNode {
        name: String::from("null"),
        kind: NodeKind::Null,
    })?;
    Ok(())
}
