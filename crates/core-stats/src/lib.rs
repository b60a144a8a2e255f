//! Optional POSIX shared-memory statistics block.
//!
//! External monitors map the block read-only and walk a tree of named
//! counter nodes; the layout is a stable contract:
//!
//! ```text
//! header: magic "VSTA" | version u32 | generation u32 | num_nodes u32 | root u32
//! nodes:  [ name[24] | flags u32 | first_child u32 | next_sibling u32 | value u64 ] × N
//! ```
//!
//! The generation counter is bumped around structural changes so a reader
//! can detect mid-walk mutations and retry. Counter updates are plain
//! relaxed stores into the mapping. Everything degrades gracefully: when
//! shm is unavailable the tree still works in private memory, only
//! invisible to outside readers.

use std::ffi::CString;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use thiserror::Error;

pub const STATS_MAGIC: u32 = u32::from_le_bytes(*b"VSTA");
pub const STATS_VERSION: u32 = 1;
pub const NODE_NAME_MAX: usize = 24;
pub const INVALID_NODE: u32 = u32::MAX;

const FLAG_ENABLED: u32 = 1;
const FLAG_VALUE: u32 = 2;

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("stats name too long")]
    NameTooLong,
    #[error("node table full")]
    Full,
    #[error("shm_open failed: {0}")]
    ShmOpen(i32),
    #[error("mmap failed: {0}")]
    Map(i32),
}

/// Handle to one node; cheap to copy, valid for the tree's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatNode(u32);

#[repr(C)]
struct RawHeader {
    magic: u32,
    version: u32,
    generation: AtomicU32,
    num_nodes: u32,
    root: u32,
}

#[repr(C)]
struct RawNode {
    name: [u8; NODE_NAME_MAX],
    flags: u32,
    first_child: u32,
    next_sibling: u32,
    value: AtomicU64,
}

enum Backing {
    /// POSIX shm mapping, unlinked on drop.
    Shm {
        name: CString,
        ptr: *mut u8,
        len: usize,
    },
    /// Private allocation (shm unavailable or disabled).
    Private(Box<[u8]>),
}

// The raw pointer is only dereferenced through atomics; moving the handle
// across threads is fine.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

pub struct StatsTree {
    backing: Backing,
    capacity: u32,
    used: std::sync::Mutex<u32>,
}

impl StatsTree {
    /// Create the block under `/<name>` (e.g. `vermilion.<pid>`); falls
    /// back to private memory when shm isn't available.
    pub fn create(name: &str, capacity: u32) -> Self {
        let len = Self::byte_len(capacity);
        match Self::map_shm(name, len) {
            Ok(ptr) => {
                let shm_name = CString::new(format!("/{name}")).expect("no NUL in stats name");
                let tree = Self {
                    backing: Backing::Shm {
                        name: shm_name,
                        ptr,
                        len,
                    },
                    capacity,
                    used: std::sync::Mutex::new(0),
                };
                tree.init_header();
                tree
            }
            Err(err) => {
                tracing::warn!(target: "stats", %err, "stats shm unavailable, private fallback");
                let buf = vec![0u8; len].into_boxed_slice();
                let tree = Self {
                    backing: Backing::Private(buf),
                    capacity,
                    used: std::sync::Mutex::new(0),
                };
                tree.init_header();
                tree
            }
        }
    }

    /// Private-memory tree (tests, stats disabled).
    pub fn private(capacity: u32) -> Self {
        let len = Self::byte_len(capacity);
        let tree = Self {
            backing: Backing::Private(vec![0u8; len].into_boxed_slice()),
            capacity,
            used: std::sync::Mutex::new(0),
        };
        tree.init_header();
        tree
    }

    fn byte_len(capacity: u32) -> usize {
        std::mem::size_of::<RawHeader>() + capacity as usize * std::mem::size_of::<RawNode>()
    }

    fn map_shm(name: &str, len: usize) -> Result<*mut u8, StatsError> {
        let c_name =
            CString::new(format!("/{name}")).map_err(|_| StatsError::NameTooLong)?;
        unsafe {
            let fd = libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o644 as libc::mode_t,
            );
            if fd < 0 {
                return Err(StatsError::ShmOpen(errno()));
            }
            if libc::ftruncate(fd, len as libc::off_t) != 0 {
                let err = errno();
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
                return Err(StatsError::ShmOpen(err));
            }
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                libc::shm_unlink(c_name.as_ptr());
                return Err(StatsError::Map(errno()));
            }
            Ok(ptr.cast())
        }
    }

    fn base(&self) -> *mut u8 {
        match &self.backing {
            Backing::Shm { ptr, .. } => *ptr,
            Backing::Private(buf) => buf.as_ptr() as *mut u8,
        }
    }

    fn header(&self) -> &RawHeader {
        unsafe { &*(self.base() as *const RawHeader) }
    }

    fn header_mut(&self) -> *mut RawHeader {
        self.base() as *mut RawHeader
    }

    fn node(&self, index: u32) -> &RawNode {
        debug_assert!(index < self.capacity);
        unsafe {
            let nodes = self.base().add(std::mem::size_of::<RawHeader>()) as *const RawNode;
            &*nodes.add(index as usize)
        }
    }

    fn node_mut(&self, index: u32) -> *mut RawNode {
        unsafe {
            let nodes = self.base().add(std::mem::size_of::<RawHeader>()) as *mut RawNode;
            nodes.add(index as usize)
        }
    }

    fn init_header(&self) {
        unsafe {
            let h = self.header_mut();
            (*h).magic = STATS_MAGIC;
            (*h).version = STATS_VERSION;
            (*h).generation = AtomicU32::new(1);
            (*h).num_nodes = 0;
            (*h).root = INVALID_NODE;
        }
    }

    fn bump_generation(&self) {
        self.header().generation.fetch_add(1, Ordering::Release);
    }

    pub fn generation(&self) -> u32 {
        self.header().generation.load(Ordering::Acquire)
    }

    pub fn node_count(&self) -> u32 {
        *self.used.lock().expect("stats lock")
    }

    /// Add a named node under `parent` (`None` = top level). Value nodes
    /// carry a counter; group nodes only structure the tree.
    pub fn add_node(
        &self,
        parent: Option<StatNode>,
        name: &str,
        with_value: bool,
    ) -> Result<StatNode, StatsError> {
        if name.len() >= NODE_NAME_MAX {
            return Err(StatsError::NameTooLong);
        }
        let mut used = self.used.lock().expect("stats lock");
        if *used >= self.capacity {
            return Err(StatsError::Full);
        }
        let index = *used;
        *used += 1;

        self.bump_generation();
        unsafe {
            let node = self.node_mut(index);
            (*node).name = [0; NODE_NAME_MAX];
            (&mut (*node).name)[..name.len()].copy_from_slice(name.as_bytes());
            (*node).flags = FLAG_ENABLED | if with_value { FLAG_VALUE } else { 0 };
            (*node).first_child = INVALID_NODE;
            (*node).value = AtomicU64::new(0);
            // Link as the head of the parent's child list (or the root
            // list).
            let head = match parent {
                Some(StatNode(p)) => {
                    let parent_node = self.node_mut(p);
                    let old = (*parent_node).first_child;
                    (*parent_node).first_child = index;
                    old
                }
                None => {
                    let h = self.header_mut();
                    let old = (*h).root;
                    (*h).root = index;
                    old
                }
            };
            (*node).next_sibling = head;
            (*self.header_mut()).num_nodes = *used;
        }
        self.bump_generation();
        Ok(StatNode(index))
    }

    pub fn set(&self, node: StatNode, value: u64) {
        self.node(node.0).value.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, node: StatNode, delta: u64) {
        self.node(node.0).value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, node: StatNode) -> u64 {
        self.node(node.0).value.load(Ordering::Relaxed)
    }

    pub fn name_of(&self, node: StatNode) -> String {
        let raw = &self.node(node.0).name;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NODE_NAME_MAX);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

impl Drop for StatsTree {
    fn drop(&mut self) {
        if let Backing::Shm { name, ptr, len } = &self.backing {
            unsafe {
                libc::munmap((*ptr).cast(), *len);
                libc::shm_unlink(name.as_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_tree_counts() {
        let tree = StatsTree::private(16);
        let group = tree.add_node(None, "display", false).unwrap();
        let quic = tree.add_node(Some(group), "quic_count", true).unwrap();
        let jpeg = tree.add_node(Some(group), "jpeg_count", true).unwrap();
        tree.add(quic, 3);
        tree.add(quic, 2);
        tree.set(jpeg, 40);
        assert_eq!(tree.get(quic), 5);
        assert_eq!(tree.get(jpeg), 40);
        assert_eq!(tree.name_of(jpeg), "jpeg_count");
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn generation_bumps_on_structure() {
        let tree = StatsTree::private(4);
        let g0 = tree.generation();
        tree.add_node(None, "a", true).unwrap();
        assert!(tree.generation() > g0);
    }

    #[test]
    fn capacity_and_name_limits() {
        let tree = StatsTree::private(1);
        assert!(tree.add_node(None, "this-name-is-way-too-long-for-a-node", true).is_err());
        tree.add_node(None, "ok", true).unwrap();
        assert!(matches!(
            tree.add_node(None, "full", true),
            Err(StatsError::Full)
        ));
    }

    #[test]
    fn shm_create_round_trip() {
        // Unique name per test run; falls back to private silently if the
        // host lacks /dev/shm, and the API behaves identically.
        let name = format!("vermilion-test.{}", std::process::id());
        let tree = StatsTree::create(&name, 8);
        let n = tree.add_node(None, "orig_bytes", true).unwrap();
        tree.add(n, 123);
        assert_eq!(tree.get(n), 123);
    }
}
