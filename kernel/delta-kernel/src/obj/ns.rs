//! The namespace: a process-global string-to-object registry.
//!
//! An open hash table (FNV-1a, chained buckets, rehash at 3/4 load) maps
//! paths like `$devices/system` to object references. Each entry holds one
//! reference to its object. Synthetic directory objects expose slices of the
//! flat table through the generic `lookup`/`readdir` interface so userspace
//! can enumerate `$devices` like any directory.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use delta_core::sync::SpinLock;
use delta_syscall::{Dirent, Error, Stat};

use super::{KernelObject, ObjectRef, ObjectType};

const INITIAL_BUCKETS: usize = 32;
const LOAD_FACTOR_NUM: usize = 3;
const LOAD_FACTOR_DEN: usize = 4;

/// FNV-1a, the classic fast string hash.
fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in s.as_bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

struct NsEntry {
    name: String,
    obj: ObjectRef,
    next: Option<Box<NsEntry>>,
}

/// The hash table behind the global namespace.
pub struct Namespace {
    buckets: Vec<Option<Box<NsEntry>>>,
    entries: usize,
}

impl Namespace {
    /// Creates an empty namespace.
    pub fn new() -> Self {
        let mut buckets = Vec::new();
        buckets.resize_with(INITIAL_BUCKETS, || None);
        Self {
            buckets,
            entries: 0,
        }
    }

    fn bucket_of(&self, name: &str) -> usize {
        hash_str(name) as usize % self.buckets.len()
    }

    fn rehash(&mut self) {
        let new_count = self.buckets.len() * 2;
        let mut new_buckets: Vec<Option<Box<NsEntry>>> = Vec::new();
        new_buckets.resize_with(new_count, || None);

        for head in self.buckets.drain(..) {
            let mut cursor = head;
            while let Some(mut entry) = cursor {
                cursor = entry.next.take();
                let idx = hash_str(&entry.name) as usize % new_count;
                entry.next = new_buckets[idx].take();
                new_buckets[idx] = Some(entry);
            }
        }
        self.buckets = new_buckets;
    }

    /// Registers `obj` under `name`, taking one reference.
    pub fn register(&mut self, name: &str, obj: ObjectRef) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if self.entries * LOAD_FACTOR_DEN >= self.buckets.len() * LOAD_FACTOR_NUM {
            self.rehash();
        }

        let idx = self.bucket_of(name);
        let mut cursor = self.buckets[idx].as_deref();
        while let Some(entry) = cursor {
            if entry.name == name {
                return Err(Error::AlreadyExists);
            }
            cursor = entry.next.as_deref();
        }

        let entry = Box::new(NsEntry {
            name: name.to_string(),
            obj,
            next: self.buckets[idx].take(),
        });
        self.buckets[idx] = Some(entry);
        self.entries += 1;
        Ok(())
    }

    /// Looks up `name`, returning a new reference.
    pub fn lookup(&self, name: &str) -> Option<ObjectRef> {
        let idx = self.bucket_of(name);
        let mut cursor = self.buckets[idx].as_deref();
        while let Some(entry) = cursor {
            if entry.name == name {
                return Some(entry.obj.clone());
            }
            cursor = entry.next.as_deref();
        }
        None
    }

    /// Removes `name`, dropping the table's reference.
    pub fn unregister(&mut self, name: &str) -> Result<(), Error> {
        let idx = self.bucket_of(name);
        // Rebuild the chain without the removed entry; order within a
        // bucket is irrelevant.
        let mut head = self.buckets[idx].take();
        let mut kept: Option<Box<NsEntry>> = None;
        let mut result = Err(Error::NotFound);
        while let Some(mut entry) = head {
            head = entry.next.take();
            if result.is_err() && entry.name == name {
                self.entries -= 1;
                result = Ok(());
            } else {
                entry.next = kept;
                kept = Some(entry);
            }
        }
        self.buckets[idx] = kept;
        result
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether the namespace is empty.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Fills `entries` with children of `prefix` starting at `*index`.
    ///
    /// Nested registrations (`$devices/disks/nvme0`) surface as a single
    /// directory component (`disks`), deduplicated across the scan.
    pub fn readdir_prefix(
        &self,
        prefix: &str,
        entries: &mut [Dirent],
        index: &mut u32,
    ) -> usize {
        let mut filled = 0usize;
        let mut current = 0u32;
        let skip = *index;

        for bucket in &self.buckets {
            let mut cursor = bucket.as_deref();
            while let Some(entry) = cursor {
                cursor = entry.next.as_deref();
                if filled >= entries.len() {
                    break;
                }
                let Some(sub) = entry.name.strip_prefix(prefix) else {
                    continue;
                };
                if sub.is_empty() {
                    current += 1;
                    continue;
                }

                if current >= skip {
                    let mut dirent = Dirent::default();
                    match sub.split_once('/') {
                        Some((dir, _)) => {
                            dirent.set_name(dir);
                            dirent.entry_type = ObjectType::Dir as u32;
                        }
                        None => {
                            dirent.set_name(sub);
                            dirent.entry_type = entry.obj.obj_type() as u32;
                        }
                    }

                    let duplicate = entries[..filled]
                        .iter()
                        .any(|e| e.name_str() == dirent.name_str());
                    if !duplicate {
                        entries[filled] = dirent;
                        filled += 1;
                    }
                }
                current += 1;
            }
        }

        *index = skip + filled as u32;
        filled
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global namespace and path resolution
// ---------------------------------------------------------------------------

/// The global registry. Protected by a single lock; lookups are short.
static NAMESPACE: SpinLock<Option<Namespace>> = SpinLock::new(None);

/// Initializes the global namespace.
///
/// # Panics
///
/// Panics on double initialization.
pub fn init() {
    let mut ns = NAMESPACE.lock();
    assert!(ns.is_none(), "namespace already initialized");
    *ns = Some(Namespace::new());
}

fn with_ns<R>(f: impl FnOnce(&mut Namespace) -> R) -> R {
    let mut ns = NAMESPACE.lock();
    f(ns.as_mut().expect("namespace not initialized"))
}

/// Registers `obj` under `path` in the global namespace.
pub fn register(path: &str, obj: ObjectRef) -> Result<(), Error> {
    with_ns(|ns| ns.register(path, obj))
}

/// Looks up `path` in the global namespace.
pub fn lookup(path: &str) -> Option<ObjectRef> {
    with_ns(|ns| ns.lookup(path))
}

/// Removes `path` from the global namespace.
pub fn unregister(path: &str) -> Result<(), Error> {
    with_ns(|ns| ns.unregister(path))
}

/// Maximum resolved path length.
pub const PATH_MAX: usize = 512;

/// Joins `path` onto `cwd` when relative, yielding an absolute or
/// namespace-rooted path.
pub fn absolutize(path: &str, cwd: &str) -> Result<String, Error> {
    let joined = if path.starts_with('/') || path.starts_with('$') {
        path.to_string()
    } else {
        let mut s = String::with_capacity(cwd.len() + 1 + path.len());
        s.push_str(cwd);
        if !cwd.ends_with('/') {
            s.push('/');
        }
        s.push_str(path);
        s
    };
    if joined.len() >= PATH_MAX {
        return Err(Error::InvalidArgument);
    }
    Ok(joined)
}

/// Resolves a path to an object reference.
///
/// Paths beginning with `$` name a namespace root (`$files`, `$devices`,
/// `$kernel`, `$gui`); `/`-rooted paths are shorthand for `$files`. The
/// resolver finds the root entry, then delegates the remainder to the root's
/// `lookup` op. Relative paths resolve against `cwd` first.
pub fn open_path(path: &str, cwd: &str) -> Result<ObjectRef, Error> {
    let full = absolutize(path, cwd)?;

    let (prefix, rest) = if let Some(rest) = full.strip_prefix('/') {
        ("$files", rest)
    } else {
        // `$prefix` or `$prefix/rest`.
        match full.split_once('/') {
            Some((prefix, rest)) => (prefix, rest),
            None => (full.as_str(), ""),
        }
    };

    let root = match lookup(prefix) {
        Some(root) => root,
        // Fall back to a flat lookup of the entire path, so objects
        // registered under a full name resolve without a root entry.
        None => return lookup(&full).ok_or(Error::NotFound),
    };

    if rest.is_empty() || rest == "." {
        return Ok(root);
    }
    root.lookup(rest)
}

// ---------------------------------------------------------------------------
// Synthetic namespace directories
// ---------------------------------------------------------------------------

/// A directory object synthesized over a namespace prefix.
///
/// `lookup("a/b")` resolves `<prefix>a/b` in the flat table; `readdir`
/// enumerates direct children.
pub struct NsDir {
    prefix: String,
}

impl NsDir {
    /// Creates a directory over `prefix` (which should end with `/` for
    /// roots, e.g. `$devices/`).
    pub fn new(prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.to_string(),
        })
    }
}

impl KernelObject for NsDir {
    fn obj_type(&self) -> ObjectType {
        ObjectType::NsDir
    }

    fn lookup(&self, name: &str) -> Result<ObjectRef, Error> {
        let mut full = self.prefix.clone();
        full.push_str(name);
        lookup(&full).ok_or(Error::NotFound)
    }

    fn readdir(&self, entries: &mut [Dirent], index: &mut u32) -> Result<usize, Error> {
        Ok(with_ns(|ns| ns.readdir_prefix(&self.prefix, entries, index)))
    }

    fn stat(&self) -> Result<Stat, Error> {
        Ok(Stat {
            obj_type: ObjectType::Dir as u32,
            ..Stat::default()
        })
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::any::Any;

    struct Dummy(u32);

    impl KernelObject for Dummy {
        fn obj_type(&self) -> ObjectType {
            ObjectType::Device
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn register_lookup_unregister_refcounts() {
        let mut ns = Namespace::new();
        let obj: ObjectRef = Arc::new(Dummy(7));
        let baseline = Arc::strong_count(&obj);

        ns.register("$devices/null", obj.clone()).unwrap();
        assert_eq!(Arc::strong_count(&obj), baseline + 1);

        let found = ns.lookup("$devices/null").unwrap();
        assert_eq!(Arc::strong_count(&obj), baseline + 2);
        assert!(Arc::ptr_eq(&found, &obj));
        drop(found);

        ns.unregister("$devices/null").unwrap();
        assert_eq!(Arc::strong_count(&obj), baseline);
        assert!(ns.lookup("$devices/null").is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut ns = Namespace::new();
        let obj: ObjectRef = Arc::new(Dummy(1));
        ns.register("$kernel/log", obj.clone()).unwrap();
        assert_eq!(
            ns.register("$kernel/log", obj).unwrap_err(),
            Error::AlreadyExists
        );
    }

    #[test]
    fn unregister_missing_is_not_found() {
        let mut ns = Namespace::new();
        assert_eq!(ns.unregister("$nope").unwrap_err(), Error::NotFound);
    }

    #[test]
    fn survives_rehash() {
        let mut ns = Namespace::new();
        let obj: ObjectRef = Arc::new(Dummy(0));
        // Push well past the initial 32 * 3/4 threshold.
        for i in 0..100 {
            let name = alloc::format!("$files/f{i}");
            ns.register(&name, obj.clone()).unwrap();
        }
        assert_eq!(ns.len(), 100);
        for i in 0..100 {
            let name = alloc::format!("$files/f{i}");
            assert!(ns.lookup(&name).is_some(), "{name} lost in rehash");
        }
    }

    #[test]
    fn readdir_prefix_flattens_nested_components() {
        let mut ns = Namespace::new();
        let obj: ObjectRef = Arc::new(Dummy(0));
        ns.register("$devices/console", obj.clone()).unwrap();
        ns.register("$devices/disks/nvme0", obj.clone()).unwrap();
        ns.register("$devices/disks/nvme1", obj.clone()).unwrap();
        ns.register("$kernel/log", obj).unwrap();

        let mut entries = [Dirent::default(); 8];
        let mut index = 0u32;
        let n = ns.readdir_prefix("$devices/", &mut entries, &mut index);

        let mut names: Vec<&str> = entries[..n].iter().map(|e| e.name_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["console", "disks"]);
        // The nested component reads as a directory.
        let disks = entries[..n]
            .iter()
            .find(|e| e.name_str() == "disks")
            .unwrap();
        assert_eq!(disks.entry_type, ObjectType::Dir as u32);
    }

    #[test]
    fn absolutize_joins_relative_paths() {
        assert_eq!(absolutize("b.txt", "/a").unwrap(), "/a/b.txt");
        assert_eq!(absolutize("b.txt", "/a/").unwrap(), "/a/b.txt");
        assert_eq!(absolutize("/abs", "/a").unwrap(), "/abs");
        assert_eq!(absolutize("$kernel/log", "/a").unwrap(), "$kernel/log");
    }
}
