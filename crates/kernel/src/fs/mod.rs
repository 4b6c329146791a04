//! Filesystem registry
//!
//! Mounted filesystems are keyed by name; a path's leading segment
//! selects the mount and the rest is handed to the driver. The raw
//! `DF_FS_*` command ids exist only at the driver-call gate; inside the
//! kernel the drivers implement the typed interface below.

pub mod file;
pub mod glob;
pub mod ext2;

pub use self::file::{FileAttributes, FileHandle, OpenFlags};

use crate::klib::{KernelError, Result};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

/// An opened file (or directory enumeration handle).
pub type File = Box<dyn FileHandle>;

/// Typed interface every filesystem driver implements.
pub trait FileSystemDriver: Send + Sync {
    /// Mount name, e.g. `C:` or `pkg`.
    fn name(&self) -> &str;

    fn open(&self, path: &str, flags: OpenFlags) -> Result<File>;

    fn create_folder(&self, path: &str) -> Result<()>;

    fn path_exists(&self, path: &str) -> Result<bool>;

    fn file_exists(&self, path: &str) -> Result<bool>;

    /// Release the mount. Refused while open files remain.
    fn unmount(&self) -> Result<()>;
}

static MOUNTS: RwLock<Vec<Arc<dyn FileSystemDriver>>> = RwLock::new(Vec::new());

/// Register a mounted filesystem under its name.
pub fn mount(filesystem: Arc<dyn FileSystemDriver>) -> Result<()> {
    let _fs_lock = crate::sync::lock_filesystem();
    let mut mounts = MOUNTS.write();
    if mounts.iter().any(|m| m.name() == filesystem.name()) {
        return Err(KernelError::AlreadyExists);
    }
    crate::info!("fs: mounted '{}'", filesystem.name());
    mounts.push(filesystem);
    Ok(())
}

/// Remove a mount by name. The driver may refuse (open files).
pub fn unmount(name: &str) -> Result<()> {
    let _fs_lock = crate::sync::lock_filesystem();
    let mut mounts = MOUNTS.write();
    let position = mounts
        .iter()
        .position(|m| m.name() == name)
        .ok_or(KernelError::NotFound)?;
    mounts[position].unmount()?;
    mounts.remove(position);
    crate::info!("fs: unmounted '{}'", name);
    Ok(())
}

pub fn mounted_names() -> Vec<String> {
    MOUNTS.read().iter().map(|m| String::from(m.name())).collect()
}

/// Split a path into its mount and the driver-relative subpath.
pub fn resolve(path: &str) -> Result<(Arc<dyn FileSystemDriver>, String)> {
    if path.is_empty() {
        return Err(KernelError::InvalidArgument);
    }

    let (mount_name, subpath) = match path.find('/') {
        Some(position) => (&path[..position], &path[position + 1..]),
        None => (path, ""),
    };

    let mounts = MOUNTS.read();
    let filesystem = mounts
        .iter()
        .find(|m| m.name() == mount_name)
        .cloned()
        .ok_or(KernelError::NotFound)?;

    Ok((filesystem, String::from(subpath)))
}

/// Open a file through its mount.
pub fn open_file(path: &str, flags: OpenFlags) -> Result<File> {
    let (filesystem, subpath) = resolve(path)?;
    filesystem.open(&subpath, flags)
}

/// Close a handle. Drivers release their bookkeeping in the handle's
/// drop.
pub fn close_file(file: File) -> Result<()> {
    drop(file);
    Ok(())
}

pub fn create_folder(path: &str) -> Result<()> {
    let (filesystem, subpath) = resolve(path)?;
    filesystem.create_folder(&subpath)
}

pub fn path_exists(path: &str) -> Result<bool> {
    let (filesystem, subpath) = resolve(path)?;
    filesystem.path_exists(&subpath)
}

pub fn file_exists(path: &str) -> Result<bool> {
    let (filesystem, subpath) = resolve(path)?;
    filesystem.file_exists(&subpath)
}

#[cfg(test)]
pub(crate) fn reset_mounts_for_tests() {
    MOUNTS.write().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFs {
        name: &'static str,
    }

    impl FileSystemDriver for NullFs {
        fn name(&self) -> &str {
            self.name
        }
        fn open(&self, _path: &str, _flags: OpenFlags) -> Result<File> {
            Err(KernelError::NotFound)
        }
        fn create_folder(&self, _path: &str) -> Result<()> {
            Err(KernelError::PermissionDenied)
        }
        fn path_exists(&self, path: &str) -> Result<bool> {
            Ok(path == "present")
        }
        fn file_exists(&self, _path: &str) -> Result<bool> {
            Ok(false)
        }
        fn unmount(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn resolve_routes_by_leading_segment() {
        let _guard = crate::test_utils::serialize();
        reset_mounts_for_tests();
        mount(Arc::new(NullFs { name: "C:" })).unwrap();
        mount(Arc::new(NullFs { name: "D:" })).unwrap();

        let (fs, sub) = resolve("C:/SYS/PRG").unwrap();
        assert_eq!(fs.name(), "C:");
        assert_eq!(sub, "SYS/PRG");

        let (fs, sub) = resolve("D:").unwrap();
        assert_eq!(fs.name(), "D:");
        assert_eq!(sub, "");

        assert!(matches!(resolve("E:/x"), Err(KernelError::NotFound)));

        assert!(path_exists("C:/present").unwrap());
        assert!(!path_exists("C:/absent").unwrap());

        reset_mounts_for_tests();
    }

    #[test]
    fn duplicate_mount_names_are_rejected() {
        let _guard = crate::test_utils::serialize();
        reset_mounts_for_tests();
        mount(Arc::new(NullFs { name: "C:" })).unwrap();
        assert!(matches!(
            mount(Arc::new(NullFs { name: "C:" })),
            Err(KernelError::AlreadyExists)
        ));
        reset_mounts_for_tests();
    }
}
