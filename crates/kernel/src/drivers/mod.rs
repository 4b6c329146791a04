//! Driver ABI
//!
//! Every driver exposes `command(function_id, parameter) -> u32` at the
//! trap-gate boundary. Internally drivers implement typed interfaces;
//! the raw ABI exists only here and in the driver-call gate.

pub mod block;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::RwLock;

// Function ids used by the core.
pub const DF_LOAD: u32 = 0x0001;
pub const DF_UNLOAD: u32 = 0x0002;
pub const DF_GET_VERSION: u32 = 0x0003;
pub const DF_DISK_READ: u32 = 0x0100;
pub const DF_DISK_WRITE: u32 = 0x0101;
pub const DF_FS_OPENFILE: u32 = 0x0200;
pub const DF_FS_CLOSEFILE: u32 = 0x0201;
pub const DF_FS_READFILE: u32 = 0x0202;
pub const DF_FS_WRITEFILE: u32 = 0x0203;
pub const DF_FS_OPENNEXT: u32 = 0x0204;
pub const DF_FS_CREATEFOLDER: u32 = 0x0205;
pub const DF_FS_PATHEXISTS: u32 = 0x0206;
pub const DF_FS_FILEEXISTS: u32 = 0x0207;

// Out-of-core collaborator families; the core only reserves the id
// ranges.
pub const DF_MOUSE_BASE: u32 = 0x0300;
pub const DF_KEY_BASE: u32 = 0x0400;
pub const DF_GFX_BASE: u32 = 0x0500;

// Return codes.
pub const DF_RETURN_SUCCESS: u32 = 0;
pub const DF_RETURN_GENERIC: u32 = 1;
pub const DF_RETURN_BAD_PARAMETER: u32 = 2;
pub const DF_RETURN_NO_PERMISSION: u32 = 3;
pub const DF_RETURN_INPUT_OUTPUT: u32 = 4;
pub const DF_RETURN_NOT_IMPLEMENTED: u32 = 5;
pub const DF_RETURN_NO_MEMORY: u32 = 6;
pub const DF_RETURN_NO_MORE: u32 = 7;

pub const fn make_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

/// Map a kernel error onto the ABI return codes.
pub fn return_code(error: crate::klib::KernelError) -> u32 {
    use crate::klib::KernelError;
    match error {
        KernelError::InvalidArgument => DF_RETURN_BAD_PARAMETER,
        KernelError::PermissionDenied => DF_RETURN_NO_PERMISSION,
        KernelError::Io => DF_RETURN_INPUT_OUTPUT,
        KernelError::NotImplemented => DF_RETURN_NOT_IMPLEMENTED,
        KernelError::OutOfMemory => DF_RETURN_NO_MEMORY,
        KernelError::NotFound => DF_RETURN_NO_MORE,
        _ => DF_RETURN_GENERIC,
    }
}

/// Identity card every driver carries.
pub struct DriverIdentity {
    pub designer: &'static str,
    pub product: &'static str,
    pub alias: &'static str,
    pub version_major: u16,
    pub version_minor: u16,
}

/// Typed driver interface. The raw `command` ABI defaults to routing
/// through it.
pub trait Driver: Send + Sync {
    fn identity(&self) -> &DriverIdentity;

    fn load(&self) -> u32 {
        DF_RETURN_SUCCESS
    }

    fn unload(&self) -> u32 {
        DF_RETURN_SUCCESS
    }

    /// Raw ABI entry. The default handles the lifecycle/version ids and
    /// hands everything else to `command_extended`.
    fn command(&self, function: u32, parameter: u32) -> u32 {
        match function {
            DF_LOAD => self.load(),
            DF_UNLOAD => self.unload(),
            DF_GET_VERSION => {
                let identity = self.identity();
                make_version(identity.version_major, identity.version_minor)
            }
            _ => self.command_extended(function, parameter),
        }
    }

    fn command_extended(&self, _function: u32, _parameter: u32) -> u32 {
        DF_RETURN_NOT_IMPLEMENTED
    }
}

/// Registered drivers keyed by the id handed to the driver-call gate.
static DRIVERS: RwLock<BTreeMap<u32, Arc<dyn Driver>>> = RwLock::new(BTreeMap::new());

pub fn register_driver(id: u32, driver: Arc<dyn Driver>) -> crate::klib::Result<()> {
    let mut drivers = DRIVERS.write();
    if drivers.contains_key(&id) {
        return Err(crate::klib::KernelError::AlreadyExists);
    }
    crate::info!(
        "driver: registered '{}' as id {}",
        driver.identity().product,
        id
    );
    drivers.insert(id, driver);
    Ok(())
}

pub fn get_driver(id: u32) -> Option<Arc<dyn Driver>> {
    DRIVERS.read().get(&id).cloned()
}

/// Driver-call gate conversion point: raw ids in, raw code out.
pub fn dispatch_driver_command(driver_id: u32, function: u32, parameter: u32) -> u32 {
    match get_driver(driver_id) {
        Some(driver) => driver.command(function, parameter),
        None => DF_RETURN_BAD_PARAMETER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        identity: DriverIdentity,
    }

    impl Driver for Probe {
        fn identity(&self) -> &DriverIdentity {
            &self.identity
        }
    }

    #[test]
    fn version_and_unknown_commands() {
        let _guard = crate::test_utils::serialize();
        let probe = Arc::new(Probe {
            identity: DriverIdentity {
                designer: "exos",
                product: "probe",
                alias: "probe",
                version_major: 1,
                version_minor: 2,
            },
        });
        register_driver(900, probe).unwrap();

        assert_eq!(
            dispatch_driver_command(900, DF_GET_VERSION, 0),
            make_version(1, 2)
        );
        assert_eq!(
            dispatch_driver_command(900, 0xFFFF, 0),
            DF_RETURN_NOT_IMPLEMENTED
        );
        assert_eq!(
            dispatch_driver_command(901, DF_LOAD, 0),
            DF_RETURN_BAD_PARAMETER
        );
    }
}
