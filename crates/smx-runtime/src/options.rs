//! Runtime configuration

use smx_core::VmOptions;

/// Options used when creating a [`crate::Plugin`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Machine options
    pub vm: VmOptions,

    /// Register the standard native groups on creation
    pub register_std_natives: bool,

    /// Reject typed calls to functions without type information
    pub require_signatures: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            vm: VmOptions::default(),
            register_std_natives: true,
            require_signatures: false,
        }
    }
}

impl RuntimeOptions {
    /// Default options with the given machine options
    pub fn with_vm(vm: VmOptions) -> Self {
        Self {
            vm,
            ..Default::default()
        }
    }

    /// Options without any preregistered natives
    pub fn bare() -> Self {
        Self {
            register_std_natives: false,
            ..Default::default()
        }
    }
}
