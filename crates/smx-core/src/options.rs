//! Machine configuration

/// Default number of frames captured in a stack trace
pub const DEFAULT_TRACE_DEPTH: usize = 32;

/// Resource limits for a Machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum instructions per top-level execution (None = unlimited)
    pub max_step_budget: Option<u64>,

    /// Maximum nested `call` frames (None = unlimited)
    pub max_call_depth: Option<usize>,
}

impl ResourceLimits {
    /// Create unlimited resource limits
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Create resource limits with an instruction step budget
    pub fn with_step_budget(max_step_budget: u64) -> Self {
        Self {
            max_step_budget: Some(max_step_budget),
            ..Default::default()
        }
    }

    /// Create resource limits with a call depth limit
    pub fn with_call_depth(max_call_depth: usize) -> Self {
        Self {
            max_call_depth: Some(max_call_depth),
            ..Default::default()
        }
    }
}

/// Options used when creating a Machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmOptions {
    /// Resource limits
    pub limits: ResourceLimits,

    /// Maximum frames captured in stack traces
    pub trace_depth: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            trace_depth: DEFAULT_TRACE_DEPTH,
        }
    }
}

impl VmOptions {
    /// Options with the given resource limits
    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self {
            limits,
            ..Default::default()
        }
    }
}
