//! Optionally-grantable agent abilities.

use bitflags::bitflags;

bitflags! {
    /// Capability set held by an environment.
    ///
    /// Events that expose expensive or intrusive information can only be
    /// enabled by environments holding the matching capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const CAN_GENERATE_FIELD_ACCESS      = 1 << 1;
        const CAN_GENERATE_FIELD_MODIFICATION = 1 << 2;
        const CAN_GENERATE_SINGLE_STEP       = 1 << 3;
        const CAN_GENERATE_BREAKPOINTS       = 1 << 4;
        const CAN_GENERATE_FRAME_POP         = 1 << 5;
        const CAN_GENERATE_EXCEPTION_EVENTS  = 1 << 6;
        const CAN_GENERATE_METHOD_ENTRY      = 1 << 7;
        const CAN_GENERATE_METHOD_EXIT       = 1 << 8;
        const CAN_GENERATE_COMPILED_METHOD_LOAD = 1 << 9;
        const CAN_GENERATE_MONITOR_EVENTS    = 1 << 10;
        const CAN_GENERATE_VM_OBJECT_ALLOC   = 1 << 11;
        const CAN_GENERATE_SAMPLED_ALLOC     = 1 << 12;
        const CAN_GENERATE_NATIVE_METHOD_BIND = 1 << 13;
        const CAN_GENERATE_GC_EVENTS         = 1 << 14;
        const CAN_GENERATE_OBJECT_FREE       = 1 << 15;
        const CAN_GENERATE_RESOURCE_EXHAUSTION = 1 << 16;
        const CAN_SUPPORT_VIRTUAL_THREADS    = 1 << 17;
        const CAN_GENERATE_EARLY_VMSTART     = 1 << 18;
        const CAN_RETRANSFORM_CLASSES        = 1 << 19;
    }
}

impl Capabilities {
    /// Every capability this core knows about.
    pub fn potential() -> Self {
        Self::all()
    }
}
