//! Event payloads and the opaque runtime handles they carry.
//!
//! Handles are internal identities owned by the runtime. They are only turned
//! into agent-visible references inside a safe-call scope (see
//! [`crate::transition`]).

use crate::interfaces::ThreadKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

/// Bytecode offset within a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location(pub i64);

/// Any runtime entity that can be exposed to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    Class(ClassHandle),
    Method(MethodHandle),
    Object(ObjectHandle),
    Thread(ThreadKey),
}

/// Agent-visible reference, valid only for the callback it was created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalRef(pub u64);

/// Value carried by method exit and field modification events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Void,
    Int(i64),
    Float(f64),
    Object(ObjectHandle),
}

/// Event data handed to callbacks.
///
/// Only a representative set of shapes is modelled; kinds without specific
/// data use [`EventPayload::Empty`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Empty,
    Class {
        class: ClassHandle,
    },
    ClassUnload {
        name: String,
    },
    VirtualThread {
        vthread: ObjectHandle,
    },
    Location {
        method: MethodHandle,
        location: Location,
    },
    Method {
        method: MethodHandle,
    },
    MethodExit {
        method: MethodHandle,
        exception_exit: bool,
        return_value: Value,
    },
    FramePop {
        method: MethodHandle,
        exception_exit: bool,
    },
    Field {
        method: MethodHandle,
        location: Location,
        field_class: ClassHandle,
        object: Option<ObjectHandle>,
        field: FieldId,
        new_value: Option<Value>,
    },
    Exception {
        method: MethodHandle,
        location: Location,
        exception: ObjectHandle,
        catch_method: Option<MethodHandle>,
        catch_location: Location,
    },
    ExceptionCatch {
        method: MethodHandle,
        location: Location,
        exception: ObjectHandle,
    },
    Monitor {
        object: ObjectHandle,
    },
    MonitorWait {
        object: ObjectHandle,
        timeout_ms: i64,
    },
    MonitorWaited {
        object: ObjectHandle,
        timed_out: bool,
    },
    Allocation {
        object: ObjectHandle,
        class: ClassHandle,
        size: u64,
    },
    ObjectFree {
        tag: i64,
    },
    ResourceExhausted {
        flags: u32,
        description: String,
    },
    NativeMethodBind {
        method: MethodHandle,
        address: usize,
    },
    DynamicCode {
        name: String,
        code_begin: usize,
        code_len: usize,
    },
    CompiledMethodLoad {
        method: MethodHandle,
        code_begin: usize,
        code_size: usize,
    },
    CompiledMethodUnload {
        method: MethodHandle,
        code_begin: usize,
    },
}

impl EventPayload {
    /// Method and location for location-gated events.
    pub fn location(&self) -> Option<(MethodHandle, Location)> {
        match self {
            EventPayload::Location { method, location }
            | EventPayload::Field {
                method, location, ..
            }
            | EventPayload::Exception {
                method, location, ..
            }
            | EventPayload::ExceptionCatch {
                method, location, ..
            } => Some((*method, *location)),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<MethodHandle> {
        match self {
            EventPayload::Method { method }
            | EventPayload::MethodExit { method, .. }
            | EventPayload::FramePop { method, .. }
            | EventPayload::NativeMethodBind { method, .. }
            | EventPayload::CompiledMethodLoad { method, .. }
            | EventPayload::CompiledMethodUnload { method, .. } => Some(*method),
            _ => self.location().map(|(method, _)| method),
        }
    }
}
