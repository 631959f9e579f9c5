//! Well-known JDWP command sets and error codes, used for logging and `Display`.

pub const CMD_SET_VM: u8 = 1;
pub const CMD_SET_REFTYPE: u8 = 2;
pub const CMD_SET_CLASSTYPE: u8 = 3;
pub const CMD_SET_ARRAYTYPE: u8 = 4;
pub const CMD_SET_INTERFACETYPE: u8 = 5;
pub const CMD_SET_METHOD: u8 = 6;
pub const CMD_SET_FIELD: u8 = 8;
pub const CMD_SET_OBJREF: u8 = 9;
pub const CMD_SET_STRINGREF: u8 = 10;
pub const CMD_SET_THREADREF: u8 = 11;
pub const CMD_SET_THREADGROUPREF: u8 = 12;
pub const CMD_SET_ARRAYREF: u8 = 13;
pub const CMD_SET_CLASSLOADERREF: u8 = 14;
pub const CMD_SET_EVENTREQUEST: u8 = 15;
pub const CMD_SET_STACKFRAME: u8 = 16;
pub const CMD_SET_CLASSOBJECTREF: u8 = 17;
pub const CMD_SET_MODULEREF: u8 = 18;
pub const CMD_SET_EVENT: u8 = 64;
/// Android vendor extension carrying DDMS chunks.
pub const CMD_SET_DDMS: u8 = 0xC7;

pub const CMD_VM_VERSION: u8 = 1;
pub const CMD_VM_ALL_THREADS: u8 = 4;
pub const CMD_VM_DISPOSE: u8 = 6;
pub const CMD_VM_ID_SIZES: u8 = 7;
pub const CMD_VM_SUSPEND: u8 = 8;
pub const CMD_VM_RESUME: u8 = 9;
pub const CMD_VM_EXIT: u8 = 10;
pub const CMD_DDMS_CHUNK: u8 = 1;

pub const ERROR_NONE: u16 = 0;
pub const ERROR_INVALID_THREAD: u16 = 10;
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_NOT_IMPLEMENTED: u16 = 99;
pub const ERROR_VM_DEAD: u16 = 112;

pub fn command_set_name(cmd_set: u8) -> Option<&'static str> {
    Some(match cmd_set {
        CMD_SET_VM => "VirtualMachine",
        CMD_SET_REFTYPE => "ReferenceType",
        CMD_SET_CLASSTYPE => "ClassType",
        CMD_SET_ARRAYTYPE => "ArrayType",
        CMD_SET_INTERFACETYPE => "InterfaceType",
        CMD_SET_METHOD => "Method",
        CMD_SET_FIELD => "Field",
        CMD_SET_OBJREF => "ObjectReference",
        CMD_SET_STRINGREF => "StringReference",
        CMD_SET_THREADREF => "ThreadReference",
        CMD_SET_THREADGROUPREF => "ThreadGroupReference",
        CMD_SET_ARRAYREF => "ArrayReference",
        CMD_SET_CLASSLOADERREF => "ClassLoaderReference",
        CMD_SET_EVENTREQUEST => "EventRequest",
        CMD_SET_STACKFRAME => "StackFrame",
        CMD_SET_CLASSOBJECTREF => "ClassObjectReference",
        CMD_SET_MODULEREF => "ModuleReference",
        CMD_SET_EVENT => "Event",
        CMD_SET_DDMS => "DDMS",
        _ => return None,
    })
}

pub fn error_code_name(error_code: u16) -> Option<&'static str> {
    Some(match error_code {
        ERROR_NONE => "NONE",
        ERROR_INVALID_THREAD => "INVALID_THREAD",
        11 => "INVALID_THREAD_GROUP",
        12 => "INVALID_PRIORITY",
        13 => "THREAD_NOT_SUSPENDED",
        14 => "THREAD_SUSPENDED",
        15 => "THREAD_NOT_ALIVE",
        ERROR_INVALID_OBJECT => "INVALID_OBJECT",
        21 => "INVALID_CLASS",
        22 => "CLASS_NOT_PREPARED",
        23 => "INVALID_METHODID",
        24 => "INVALID_LOCATION",
        25 => "INVALID_FIELDID",
        30 => "INVALID_FRAMEID",
        31 => "NO_MORE_FRAMES",
        32 => "OPAQUE_FRAME",
        33 => "NOT_CURRENT_FRAME",
        34 => "TYPE_MISMATCH",
        35 => "INVALID_SLOT",
        40 => "DUPLICATE",
        41 => "NOT_FOUND",
        50 => "INVALID_MONITOR",
        51 => "NOT_MONITOR_OWNER",
        52 => "INTERRUPT",
        60 => "INVALID_CLASS_FORMAT",
        61 => "CIRCULAR_CLASS_DEFINITION",
        62 => "FAILS_VERIFICATION",
        63 => "ADD_METHOD_NOT_IMPLEMENTED",
        64 => "SCHEMA_CHANGE_NOT_IMPLEMENTED",
        65 => "INVALID_TYPESTATE",
        66 => "HIERARCHY_CHANGE_NOT_IMPLEMENTED",
        67 => "DELETE_METHOD_NOT_IMPLEMENTED",
        68 => "UNSUPPORTED_VERSION",
        69 => "NAMES_DONT_MATCH",
        70 => "CLASS_MODIFIERS_CHANGE_NOT_IMPLEMENTED",
        71 => "METHOD_MODIFIERS_CHANGE_NOT_IMPLEMENTED",
        ERROR_NOT_IMPLEMENTED => "NOT_IMPLEMENTED",
        100 => "NULL_POINTER",
        101 => "ABSENT_INFORMATION",
        102 => "INVALID_EVENT_TYPE",
        103 => "ILLEGAL_ARGUMENT",
        110 => "OUT_OF_MEMORY",
        111 => "ACCESS_DENIED",
        ERROR_VM_DEAD => "VM_DEAD",
        113 => "INTERNAL",
        115 => "UNATTACHED_THREAD",
        500 => "INVALID_TAG",
        502 => "ALREADY_INVOKING",
        503 => "INVALID_INDEX",
        504 => "INVALID_LENGTH",
        506 => "INVALID_STRING",
        507 => "INVALID_CLASS_LOADER",
        508 => "INVALID_ARRAY",
        509 => "TRANSPORT_LOAD",
        510 => "TRANSPORT_INIT",
        511 => "NATIVE_METHOD",
        512 => "INVALID_COUNT",
        _ => return None,
    })
}
