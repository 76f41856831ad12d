/// Full name of the method interceptor contract.
pub const METHOD_INTERCEPTOR_INTERFACE: &str = "Loom.Interception.IMethodInterceptor";

/// Full name of the contract of interceptors that need a synchronization
/// root.
pub const SYNC_ROOT_INTERFACE: &str = "Loom.Interception.ISyncRoot";

/// Attribute placed on interceptor fields that receive an injected value.
pub const ASSIGN_FIELD_ATTRIBUTE: &str = "Loom.Interception.AssignFieldAttribute";

/// Attribute excluding a method from type-wide interception.
pub const IGNORE_INTERCEPTION_ATTRIBUTE: &str = "Loom.Interception.IgnoreInterceptionAttribute";

pub const ON_ENTER: &str = "OnEnter";
pub const ON_EXCEPTION: &str = "OnException";
pub const ON_EXIT: &str = "OnExit";
pub const SYNC_ROOT_SETTER: &str = "set_SyncRoot";

pub const EXCEPTION_TYPE: &str = "System.Exception";
pub const OBJECT_TYPE: &str = loomir::coder::OBJECT_TYPE;

/// Builder calls completing the task of an asynchronous method.
pub const ASYNC_COMPLETION_METHODS: [&str; 2] = ["SetResult", "SetException"];

/// Field of a state machine holding the instance the asynchronous method was
/// called on.
pub const STATE_MACHINE_THIS_FIELD: &str = "<>4__this";

pub const INSTANCE_ROOT_FIELD: &str = "<>_syncObject";
pub const STATIC_ROOT_FIELD: &str = "<>_staticSyncObject";

/// Name of the environment variable containing the path to the weaver
/// configuration file.
/// If not set, defaults to `loom.toml` in the current directory.
pub const ENV_CONFIG_PATH: &str = "LOOM_CONFIG_PATH";

/// Default name of the configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "loom.toml";

/// Magic bytes identifying stored program units.
pub const STORAGE_MAGIC_BYTES: [u8; 8] = *b"\0LOOMPU\0";
