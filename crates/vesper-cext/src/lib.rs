//! Vesper C extension bridge.
//!
//! Lets extension modules compiled against a reference-counted C object
//! ABI run on top of the managed Vesper runtime:
//! - every managed value crossing the boundary gets a stable handle backed
//!   by a real allocation extension code can poke at;
//! - managed classes are mirrored as native type structs with slot
//!   dispatch tables;
//! - native functions are called through a closed set of calling
//!   conventions, and native code calls back in through slot trampolines
//!   and the exported `vx_*` entry points.
//!
//! The entry point is [`Bridge`]; see [`bridge`] for the lifecycle.

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod abi;
pub mod bridge;
pub mod class;
pub mod loader;
pub mod marshal;
pub mod module_loader;
pub mod monitor;
pub mod value;

// Internal machinery: type struct synthesis and the slot catalog.
mod mirror;
mod slots;

// Re-export commonly used types
pub use bridge::{Bridge, BridgeStats, Builtins};
pub use class::ClassObject;
pub use loader::{ExtensionLoader, LoadError, LoadedLibrary};
pub use marshal::outgoing::NativeTarget;
pub use marshal::shape::CallShape;
pub use marshal::MarshalError;
pub use module_loader::load_module;
pub use monitor::CollectRequest;
pub use value::{ClassRef, ManagedObject, ObjectRef, Payload, RuntimeError, Value};
