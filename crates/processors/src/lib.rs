//! `processors` crate: the `TaskProcessor` trait, the processor registry and
//! built-in processor implementations.
//!
//! Every unit of business work a workflow node performs must implement
//! [`TaskProcessor`]. The engine resolves processors by name through the
//! [`ProcessorRegistry`] and dispatches execution through the trait object.

pub mod builtin;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use error::{ProcessorError, RegistryError};
pub use registry::{ProcessorRegistry, RegistryStats};
pub use traits::{TaskContext, TaskProcessor};
