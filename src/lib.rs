//! Rewrite JVM class files as they are loaded
//!
//! A patch is described by a [`PatchScript`]: a declarative rewrite such as
//! "wrap every return value of `java.lang.String::toLowerCase`" or "add a
//! field to this class". Scripts are registered with a [`ScriptManager`],
//! which the host runtime (a JVMTI agent, a test harness, an offline tool)
//! calls with `(class name, class bytes)` pairs; the manager runs every
//! script in registration order and hands back the rewritten bytes.
//!
//! ### Example
//!
//! ```no_run
//! use classpatch::{Hook, MethodTarget, ScriptManager, StackRequest};
//! use classpatch::scripts::ScriptBuilder;
//!
//! # fn run() -> Result<(), classpatch::Error> {
//! let script = ScriptBuilder::wrap_return_value()
//!     .target(MethodTarget::with_signature(
//!         "com.example.Session", "token", "java.lang.String", &[])?)
//!     .wrap_method(Hook::new(
//!         "com/example/Auditor", "onToken",
//!         "java.lang.String", &["java.lang.String", "java.lang.Object"]))
//!     .request(&[StackRequest::ReturnValue, StackRequest::This])
//!     .build()?;
//!
//! let mut manager = ScriptManager::new();
//! manager.add_script(script);
//!
//! // from the class-load callback of the host runtime:
//! # let class_bytes: &[u8] = &[];
//! if let Some(patched) = manager.transform(None, Some("com/example/Session"), false, class_bytes) {
//!     // hand `patched` back to the runtime
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The five primitive rewrites, their builders, and the rules for hooks,
//! transplant and insert are documented on [`scripts::ScriptBuilder`].

pub mod classfile;
pub mod descriptor;
mod error;
mod hook;
mod logistics;
pub mod manager;
pub mod resolve;
pub mod scripts;
pub mod symbols;
mod target;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::Error;
pub use hook::Hook;
pub use logistics::MethodLogistics;
pub use manager::{Filter, RuntimeHost, ScriptManager};
pub use scripts::{PatchScript, StackRequest};
pub use target::{MethodTarget, TargetMatcher};
