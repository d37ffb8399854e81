//! skiff — a small embeddable scripting language.
//!
//! Source text is lexed, parsed with a Pratt parser into an AST, compiled
//! to a flat stack-machine bytecode, and executed by a VM with first-class
//! closures and an incremental mark/sweep garbage collector.
//!
//! ```no_run
//! use skiff::{Engine, Value};
//!
//! let mut engine = Engine::new();
//! let result = engine
//!     .run("local x = 1; function f() { return x + 1; } return f();", "example")
//!     .unwrap();
//! assert_eq!(result, Value::Number(2.0));
//! ```

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod lexer;
pub mod parser;
pub mod vm;

pub use compiler::CompileError;
pub use vm::{Engine, EngineConfig, GcConfig, NativeFn, RuntimeError, Value};

/// Either of the two error families: compile errors are fatal to their
/// compilation unit, runtime errors unwind to the nearest host call and
/// leave the engine usable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
