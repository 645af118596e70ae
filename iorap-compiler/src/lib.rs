//! Trace-file codec (C1), inode resolver (C2), and merge/sort compiler (C3).

pub mod codec;
pub mod compiler;
pub mod resolver;

pub use compiler::{compile, compile_entries, make_compilation_inputs, CompilationInput, CompileOptions};
pub use resolver::{DataSource, InodeResolver, VerifyKind};
