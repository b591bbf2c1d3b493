//! Small shared utilities: JSON path access, the frame predicate language,
//! and the cross-event tool-call assembler.

pub mod json_path;
pub mod predicate;
pub mod tool_call_assembler;

pub use json_path::{JsonPath, PathMapper};
pub use predicate::Predicate;
pub use tool_call_assembler::ToolCallAssembler;
