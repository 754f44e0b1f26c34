pub mod cmd;
pub mod fs;
pub mod macros;
