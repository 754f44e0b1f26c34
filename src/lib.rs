#![warn(rust_2018_idioms)]
pub mod backend;
pub mod cfg;
pub mod consts;
pub mod diagnostics;
pub mod disks;
pub mod error;
pub mod install;
pub mod media;
pub mod prelude;
pub mod util;
