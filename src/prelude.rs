pub use color_eyre::eyre::{bail, eyre, WrapErr};
pub use color_eyre::{Result, Section};
pub use serde::Deserialize;
pub use std::path::{Path, PathBuf};
