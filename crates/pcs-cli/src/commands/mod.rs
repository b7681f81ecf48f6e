//! CLI commands

use std::fmt::Display;
use std::path::Path;

use crate::{Error, Result};

pub mod deploy;
pub mod login;
pub mod logout;

/// Turns helper-process and decoding failures into [`Error::CommandFailed`].
///
/// Used where `pcs login` shells out to the Azure CLI and the failure text is
/// all there is to report.
pub trait CommandErrorExt<T> {
    /// Keep the error's message, drop its type
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Read a user-supplied file, naming it in the error.
pub fn read_input_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::InputFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
