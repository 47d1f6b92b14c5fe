use std::path::{Component, Path};

use crate::{PENDING_DIR, TransferError};

/// Validates that a relative file path does not escape its base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_upload_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::Validation("empty path".into()));
    }

    let path = Path::new(file_path);

    if path.is_absolute() {
        return Err(TransferError::Validation(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::Validation(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::Validation(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::Validation(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Validates a promotion destination.
///
/// On top of [`validate_upload_path`], the path must name a file and must not
/// point into the pending namespace.
pub fn validate_destination(file_path: &str) -> Result<(), TransferError> {
    validate_upload_path(file_path)?;

    let mut normal = Path::new(file_path).components().filter_map(|c| match c {
        Component::Normal(s) => Some(s),
        _ => None,
    });
    match normal.next() {
        None => Err(TransferError::Validation(format!(
            "destination must name a file: {file_path}"
        ))),
        Some(first) if first == PENDING_DIR => Err(TransferError::Validation(format!(
            "destination inside reserved namespace: {file_path}"
        ))),
        Some(_) => Ok(()),
    }
}
