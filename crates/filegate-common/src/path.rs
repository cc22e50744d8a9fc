use std::path::{Component, Path};

use uuid::Uuid;

use crate::error::{FilegateError, Result};

/// Joins a client-supplied directory path and file name into a normalized
/// object key: forward slashes, no leading slash, no traversal components.
pub fn object_key(dir_path: &str, file_name: &str) -> Result<String> {
    if file_name.is_empty() {
        return Err(FilegateError::InvalidArgument(
            "file name must not be empty".to_string(),
        ));
    }
    validate_key_component(file_name)?;

    let dir = dir_path.trim().trim_matches('/');
    let key = if dir.is_empty() {
        file_name.to_string()
    } else {
        validate_key_component(dir)?;
        format!("{dir}/{file_name}")
    };
    Ok(key)
}

/// Validates an already-joined key taken from a request path.
pub fn normalize_key(raw: &str) -> Result<String> {
    let key = raw.trim_start_matches('/');
    if key.is_empty() {
        return Err(FilegateError::InvalidArgument(
            "path must not be empty".to_string(),
        ));
    }
    validate_key_component(key)?;
    Ok(key.to_string())
}

/// Derives a sibling key that does not collide with `key`, by inserting a
/// short unique fragment before the extension. Used by the upload conflict
/// `rename` strategy.
pub fn unique_object_key(key: &str) -> String {
    let (dir, file_name) = match key.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, key),
    };

    let fragment = &Uuid::new_v4().to_string()[..8];
    let renamed = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{fragment}.{ext}"),
        _ => format!("{file_name}_{fragment}"),
    };

    match dir {
        Some(dir) => format!("{dir}/{renamed}"),
        None => renamed,
    }
}

fn validate_key_component(value: &str) -> Result<()> {
    if value.contains('\\') {
        return Err(FilegateError::InvalidArgument(format!(
            "invalid path: {value}"
        )));
    }

    let path = Path::new(value);
    if path.is_absolute() {
        return Err(FilegateError::InvalidArgument(format!(
            "invalid path: {value}"
        )));
    }

    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir
            | Component::ParentDir
            | Component::RootDir
            | Component::Prefix(_) => {
                return Err(FilegateError::InvalidArgument(format!(
                    "invalid path: {value}"
                )));
            }
        }
    }

    Ok(())
}
