//! Helpers for slash separated node paths

use crate::error::{ClientError, Result};

/// Number of digits the service appends to sequential nodes
pub const SEQUENCE_DIGITS: usize = 10;

/// Check that a path is absolute, has no empty segments and no trailing slash
pub fn validate(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ClientError::invalid_path(format!(
            "{} must start with '/'",
            path
        )));
    }

    if path.len() > 1 && path.ends_with('/') {
        return Err(ClientError::invalid_path(format!(
            "{} must not end with '/'",
            path
        )));
    }

    if path.len() > 1 && path[1..].split('/').any(|segment| segment.is_empty()) {
        return Err(ClientError::invalid_path(format!(
            "{} contains an empty segment",
            path
        )));
    }

    Ok(())
}

pub fn is_root(path: &str) -> bool {
    path == "/"
}

/// Join a parent path and a child name
pub fn join(parent: &str, child: &str) -> String {
    let child = child.trim_start_matches('/');
    if is_root(parent) {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Parent of a path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if is_root(path) {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Every ancestor of `path` from the top down, excluding the root and `path`
pub fn ancestors(path: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = parent(path);
    while let Some(p) = current {
        if is_root(p) {
            break;
        }
        result.push(p.to_string());
        current = parent(p);
    }
    result.reverse();
    result
}

/// Prefix `path` with `/{namespace}` when a namespace is set
pub fn apply_namespace(namespace: &str, path: &str) -> String {
    if namespace.is_empty() {
        path.to_string()
    } else if is_root(path) {
        format!("/{}", namespace)
    } else {
        format!("/{}{}", namespace, path)
    }
}

/// Remove the `/{namespace}` prefix added by [`apply_namespace`]
pub fn strip_namespace(namespace: &str, path: &str) -> String {
    if namespace.is_empty() {
        return path.to_string();
    }
    let prefix = format!("/{}", namespace);
    match path.strip_prefix(&prefix) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path.to_string(),
    }
}

/// Sequence number suffix of a sequential node name
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_DIGITS {
        return None;
    }
    let (_, digits) = name.split_at(name.len() - SEQUENCE_DIGITS);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
