//! Canonical-path containment for server file access.
//!
//! Every filename taken from the wire must resolve to a path beneath the
//! server's base directory. The check runs before any existence check, so a
//! traversal attempt cannot probe the filesystem outside the base.

use std::path::{Component, Path, PathBuf};

use crate::error::Error;
use crate::protocol::ErrorCode;

/// Resolve `requested` against `base`, enforcing containment.
///
/// The base directory is canonicalized and the requested name is resolved
/// against it component by component; `..` segments may not climb above the
/// base and absolute names are rejected outright. Containment is a
/// path-segment prefix check, so a sibling such as `base-other/` never
/// passes. If the resolved path already exists it is canonicalized again to
/// catch symlinks pointing outside the base.
pub fn resolve(base: &Path, requested: &str) -> Result<PathBuf, Error> {
    let canonical_base = base
        .canonicalize()
        .map_err(|_| access_violation(requested))?;

    let mut resolved = canonical_base.clone();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() || !resolved.starts_with(&canonical_base) {
                    return Err(access_violation(requested));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(access_violation(requested));
            }
        }
    }

    if !resolved.starts_with(&canonical_base) || resolved == canonical_base {
        return Err(access_violation(requested));
    }

    // Re-check through symlinks for paths that already exist.
    if resolved.exists() {
        let through_links = resolved.canonicalize()?;
        if !through_links.starts_with(&canonical_base) {
            return Err(access_violation(requested));
        }
        return Ok(through_links);
    }

    Ok(resolved)
}

fn access_violation(requested: &str) -> Error {
    Error::protocol(
        ErrorCode::AccessViolation,
        format!("access violation for {requested:?}"),
    )
}
