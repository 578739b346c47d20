//! In-memory namespace tree
//!
//! The tree is a plain owned structure: every directory holds its children
//! in a `BTreeMap` keyed by name, so listings come out sorted and the whole
//! tree serializes deterministically for snapshots. Callers are responsible
//! for locking; see [`crate::store`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map;
use tracker_common::{Attributes, Error, Result};

/// Kind of a namespace entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Directory,
    File,
}

impl EntryKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::File => "file",
        }
    }
}

/// A node of the tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub attrs: Attributes,
    /// Always empty for files
    pub children: BTreeMap<String, Entry>,
}

impl Entry {
    fn directory(attrs: Attributes) -> Self {
        Self {
            kind: EntryKind::Directory,
            attrs,
            children: BTreeMap::new(),
        }
    }

    fn file(attrs: Attributes) -> Self {
        Self {
            kind: EntryKind::File,
            attrs,
            children: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    fn count(&self) -> usize {
        self.children.values().map(|c| 1 + c.count()).sum()
    }
}

/// Read-only view of one entry returned by `stat` and `list`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub path: String,
    pub kind: EntryKind,
    pub attrs: Attributes,
}

/// Split an absolute path into its components
///
/// The root is the empty slice. A single trailing slash is tolerated;
/// empty, `.` and `..` components are rejected.
pub fn components(path: &str) -> Result<Vec<&str>> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| Error::invalid_path(format!("{path}: must be absolute")))?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.is_empty() {
        return Ok(Vec::new());
    }

    rest.split('/')
        .map(|part| match part {
            "" => Err(Error::invalid_path(format!("{path}: empty component"))),
            "." | ".." => Err(Error::invalid_path(format!("{path}: relative component"))),
            part if part.contains('\0') => {
                Err(Error::invalid_path(format!("{path}: NUL in component")))
            }
            part => Ok(part),
        })
        .collect()
}

/// Canonical form of `path`: leading slash, no trailing slash
pub fn normalize(path: &str) -> Result<String> {
    Ok(join(&components(path)?))
}

fn join(parts: &[&str]) -> String {
    if parts.is_empty() {
        return "/".to_string();
    }
    parts.iter().fold(String::new(), |mut acc, part| {
        acc.push('/');
        acc.push_str(part);
        acc
    })
}

/// The namespace tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceTree {
    root: Entry,
}

impl Default for NamespaceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceTree {
    /// Tree holding only the root directory
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Entry::directory(Attributes::new()),
        }
    }

    /// Number of entries, root excluded
    #[must_use]
    pub fn len(&self) -> usize {
        self.root.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Create `path` and every missing ancestor
    ///
    /// `attrs` land on the final directory only. Returns `false` when the
    /// directory already exists, leaving its attributes untouched.
    pub fn mkdir(&mut self, path: &str, attrs: &Attributes) -> Result<bool> {
        let parts = components(path)?;
        let last = parts.len().saturating_sub(1);
        let mut created = false;
        let mut cur = &mut self.root;

        for (i, name) in parts.iter().enumerate() {
            let child = match cur.children.entry((*name).to_string()) {
                btree_map::Entry::Occupied(e) => e.into_mut(),
                btree_map::Entry::Vacant(e) => {
                    created = true;
                    let attrs = if i == last { attrs.clone() } else { Attributes::new() };
                    e.insert(Entry::directory(attrs))
                }
            };
            // Only an existing entry can be a file, so nothing was created yet
            if !child.is_dir() {
                return Err(Error::NotADirectory(join(&parts[..=i])));
            }
            cur = child;
        }
        Ok(created)
    }

    /// Create a file under an existing directory
    ///
    /// Returns `false` without side effect when `path` already exists.
    pub fn create_file(&mut self, path: &str, attrs: &Attributes) -> Result<bool> {
        let parts = components(path)?;
        let Some((name, parent)) = parts.split_last() else {
            return Err(Error::invalid_path("/: cannot create the root"));
        };

        let dir = self.dir_mut(parent)?;
        match dir.children.entry((*name).to_string()) {
            btree_map::Entry::Occupied(_) => Ok(false),
            btree_map::Entry::Vacant(e) => {
                e.insert(Entry::file(attrs.clone()));
                Ok(true)
            }
        }
    }

    /// Remove a file
    ///
    /// Returns `false` without side effect when `path` does not exist.
    pub fn delete_file(&mut self, path: &str) -> Result<bool> {
        let parts = components(path)?;
        let Some((name, parent)) = parts.split_last() else {
            return Err(Error::IsADirectory("/".to_string()));
        };

        let Ok(dir) = self.dir_mut(parent) else {
            return Ok(false);
        };
        match dir.children.get(*name) {
            None => Ok(false),
            Some(entry) if entry.is_dir() => Err(Error::IsADirectory(join(&parts))),
            Some(_) => Ok(dir.children.remove(*name).is_some()),
        }
    }

    /// Look up an entry
    pub fn get(&self, path: &str) -> Result<Option<&Entry>> {
        let parts = components(path)?;
        let mut cur = &self.root;
        for name in parts {
            match cur.children.get(name) {
                Some(child) => cur = child,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    pub fn stat(&self, path: &str) -> Result<Option<EntryInfo>> {
        let path = normalize(path)?;
        Ok(self.get(&path)?.map(|entry| EntryInfo {
            kind: entry.kind,
            attrs: entry.attrs.clone(),
            path,
        }))
    }

    /// Children of a directory, sorted by name
    pub fn list(&self, path: &str) -> Result<Vec<EntryInfo>> {
        let path = normalize(path)?;
        let entry = self
            .get(&path)?
            .ok_or_else(|| Error::PathNotFound(path.clone()))?;
        if !entry.is_dir() {
            return Err(Error::NotADirectory(path));
        }

        let prefix = if path == "/" { "" } else { path.as_str() };
        Ok(entry
            .children
            .iter()
            .map(|(name, child)| EntryInfo {
                path: format!("{prefix}/{name}"),
                kind: child.kind,
                attrs: child.attrs.clone(),
            })
            .collect())
    }

    fn dir_mut(&mut self, parts: &[&str]) -> Result<&mut Entry> {
        let mut cur = &mut self.root;
        for (i, name) in parts.iter().enumerate() {
            let child = cur
                .children
                .get_mut(*name)
                .ok_or_else(|| Error::ParentNotFound(join(&parts[..=i])))?;
            if !child.is_dir() {
                return Err(Error::NotADirectory(join(&parts[..=i])));
            }
            cur = child;
        }
        Ok(cur)
    }
}
