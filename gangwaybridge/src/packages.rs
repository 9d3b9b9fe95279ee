//! Package discovery, manifests and content-addressed checksums.
//!
//! A package is a directory with a `manifest.json`, found under the
//! per-user data dir (`$XDG_DATA_HOME/gangway`) or the system data dirs
//! (`$XDG_DATA_DIRS`, each suffixed `/gangway`). User packages change too
//! often to be worth checksumming; system packages get one.
//!
//! The way checksums are constructed is not a stable interface -- it can
//! change as long as it produces a different set of checksums. It is also
//! not security sensitive: hashes are only ever compared for the same user
//! across machines, which is why plain SHA-1 is fine here.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::template;

/// Subdirectory of each data dir that holds packages.
const PACKAGE_DIR: &str = "gangway";

/// Expanded blocks this big get split before queueing...
const SPLIT_THRESHOLD: usize = 8192;
/// ...into chunks of at most this size.
const SPLIT_CHUNK: usize = 4096;

/// A valid package name: `[A-Za-z0-9_]+`.
pub fn valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// A valid checksum key: `$` followed by lowercase hex.
pub fn valid_checksum_key(name: &str) -> bool {
    match name.strip_prefix('$') {
        Some(rest) => {
            !rest.is_empty()
                && rest
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

/// A valid resource path component string: `[A-Za-z0-9._,\-/]+`.
pub fn valid_resource_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b',' | b'-' | b'/'))
}

/// Where to look for packages. Explicit so tests can pin the directories;
/// production uses [`PackageDirs::from_env`].
#[derive(Debug, Clone)]
pub struct PackageDirs {
    user: Option<PathBuf>,
    system: Vec<PathBuf>,
}

impl PackageDirs {
    /// The XDG lookup path: `$XDG_DATA_HOME/gangway` (fallback
    /// `~/.local/share/gangway`), then each `$XDG_DATA_DIRS` entry
    /// (fallback `/usr/local/share:/usr/share`) plus `/gangway`.
    pub fn from_env() -> Self {
        let user = std::env::var_os("XDG_DATA_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
            });
        let system = std::env::var("XDG_DATA_DIRS")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "/usr/local/share:/usr/share".to_string());

        Self {
            user: user.map(|dir| dir.join(PACKAGE_DIR)),
            system: system
                .split(':')
                .filter(|entry| !entry.is_empty())
                .map(|entry| PathBuf::from(entry).join(PACKAGE_DIR))
                .collect(),
        }
    }

    /// Explicit directories (each still suffixed `/gangway`). Packages in
    /// `user` get no checksum, packages in `system` do.
    pub fn new<P: AsRef<Path>>(user: Option<&Path>, system: &[P]) -> Self {
        Self {
            user: user.map(|dir| dir.join(PACKAGE_DIR)),
            system: system
                .iter()
                .map(|dir| dir.as_ref().join(PACKAGE_DIR))
                .collect(),
        }
    }

    /// Only the given system directories, no user directory. All packages
    /// get checksums.
    pub fn system_only<P: AsRef<Path>>(dirs: &[P]) -> Self {
        Self::new(None, dirs)
    }
}

/// One discovered package.
#[derive(Debug)]
pub struct Package {
    pub name: String,
    pub directory: PathBuf,
    /// The manifest with the `alias` key already stripped.
    pub manifest: Map<String, Value>,
    pub aliases: Vec<String>,
    /// Template variables referenced by this package's files.
    pub depends: BTreeSet<String>,
    /// SHA-1 over this package's own file tree; user packages have none.
    pub raw_checksum: Option<String>,
    /// `$`-prefixed final checksum with dependency checksums folded in.
    /// Missing whenever any dependency lacks a raw checksum.
    pub checksum: Option<String>,
}

/// The result of one discovery pass: packages plus every lookup key
/// (name, aliases, final checksums) pointing at them.
pub struct Listing {
    packages: Vec<Arc<Package>>,
    keys: BTreeMap<String, usize>,
}

impl Listing {
    pub fn load(dirs: &PackageDirs) -> Listing {
        let mut packages: Vec<Package> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        // User packages first (no checksum), then system dirs in order;
        // the first occurrence of a name wins.
        if let Some(user) = &dirs.user {
            discover(&mut packages, &mut seen, user, false);
        }
        for dir in &dirs.system {
            discover(&mut packages, &mut seen, dir, true);
        }

        packages.sort_by(|a, b| a.name.cmp(&b.name));

        let mut keys = BTreeMap::new();
        for (index, package) in packages.iter().enumerate() {
            keys.insert(package.name.clone(), index);
        }
        for (index, package) in packages.iter().enumerate() {
            for alias in &package.aliases {
                keys.insert(alias.clone(), index);
            }
        }

        finish_checksums(&mut packages, &keys);

        for (index, package) in packages.iter().enumerate() {
            if let Some(checksum) = &package.checksum {
                keys.entry(checksum.clone()).or_insert(index);
            }
        }

        Listing {
            packages: packages.into_iter().map(Arc::new).collect(),
            keys,
        }
    }

    /// Look a package up by name, alias or `$checksum` key.
    pub fn get(&self, key: &str) -> Option<&Arc<Package>> {
        self.keys.get(key).map(|&index| &self.packages[index])
    }

    /// Packages in primary-name order.
    pub fn packages(&self) -> &[Arc<Package>] {
        &self.packages
    }

    /// The listing as sent to the peer: one entry per package, sorted by
    /// primary name.
    pub fn to_json(&self) -> Value {
        let entries: Vec<Value> = self
            .packages
            .iter()
            .map(|package| {
                let mut ids = Vec::with_capacity(1 + package.aliases.len());
                ids.push(package.name.clone());
                ids.extend(package.aliases.iter().cloned());

                let mut entry = Map::new();
                entry.insert("id".to_string(), Value::from(ids));
                entry.insert(
                    "manifest".to_string(),
                    Value::Object(package.manifest.clone()),
                );
                if let Some(checksum) = &package.checksum {
                    entry.insert("checksum".to_string(), Value::from(checksum.clone()));
                }
                Value::Object(entry)
            })
            .collect();
        Value::from(entries)
    }

    /// Map a package/path pair to a filesystem path.
    ///
    /// This is *not* a security check -- files are accessed as the user.
    /// It keeps package authors from drawing outside the lines.
    pub fn resolve(&self, package: &str, path: &str) -> Option<PathBuf> {
        if path == ".."
            || path.contains("../")
            || path.contains("/..")
            || !valid_resource_path(path)
        {
            warn!("invalid 'path' used as a resource: {}", path);
            return None;
        }
        if !valid_checksum_key(package) && !valid_package_name(package) {
            warn!("invalid 'package' name: {}", package);
            return None;
        }
        match self.get(package) {
            Some(found) => Some(found.directory.join(path)),
            None => {
                debug!("resource package was not found: {}", package);
                None
            }
        }
    }

    /// Expand `@@package@@` markers in `input` and cut the result into
    /// transport-friendly chunks.
    ///
    /// Binary input (anything containing a NUL) is passed through as one
    /// untouched chunk. A marker becomes the package's final checksum when
    /// it has one, `name@host` when a host is known, the bare name when the
    /// package exists, and nothing at all otherwise.
    pub fn expand(&self, host: Option<&str>, input: &[u8]) -> Vec<Bytes> {
        if input.contains(&0) {
            return vec![Bytes::copy_from_slice(input)];
        }

        let blocks = template::expand(input, |name| {
            Some(match self.get(name) {
                Some(package) => {
                    if let Some(checksum) = &package.checksum {
                        Bytes::from(checksum.clone())
                    } else if let Some(host) = host {
                        Bytes::from(format!("{}@{}", package.name, host))
                    } else {
                        Bytes::from(package.name.clone())
                    }
                }
                None => Bytes::new(),
            })
        });

        let mut chunks = Vec::with_capacity(blocks.len());
        for block in blocks {
            if block.len() < SPLIT_THRESHOLD {
                chunks.push(block);
            } else {
                let mut offset = 0;
                while offset < block.len() {
                    let length = SPLIT_CHUNK.min(block.len() - offset);
                    chunks.push(block.slice(offset..offset + length));
                    offset += length;
                }
            }
        }
        chunks
    }

    /// Human-readable dump for the command line.
    pub fn dump(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        for package in &self.packages {
            writeln!(out, "{}: {}", package.name, package.directory.display())?;
            if let Some(checksum) = &package.checksum {
                writeln!(out, "    checksum: {}", checksum)?;
            }
            for alias in &package.aliases {
                writeln!(out, "    alias: {}", alias)?;
            }
        }
        Ok(())
    }
}

/// Directory entries sorted by raw byte comparison, the canonical walk
/// order for checksums and discovery alike.
fn sorted_names(directory: &Path) -> Option<Vec<String>> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("couldn't list directory: {}: {}", directory.display(), err);
            return None;
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Some(names)
}

fn discover(packages: &mut Vec<Package>, seen: &mut BTreeSet<String>, dir: &Path, checksum: bool) {
    if !dir.is_dir() {
        return;
    }
    let Some(names) = sorted_names(dir) else {
        return;
    };
    for name in names {
        if seen.contains(&name) {
            continue;
        }
        if let Some(package) = maybe_package(dir, &name, checksum) {
            debug!(
                "{}: added package at {}",
                package.name,
                package.directory.display()
            );
            seen.insert(name);
            packages.push(package);
        }
    }
}

fn maybe_package(parent: &Path, name: &str, with_checksum: bool) -> Option<Package> {
    let directory = parent.join(name);
    let mut manifest = read_manifest(&directory, name)?;

    let mut depends = BTreeSet::new();
    let raw_checksum = if with_checksum {
        Some(checksum_tree(&directory, &mut depends)?)
    } else {
        None
    };

    let aliases = take_aliases(&mut manifest, name);

    Some(Package {
        name: name.to_string(),
        directory,
        manifest,
        aliases,
        depends,
        raw_checksum,
        checksum: None,
    })
}

fn read_manifest(directory: &Path, package: &str) -> Option<Map<String, Value>> {
    if !directory.is_dir() {
        return None;
    }
    let path = directory.join("manifest.json");
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("no manifest found: {}", path.display());
            return None;
        }
        Err(err) => {
            warn!("{}: {}", package, err);
            return None;
        }
    };

    if !valid_package_name(package) {
        warn!("package has invalid name: {}", package);
        return None;
    }

    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(manifest)) => Some(manifest),
        Ok(_) => {
            warn!("{}: invalid manifest: not a JSON object", package);
            None
        }
        Err(err) => {
            warn!("{}: invalid manifest: {}", package, err);
            None
        }
    }
}

/// Pull the reserved `alias` key out of a manifest; it is lookup metadata,
/// not something the frontend should see.
fn take_aliases(manifest: &mut Map<String, Value>, package: &str) -> Vec<String> {
    let mut aliases = Vec::new();
    let mut add = |value: &Value| match value {
        Value::String(alias) if valid_package_name(alias) => {
            debug!("{}: package has alias: {}", package, alias);
            aliases.push(alias.clone());
        }
        Value::String(alias) => warn!("invalid \"alias\" package name: {:?}", alias),
        other => warn!("invalid \"alias\" value type: {}", other),
    };

    match manifest.remove("alias") {
        None => {}
        Some(Value::Array(items)) => {
            for item in &items {
                add(item);
            }
        }
        Some(node) => add(&node),
    }
    aliases
}

/// The raw checksum: a SHA-1 over the canonical walk of the package tree.
/// Template markers are collected into `depends` while the original bytes
/// are what gets hashed.
fn checksum_tree(root: &Path, depends: &mut BTreeSet<String>) -> Option<String> {
    let mut hasher = Sha1::new();
    if checksum_directory(&mut hasher, depends, root, None) {
        Some(hex::encode(hasher.finalize()))
    } else {
        None
    }
}

fn checksum_directory(
    hasher: &mut Sha1,
    depends: &mut BTreeSet<String>,
    root: &Path,
    subdir: Option<&str>,
) -> bool {
    let directory = match subdir {
        Some(subdir) => root.join(subdir),
        None => root.to_path_buf(),
    };
    let Some(names) = sorted_names(&directory) else {
        return false;
    };
    for name in names {
        let relative = match subdir {
            Some(subdir) => format!("{subdir}/{name}"),
            None => name,
        };
        if !checksum_entry(hasher, depends, root, &relative) {
            return false;
        }
    }
    true
}

fn checksum_entry(
    hasher: &mut Sha1,
    depends: &mut BTreeSet<String>,
    root: &Path,
    relative: &str,
) -> bool {
    if !valid_resource_path(relative) {
        warn!("package has an invalid path name: {}", relative);
        return false;
    }
    let path = root.join(relative);
    if path.is_dir() {
        return checksum_directory(hasher, depends, root, Some(relative));
    }

    let contents = match fs::read(&path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!("couldn't open file: {}: {}", path.display(), err);
            return false;
        }
    };

    let blocks = template::expand(&contents, |variable| {
        depends.insert(variable.to_string());
        None // hash the original bytes
    });
    let mut inner = Sha1::new();
    for block in &blocks {
        inner.update(block);
    }
    let inner_hex = hex::encode(inner.finalize());

    // File name and hex digest go in with their terminating NULs, so the
    // values cannot have a boundary discrepancy.
    hasher.update(relative.as_bytes());
    hasher.update([0u8]);
    hasher.update(inner_hex.as_bytes());
    hasher.update([0u8]);
    true
}

/// Fold every package's dependency checksums into its final checksum.
///
/// When a dependency changes its raw checksum the dependent package's final
/// checksum changes too, which is what invalidates expanded templates. A
/// dependency that is missing, or has no raw checksum, leaves the package
/// without a final checksum at all.
fn finish_checksums(packages: &mut [Package], keys: &BTreeMap<String, usize>) {
    let raw_by_index: HashMap<usize, String> = packages
        .iter()
        .enumerate()
        .filter_map(|(index, package)| {
            package.raw_checksum.clone().map(|raw| (index, raw))
        })
        .collect();

    for (index, package) in packages.iter_mut().enumerate() {
        let Some(raw) = &package.raw_checksum else {
            continue;
        };

        let mut hasher = Sha1::new();
        hasher.update(raw.as_bytes());

        let mut complete = true;
        for dependency in &package.depends {
            let Some(&dep_index) = keys.get(dependency) else {
                complete = false;
                break;
            };
            if dep_index == index {
                continue;
            }
            let Some(dep_raw) = raw_by_index.get(&dep_index) else {
                complete = false;
                break;
            };
            hasher.update(dep_raw.as_bytes());
        }

        if complete {
            package.checksum = Some(format!("${}", hex::encode(hasher.finalize())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_name_grammar() {
        assert!(valid_package_name("base1"));
        assert!(valid_package_name("ok_2"));
        assert!(!valid_package_name(""));
        assert!(!valid_package_name("has space"));
        assert!(!valid_package_name("dot.dot"));
        assert!(!valid_package_name("sub/dir"));
    }

    #[test]
    fn checksum_key_grammar() {
        assert!(valid_checksum_key("$0123abc"));
        assert!(!valid_checksum_key("0123abc"));
        assert!(!valid_checksum_key("$"));
        assert!(!valid_checksum_key("$ABC"));
        assert!(!valid_checksum_key("$012x"));
    }

    #[test]
    fn resource_path_grammar() {
        assert!(valid_resource_path("sub/dir/file.min.js"));
        assert!(valid_resource_path("odd,name-1_2"));
        assert!(!valid_resource_path(""));
        assert!(!valid_resource_path("no spaces"));
        assert!(!valid_resource_path("shell$"));
    }
}
