//! Module resolution for sandboxed code.
//!
//! Sandboxed code can only reach two kinds of module:
//!
//! - **virtual modules**, supplied by the caller as CommonJS-shaped source and
//!   keyed by normalized path-like strings such as `./mypackage/module1`
//! - **host modules**, provided by the engine itself, and only when their
//!   exact name is on the caller's allow-list
//!
//! Anything else fails with `Cannot find module '<name>'`. There is no
//! fallback to a general-purpose module loader.
//!
//! # Examples
//!
//! ```
//! use backstage_sandbox::resolver::{ModuleResolver, ResolvedModule};
//! use std::collections::BTreeMap;
//!
//! let mut modules = BTreeMap::new();
//! modules.insert("./mypackage2/module1".to_string(), "module.exports = 1;".to_string());
//! let resolver = ModuleResolver::new(modules, ["path"])?;
//!
//! let relative = resolver.resolve_relative("mypackage2");
//! assert!(matches!(relative.resolve("./module1")?, ResolvedModule::Virtual { .. }));
//! assert!(matches!(relative.resolve("path")?, ResolvedModule::Host { .. }));
//! assert!(relative.resolve("module3").is_err());
//! # Ok::<(), backstage_core::Error>(())
//! ```

use backstage_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Host modules the engine implements inside the isolate.
pub const HOST_MODULES: &[&str] = &["path", "querystring", "util"];

/// Outcome of a successful resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedModule<'a> {
    /// A caller-supplied module; its factory runs on every resolution.
    Virtual {
        /// Normalized table key
        key: &'a str,
        /// Module source
        source: &'a str,
    },
    /// An allow-listed host module.
    Host {
        /// Module name
        name: &'a str,
    },
}

/// Resolver over a virtual module table and a host allow-list.
///
/// Immutable after construction and shared by every invocation of an engine.
#[derive(Debug, Clone, Default)]
pub struct ModuleResolver {
    virtual_modules: BTreeMap<String, String>,
    allowed: BTreeSet<String>,
}

impl ModuleResolver {
    /// Creates a resolver.
    ///
    /// Path-like keys of the virtual table are normalized, so `./a/../b` and
    /// `./b` name the same module.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if an allow-listed name is not a host
    /// module this engine can provide.
    pub fn new<I, S>(virtual_modules: BTreeMap<String, String>, allowed: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: BTreeSet<String> = allowed.into_iter().map(Into::into).collect();
        if let Some(missing) = allowed
            .iter()
            .find(|name| !HOST_MODULES.contains(&name.as_str()))
        {
            return Err(Error::ConfigError {
                message: format!("Cannot find module '{missing}'"),
            });
        }

        let virtual_modules = virtual_modules
            .into_iter()
            .map(|(key, source)| (table_key(&key), source))
            .collect();

        Ok(Self {
            virtual_modules,
            allowed,
        })
    }

    /// Resolves an absolute module name.
    ///
    /// The virtual table is checked first, then the allow-list by exact name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleNotFound`] carrying `name` unchanged.
    pub fn resolve<'a>(&'a self, name: &str) -> Result<ResolvedModule<'a>> {
        self.lookup_virtual(&table_key(name))
            .or_else(|| self.lookup_host(name))
            .ok_or_else(|| not_found(name))
    }

    /// Returns a resolver relative to `base_path`.
    #[must_use]
    pub fn resolve_relative(&self, base_path: &str) -> RelativeResolver<'_> {
        RelativeResolver {
            resolver: self,
            base_path: base_path.to_string(),
        }
    }

    /// Keys of the virtual table, as exposed on `Backstage.modules`.
    pub fn virtual_keys(&self) -> impl Iterator<Item = &str> {
        self.virtual_modules.keys().map(String::as_str)
    }

    /// Allow-listed host modules.
    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    fn lookup_virtual(&self, key: &str) -> Option<ResolvedModule<'_>> {
        self.virtual_modules
            .get_key_value(key)
            .map(|(key, source)| ResolvedModule::Virtual {
                key: key.as_str(),
                source: source.as_str(),
            })
    }

    fn lookup_host(&self, name: &str) -> Option<ResolvedModule<'_>> {
        self.allowed
            .get(name)
            .map(|name| ResolvedModule::Host {
                name: name.as_str(),
            })
    }
}

/// Resolver bound to a base path, used for `relativeRequire(base)` and for
/// `require` inside virtual modules.
#[derive(Debug, Clone)]
pub struct RelativeResolver<'a> {
    resolver: &'a ModuleResolver,
    base_path: String,
}

impl<'a> RelativeResolver<'a> {
    /// Resolves `name` against the base path.
    ///
    /// On a miss, path-like names fall back to the absolute virtual table by
    /// their normalized key, and bare names fall back to the allow-list only.
    /// A bare name never matches another package's virtual module.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleNotFound`] carrying `name` unchanged.
    pub fn resolve(&self, name: &str) -> Result<ResolvedModule<'a>> {
        let key = format!("./{}", normalize(&format!("{}/{name}", self.base_path)));
        if let Some(found) = self.resolver.lookup_virtual(&key) {
            return Ok(found);
        }

        let fallback = if is_path_like(name) {
            self.resolver.lookup_virtual(&table_key(name))
        } else {
            self.resolver.lookup_host(name)
        };
        fallback.ok_or_else(|| not_found(name))
    }

    /// The base path this resolver was created with.
    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}

fn not_found(name: &str) -> Error {
    Error::ModuleNotFound {
        name: name.to_string(),
    }
}

fn is_path_like(name: &str) -> bool {
    name == "." || name == ".." || name.starts_with("./") || name.starts_with("../")
}

/// Normalized table key for a module name; bare names are kept as-is.
fn table_key(name: &str) -> String {
    if is_path_like(name) {
        format!("./{}", normalize(name))
    } else {
        name.to_string()
    }
}

/// Directory part of a table key, for resolving requires made from inside
/// the module stored under it.
///
/// # Examples
///
/// ```
/// use backstage_sandbox::resolver::dirname;
///
/// assert_eq!(dirname("./mypackage2/module2"), "./mypackage2");
/// assert_eq!(dirname("./module1"), ".");
/// ```
#[must_use]
pub fn dirname(key: &str) -> &str {
    match key.rfind('/') {
        Some(0) => "/",
        Some(index) => &key[..index],
        None => ".",
    }
}

/// POSIX-style path normalization.
///
/// Collapses repeated separators, drops `.` segments and folds `..` into its
/// parent. Leading `..` segments of a relative path are kept. An empty result
/// becomes `.`.
///
/// # Examples
///
/// ```
/// use backstage_sandbox::resolver::normalize;
///
/// assert_eq!(normalize("mypackage2/./module1"), "mypackage2/module1");
/// assert_eq!(normalize("a//b/../c/"), "a/c");
/// assert_eq!(normalize("../x"), "../x");
/// assert_eq!(normalize("a/.."), ".");
/// ```
#[must_use]
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if absolute => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
