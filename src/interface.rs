use std::{
    collections::{BTreeMap, HashMap},
    path::{Component, Path, PathBuf},
};

use crate::{
    error::{Error, KilnResult},
    value::Value,
};

/// The data a template is rendered against.
///
/// # Examples
///
/// ```
/// use kiln::{Context, Value};
///
/// let mut context = Context::new();
/// context
///     .insert("title", "Home")
///     .insert("tags", vec!["a", "b"]);
///
/// assert_eq!(context.get("title"), Some(&Value::from("Home")));
/// assert!(context.contains("tags"));
/// ```
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    data: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<N: AsRef<str>, V: Into<Value>>(&mut self, name: N, value: V) -> &mut Self {
        self.data.insert(name.as_ref().to_string(), value.into());
        self
    }

    pub fn get<N: AsRef<str>>(&self, name: N) -> Option<&Value> {
        self.data.get(name.as_ref())
    }

    pub fn contains<N: AsRef<str>>(&self, name: N) -> bool {
        self.data.contains_key(name.as_ref())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) const fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.data
    }
}

impl From<BTreeMap<String, Value>> for Context {
    fn from(data: BTreeMap<String, Value>) -> Self {
        Self { data }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Source of template text. Loading is synchronous and happens before
/// compilation.
pub trait Loader: Send + Sync {
    /// Returns the source of the template called `name`.
    ///
    /// # Errors
    /// - `Error::TemplateNotFound` if there is no such template.
    /// - `Error::Io` if the template exists but could not be read.
    fn load(&self, name: &str) -> KilnResult<String>;
}

/// Templates held in memory, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    templates: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<N: Into<String>, S: Into<String>>(&mut self, name: N, source: S) -> &mut Self {
        self.templates.insert(name.into(), source.into());
        self
    }

    /// Builder-style [`MemoryLoader::insert`].
    #[must_use]
    pub fn with<N: Into<String>, S: Into<String>>(mut self, name: N, source: S) -> Self {
        self.insert(name, source);
        self
    }
}

impl Loader for MemoryLoader {
    fn load(&self, name: &str) -> KilnResult<String> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TemplateNotFound {
                name: name.to_string(),
            })
    }
}

/// Loads templates from files below a root directory. Names that would
/// escape the root (`..`, absolute paths) are treated as missing.
#[derive(Debug, Clone)]
pub struct FileSystemLoader {
    root: PathBuf,
}

impl FileSystemLoader {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        (!escapes).then(|| self.root.join(relative))
    }
}

impl Loader for FileSystemLoader {
    fn load(&self, name: &str) -> KilnResult<String> {
        let not_found = || Error::TemplateNotFound {
            name: name.to_string(),
        };
        let path = self.resolve(name).ok_or_else(not_found)?;
        match std::fs::read_to_string(&path) {
            Ok(source) => Ok(source),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(source) => Err(Error::Io {
                name: name.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_context_insert_chains() {
        let mut context = Context::new();
        context.insert("a", 1).insert("b", "two");
        assert_eq!(context.len(), 2);
        assert_eq!(context.get("a"), Some(&Value::Int(1)));
        assert_eq!(
            context.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_context_from_iterator() {
        let context: Context = [("x", 1), ("y", 2)].into_iter().collect();
        assert!(context.contains("y"));
        assert!(!context.is_empty());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_memory_loader() {
        let loader = MemoryLoader::new().with("a.html", "A");
        assert_eq!(loader.load("a.html").unwrap(), "A");
        assert!(matches!(
            loader.load("b.html"),
            Err(Error::TemplateNotFound { name }) if name == "b.html"
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_file_system_loader_rejects_traversal() {
        let loader = FileSystemLoader::new("/srv/templates");
        assert!(loader.resolve("../etc/passwd").is_none());
        assert!(loader.resolve("/etc/passwd").is_none());
        assert!(loader.resolve("a/../../b").is_none());
        assert_eq!(
            loader.resolve("partials/nav.html"),
            Some(PathBuf::from("/srv/templates/partials/nav.html"))
        );
    }

    #[test]
    #[ntest::timeout(500)]
    fn test_file_system_loader_reads_files() {
        let dir = std::env::temp_dir().join(format!("kiln-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("page.html"), "hello").unwrap();

        let loader = FileSystemLoader::new(&dir);
        assert_eq!(loader.load("page.html").unwrap(), "hello");
        assert!(matches!(
            loader.load("missing.html"),
            Err(Error::TemplateNotFound { .. })
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
