use std::collections::HashMap;
use std::fmt;

/// A secret value. Reachable only through [`Secret::expose`]; every rendered
/// form is redacted and the type is deliberately neither `Clone` nor
/// serializable, so a value cannot drift into longer-lived state.
pub struct Secret(String);

impl Secret {
    fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.clear();
    }
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Source of named credentials. Values are handed out only inside a
/// [`CredentialStore::scoped`] block and cease to exist when it returns.
pub struct CredentialStore {
    lookup: Lookup,
}

impl CredentialStore {
    /// Resolve credentials from process environment variables.
    pub fn from_env() -> Self {
        Self {
            lookup: Box::new(|name| std::env::var(name).ok().filter(|v| !v.is_empty())),
        }
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self {
            lookup: Box::new(move |name| values.get(name).cloned()),
        }
    }

    /// Run `block` with the named credentials materialized for its duration
    /// only. Names missing from the source are simply absent in the scope;
    /// the block still runs and is responsible for degrading gracefully.
    ///
    /// The `for<'a>` bound pins the scope's lifetime to the call, so the
    /// block structurally cannot return a borrow of a secret.
    pub fn scoped<R>(
        &self,
        names: &[&str],
        block: impl for<'a> FnOnce(&'a CredentialScope) -> R,
    ) -> R {
        let values = names
            .iter()
            .filter_map(|name| (self.lookup)(name).map(|v| (name.to_string(), Secret::new(v))))
            .collect();
        let scope = CredentialScope { values };
        block(&scope)
    }
}

pub struct CredentialScope {
    values: HashMap<String, Secret>,
}

impl CredentialScope {
    pub fn get(&self, name: &str) -> Option<&Secret> {
        self.values.get(name)
    }

    pub fn has_all(&self, names: &[&str]) -> bool {
        names.iter().all(|name| self.values.contains_key(*name))
    }
}

impl fmt::Debug for CredentialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.values.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("CredentialScope")
            .field("names", &names)
            .finish()
    }
}
