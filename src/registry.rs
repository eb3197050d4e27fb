use crate::error::ConfigError;
use anyhow::Result;
use std::{collections::BTreeMap, fmt::Debug, str::FromStr};

/// Parsed `key=value` configuration.
///
/// The text form is a comma separated list, ie `"dims=16,rows=5,cols=5"`.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Params {
    values: BTreeMap<String, String>,
}

impl Params {
    /// Parses `text`.
    ///
    /// **Errors**
    /// Each non-empty item must be of the form `key=value`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for item in text.split(',').map(str::trim).filter(|x| !x.is_empty()) {
            let Some((key, value)) = item.split_once('=') else {
                return Err(ConfigError::invalid(item, "", "expected key=value").into());
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { values })
    }
    /// Adds or replaces `key`.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(key.into(), value.to_string());
        self
    }
    /// The raw value of `key`.
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
    /// Parses `key`, or returns `default` if it is missing.
    ///
    /// **Errors**
    /// The value could not be parsed as `T`.
    pub fn get<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Debug,
    {
        match self.values.get(key) {
            Some(value) => value
                .parse()
                .map_err(|e| ConfigError::invalid(key, value, format!("{e:?}")).into()),
            None => Ok(default),
        }
    }
    /// Parses `key`.
    ///
    /// **Errors**
    /// The value is missing or could not be parsed as `T`.
    pub fn require<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Debug,
    {
        match self.values.get(key) {
            Some(value) => value
                .parse()
                .map_err(|e| ConfigError::invalid(key, value, format!("{e:?}")).into()),
            None => Err(ConfigError::invalid(key, "", "missing").into()),
        }
    }
}

/// A factory for `T`.
pub type Factory<T> = fn(&Params) -> Result<T>;

struct Entry<T> {
    description: &'static str,
    factory: Factory<T>,
}

/// Named factories.
///
/// A registry is an ordinary value: build it once (ie with [`layer::registry()`](crate::layer::registry()))
/// and pass it by reference to whatever needs to construct components by name.
pub struct Registry<T> {
    what: &'static str,
    entries: BTreeMap<&'static str, Entry<T>>,
}

impl<T> Registry<T> {
    /// An empty registry. `what` names the kind of component in error messages.
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            entries: BTreeMap::new(),
        }
    }
    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register(
        &mut self,
        name: &'static str,
        description: &'static str,
        factory: Factory<T>,
    ) -> &mut Self {
        self.entries.insert(
            name,
            Entry {
                description,
                factory,
            },
        );
        self
    }
    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
    /// The registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }
    /// The description of `name`.
    pub fn description(&self, name: &str) -> Option<&'static str> {
        self.entries.get(name).map(|x| x.description)
    }
    /// Constructs `name` with `params`.
    ///
    /// **Errors**
    /// - [`ConfigError::UnknownKind`] if nothing is registered for `name`.
    /// - Errors from the factory.
    pub fn get(&self, name: &str, params: &Params) -> Result<T> {
        if let Some(entry) = self.entries.get(name) {
            (entry.factory)(params)
        } else {
            Err(ConfigError::UnknownKind {
                what: self.what,
                name: name.to_string(),
                known: self.names().map(String::from).collect(),
            }
            .into())
        }
    }
    /// Constructs from a `name[:key=value,...]` description.
    ///
    /// See [`.get()`](Self::get()).
    pub fn build(&self, text: &str) -> Result<T> {
        let (name, params) = text.trim().split_once(':').unwrap_or((text.trim(), ""));
        self.get(name.trim(), &Params::parse(params)?)
    }
}

impl<T> Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v.description)))
            .finish()
    }
}
