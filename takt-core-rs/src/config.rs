//! Hierarchical key/value configuration
//!
//! Text format, one entry per line:
//!
//! ```text
//! # comment
//! global.car = Ford
//! proxy.camera.width = 640      # trailing comment
//! proxy:2.camera.width = 320
//! ```
//!
//! Keys are case-insensitive (stored lower-cased) and unique; the last
//! assignment wins. A `name:id.` prefix scopes a key to one instance of a
//! module.

use crate::codec::{field_id, Decodable, Decoder, Encodable, Encoder, FieldId};
use crate::envelope::{DataType, Payload};
use crate::error::{CodecError, ConfigError};
use crate::messages::data_type;
use crate::types::ModuleDescriptor;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

/// Section every module receives
pub const GLOBAL_SECTION: &str = "global";

/// Ordered, case-insensitive key/value store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the line-oriented text format.
    ///
    /// Blank lines, comment lines and lines without `=` or without a key
    /// are skipped.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }

            let value = match value.split_once('#') {
                Some((value, _comment)) => value,
                None => value,
            };

            config.set(key, value.trim());
        }

        config
    }

    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Serialize back to the text format.
    pub fn to_text(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.trim().to_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Result<&str, ConfigError> {
        self.entries
            .get(&key.to_lowercase())
            .map(String::as_str)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_lowercase()))
    }

    /// Get and parse a value.
    pub fn get_as<T: FromStr>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.get(key)?;
        value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_lowercase(),
            value: value.to_string(),
        })
    }

    /// Get and parse a value, falling back to `default` when absent.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get_as(key) {
            Err(ConfigError::KeyNotFound(_)) => Ok(default),
            other => other,
        }
    }

    /// Comma separated list; absent key gives an empty list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Keys under `section.` with the prefix stripped.
    ///
    /// `section` may carry an instance, e.g. `proxy:2`.
    pub fn subset(&self, section: &str) -> Configuration {
        let prefix = format!("{}.", section.to_lowercase());
        let entries = self
            .entries
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
            .collect();
        Configuration { entries }
    }

    /// Keys under `section.` merged with `section:instance.`, the instance
    /// keys taking precedence.
    pub fn subset_for_instance(&self, section: &str, instance: Option<u32>) -> Configuration {
        let mut merged = self.subset(section);
        if let Some(id) = instance {
            merged
                .entries
                .extend(self.subset(&format!("{}:{}", section, id)).entries);
        }
        merged
    }

    /// The view delivered to a module during the connection handshake.
    ///
    /// Contains every `global.` key, every `name.` key and, for the module's
    /// own instance, every `name:id.` key rewritten to `name.` (overriding the
    /// unscoped value). Other sections and other instances are left out. The
    /// store itself is not modified.
    pub fn scoped_for(&self, descriptor: &ModuleDescriptor) -> Configuration {
        let global = format!("{}.", GLOBAL_SECTION);
        let name = descriptor.name.to_lowercase();
        let own = format!("{}.", name);

        let mut scoped = Configuration::new();
        for (k, v) in &self.entries {
            if k.starts_with(&global) || k.starts_with(&own) {
                scoped.entries.insert(k.clone(), v.clone());
            }
        }

        if let Some(id) = descriptor.instance_id {
            let instance = format!("{}:{}.", name, id);
            for (k, v) in &self.entries {
                if let Some(rest) = k.strip_prefix(&instance) {
                    scoped.entries.insert(format!("{}{}", own, rest), v.clone());
                }
            }
        }

        scoped
    }
}

impl FromStr for Configuration {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

const F_TEXT: FieldId = field_id("configuration");

impl Encodable for Configuration {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_str(F_TEXT, &self.to_text());
    }
}

impl Decodable for Configuration {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        let text: String = dec.get_or(F_TEXT, String::new())?;
        Ok(Self::parse(&text))
    }
}

impl Payload for Configuration {
    const DATA_TYPE: DataType = data_type::CONFIGURATION;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_rules() {
        let config = Configuration::parse(
            "# header comment\n\
             \n\
             Global.Car = Ford   # the car\n\
             proxy.camera.name=front\n\
             this line is malformed\n\
             = no key\n\
             proxy.url = http://host/path\n\
             proxy.camera.name = rear\n",
        );

        assert_eq!(config.len(), 3);
        assert_eq!(config.get("global.car").unwrap(), "Ford");
        assert_eq!(config.get("GLOBAL.CAR").unwrap(), "Ford");
        assert_eq!(config.get("proxy.camera.name").unwrap(), "rear");
        assert_eq!(config.get("proxy.url").unwrap(), "http://host/path");
    }

    #[test]
    fn test_missing_key() {
        let config = Configuration::parse("a.b = 1");
        assert!(matches!(config.get("a.c"), Err(ConfigError::KeyNotFound(k)) if k == "a.c"));
        assert_eq!(config.get_or("a.c", 5u32).unwrap(), 5);
        assert_eq!(config.get_as::<u32>("a.b").unwrap(), 1);
    }

    #[test]
    fn test_invalid_value() {
        let config = Configuration::parse("a.b = fast");
        assert!(matches!(
            config.get_or("a.b", 1.0f64),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_list_values() {
        let config = Configuration::parse("sc.exclude = cockpit, monitor ,,");
        assert_eq!(config.get_list("sc.exclude"), vec!["cockpit", "monitor"]);
        assert!(config.get_list("sc.none").is_empty());
    }

    #[test]
    fn test_subset() {
        let config = Configuration::parse("foo.y = 2\nfoo:3.z = 4\nfoo:3.y = 9\nbar.y = 1\nfoobar.q = 0");

        let foo = config.subset("foo");
        assert_eq!(foo.len(), 1);
        assert_eq!(foo.get("y").unwrap(), "2");

        let foo3 = config.subset("foo:3");
        assert_eq!(foo3.get("z").unwrap(), "4");

        let merged = config.subset_for_instance("foo", Some(3));
        assert_eq!(merged.get("y").unwrap(), "9");
        assert_eq!(merged.get("z").unwrap(), "4");

        let unscoped = config.subset_for_instance("foo", Some(5));
        assert_eq!(unscoped.get("y").unwrap(), "2");
        assert!(!unscoped.contains("z"));
    }

    #[test]
    fn test_scoped_for_module() {
        let config = Configuration::parse("global.x = 1\nfoo.y = 2\nfoo:3.z = 4\nbar.w = 0");

        let three = config.scoped_for(&ModuleDescriptor::new("foo").with_instance(3));
        assert_eq!(three.len(), 3);
        assert_eq!(three.get("global.x").unwrap(), "1");
        assert_eq!(three.get("foo.y").unwrap(), "2");
        assert_eq!(three.get("foo.z").unwrap(), "4");

        let five = config.scoped_for(&ModuleDescriptor::new("foo").with_instance(5));
        assert_eq!(five.len(), 2);
        assert_eq!(five.get("global.x").unwrap(), "1");
        assert_eq!(five.get("foo.y").unwrap(), "2");
        assert!(!five.contains("foo.z"));

        // Instance overrides never leak into the shared store.
        assert!(!config.contains("foo.z"));
    }

    #[test]
    fn test_instance_key_overrides_unscoped() {
        let config = Configuration::parse("foo.rate = 10\nfoo:1.rate = 20");
        let scoped = config.scoped_for(&ModuleDescriptor::new("FOO").with_instance(1));
        assert_eq!(scoped.get("foo.rate").unwrap(), "20");
        assert_eq!(config.get("foo.rate").unwrap(), "10");
    }

    #[test]
    fn test_text_roundtrip() {
        let config = Configuration::parse("b.k = 2\na.k = 1 # c");
        assert_eq!(config.to_text(), "a.k=1\nb.k=2\n");
        assert_eq!(Configuration::parse(&config.to_text()), config);
        assert_eq!(Configuration::from_bytes(&config.to_bytes()).unwrap(), config);
    }

    #[test]
    fn test_load_from_file() -> Result<(), ConfigError> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "supercomponent.pulsetimeack.timeout = 250")?;
        writeln!(file, "supercomponent.pulsetimeack.exclude = cockpit")?;

        let config = Configuration::load(file.path())?;
        assert_eq!(config.get_as::<u64>("supercomponent.pulsetimeack.timeout")?, 250);
        Ok(())
    }
}
