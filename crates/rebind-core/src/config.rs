//! Run configuration and rules files
//!
//! [`RunConfig`] holds the switches of one migration run. [`RulesConfig`]
//! is the TOML rules file:
//!
//! ```toml
//! skip = ["module1 Factory"]
//! encoding_fallbacks = ["latin-1"]
//!
//! [renames]
//! "module1 Factory" = "module2 OtherFactory"
//!
//! [decoders]
//! "module1 Data text" = "utf-8"
//! "module1 Data binary" = "binary"
//!
//! [types]
//! defined = ["module2 OtherFactory"]
//! anonymous = ["module1 Anonymous"]
//!
//! [types.aliases]
//! "module1 Factory" = "module1 NewFactory"
//! ```

use crate::decode::{DecodeAttribute, DecoderRegistry, EncodeBinary, TextEncoding};
use crate::error::{MigrationError, MigrationResult};
use crate::upgrade::{default_renames, UpgradeSettings};
use indexmap::IndexMap;
use rebind_pickle::Protocol;
use rebind_store::Oid;
use rebind_symbol::{
    ClassDescriptor, OpenRegistry, RenameRules, SkipSet, TypeCatalog, TypeRegistry,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Records per transaction before an intermediate commit
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Decoder value that re-tags an attribute as bytes
const BINARY_DECODER: &str = "binary";

/// Switches of one migration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Abort every transaction instead of committing
    pub dry_run: bool,
    /// Protocol of rewritten records
    pub protocol: Protocol,
    /// Records per transaction
    pub batch_size: usize,
    /// First oid to process
    pub start_at: Oid,
    /// Rewrite records even when nothing changed
    pub repickle_all: bool,
    /// Upgrade protocol 2 stores
    pub upgrade: Option<UpgradeSettings>,
    /// Run the diagnostic hook on fatal errors
    pub debug: bool,
}

impl RunConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With dry run
    #[inline]
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// With target protocol
    #[inline]
    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// With batch size; zero is treated as one
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// With resume point
    #[inline]
    #[must_use]
    pub fn with_start_at(mut self, oid: Oid) -> Self {
        self.start_at = oid;
        self
    }

    /// With repickle-all
    #[inline]
    #[must_use]
    pub fn with_repickle_all(mut self, repickle_all: bool) -> Self {
        self.repickle_all = repickle_all;
        self
    }

    /// With upgrade settings
    #[inline]
    #[must_use]
    pub fn with_upgrade(mut self, upgrade: UpgradeSettings) -> Self {
        self.upgrade = Some(upgrade);
        self
    }

    /// With debug hook
    #[inline]
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Whether every record is rewritten; upgrading implies it
    #[inline]
    #[must_use]
    pub fn repickles_all(&self) -> bool {
        self.repickle_all || self.upgrade.is_some()
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            protocol: Protocol::V3,
            batch_size: DEFAULT_BATCH_SIZE,
            start_at: Oid::ZERO,
            repickle_all: false,
            upgrade: None,
            debug: false,
        }
    }
}

/// Host type catalog section of a rules file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypesConfig {
    /// Types importable at their own location
    pub defined: Vec<ClassDescriptor>,
    /// Old locations mapped to the canonical type
    pub aliases: IndexMap<ClassDescriptor, ClassDescriptor>,
    /// Factories without a module and name of their own
    pub anonymous: Vec<ClassDescriptor>,
}

impl TypesConfig {
    /// Build catalog
    #[must_use]
    pub fn catalog(&self) -> TypeCatalog {
        let mut catalog = TypeCatalog::new();
        for descriptor in &self.defined {
            catalog.define(descriptor.clone());
        }
        for (location, canonical) in &self.aliases {
            catalog.alias(location.clone(), canonical.clone());
        }
        for descriptor in &self.anonymous {
            catalog.anonymous(descriptor.clone());
        }
        catalog
    }
}

/// Rules file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Explicit rename rules
    pub renames: IndexMap<ClassDescriptor, ClassDescriptor>,
    /// `"module Class attribute"` to encoding label or `"binary"`
    pub decoders: IndexMap<String, String>,
    /// Descriptors whose records are left alone, in addition to blobs
    pub skip: Vec<ClassDescriptor>,
    /// Encodings tried when a decoder's encoding fails
    pub encoding_fallbacks: Vec<String>,
    /// Host type catalog; absent means every type is canonical
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types: Option<TypesConfig>,
}

impl RulesConfig {
    /// Parse rules from TOML text
    ///
    /// # Errors
    /// Returns [`MigrationError::Config`] on invalid TOML or descriptors.
    pub fn from_toml_str(text: &str) -> MigrationResult<Self> {
        toml::from_str(text).map_err(|err| MigrationError::config(err.to_string()))
    }

    /// Read rules file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> MigrationResult<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|err| MigrationError::io_error(path, err))?;
        let rules = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), renames = rules.renames.len(), "loaded rules");
        Ok(rules)
    }

    /// Explicit rename table
    ///
    /// When upgrading, the default upgrade renames come first and rules
    /// from the file override them.
    #[must_use]
    pub fn rename_rules(&self, upgrade: bool) -> RenameRules {
        let mut rules = if upgrade {
            default_renames()
        } else {
            RenameRules::new()
        };
        for (from, to) in &self.renames {
            rules.insert(from.clone(), to.clone());
        }
        rules
    }

    /// Skip set including blobs
    #[must_use]
    pub fn skip_set(&self) -> SkipSet {
        let mut skip = SkipSet::default();
        for descriptor in &self.skip {
            skip.insert(descriptor.clone());
        }
        skip
    }

    /// Parsed fallback encodings
    ///
    /// # Errors
    /// Returns error for unknown encoding labels.
    pub fn fallbacks(&self) -> MigrationResult<Vec<TextEncoding>> {
        self.encoding_fallbacks
            .iter()
            .map(|label| label.parse())
            .collect()
    }

    /// Decoder registry
    ///
    /// # Errors
    /// Returns error for malformed keys and unknown encodings.
    pub fn decoder_registry(&self) -> MigrationResult<DecoderRegistry> {
        let fallbacks = self.fallbacks()?;
        let mut registry = DecoderRegistry::new();
        for (key, value) in &self.decoders {
            let mut parts = key.split_whitespace();
            let (Some(module), Some(name), Some(attribute), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(MigrationError::config(format!(
                    "decoder key must be \"module Class attribute\": {key:?}"
                )));
            };
            let descriptor = ClassDescriptor::new(module, name);
            if value == BINARY_DECODER {
                registry.register(descriptor, EncodeBinary::new(attribute));
            } else {
                let encoding: TextEncoding = value.parse()?;
                registry.register(
                    descriptor,
                    DecodeAttribute::new(attribute, encoding).with_fallbacks(fallbacks.clone()),
                );
            }
        }
        Ok(registry)
    }

    /// Type registry described by the `[types]` section
    #[must_use]
    pub fn type_registry(&self) -> Box<dyn TypeRegistry> {
        match &self.types {
            Some(types) => Box::new(types.catalog()),
            None => Box::new(OpenRegistry),
        }
    }
}

#[derive(Serialize)]
struct SavedRenames<'a> {
    renames: IndexMap<&'a ClassDescriptor, &'a ClassDescriptor>,
}

/// Write `rules` as a `[renames]` table
///
/// # Errors
/// Returns error if the file cannot be written.
pub fn save_renames(path: impl AsRef<Path>, rules: &RenameRules) -> MigrationResult<()> {
    let path = path.as_ref();
    let saved = SavedRenames {
        renames: rules.iter().collect(),
    };
    let text = toml::to_string(&saved).map_err(|err| MigrationError::config(err.to_string()))?;
    std::fs::write(path, text).map_err(|err| MigrationError::io_error(path, err))?;
    tracing::info!(path = %path.display(), rules = rules.len(), "saved rename rules");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebind_pickle::Value;
    use rebind_symbol::{TypeLookup, WarningLog};

    fn d(text: &str) -> ClassDescriptor {
        text.parse().unwrap()
    }

    const RULES: &str = r#"
skip = ["module1 Factory"]
encoding_fallbacks = ["latin-1"]

[renames]
"module1 Factory" = "module2 OtherFactory"
"__builtin__ set" = "sets Set"

[decoders]
"module1 Data text" = "utf-8"
"module1 Data binary" = "binary"

[types]
defined = ["module2 OtherFactory"]
anonymous = ["module1 Anonymous"]

[types.aliases]
"module1 Factory" = "module1 NewFactory"
"#;

    #[test]
    fn run_config_builder() {
        let config = RunConfig::new()
            .with_dry_run(true)
            .with_batch_size(0)
            .with_start_at(Oid::from_u64(0x1f))
            .with_protocol(Protocol::V2);
        assert!(config.dry_run);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.start_at, Oid::from_u64(0x1f));
        assert!(!config.repickles_all());
        assert!(config.with_upgrade(UpgradeSettings::new()).repickles_all());
        assert_eq!(RunConfig::default().batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn parse_rules_file() {
        let rules = RulesConfig::from_toml_str(RULES).unwrap();
        assert_eq!(rules.renames.len(), 2);
        assert!(rules.skip_set().contains(&d("module1 Factory")));
        assert!(rules.skip_set().contains(&d("ZODB.blob Blob")));
        assert_eq!(rules.fallbacks().unwrap(), vec![TextEncoding::Latin1]);
        assert_eq!(
            rules.decoder_registry().unwrap().decoders_for(&d("module1 Data")).len(),
            2
        );
    }

    #[test]
    fn file_renames_override_upgrade_defaults() {
        let rules = RulesConfig::from_toml_str(RULES).unwrap();
        let table = rules.rename_rules(true);
        assert_eq!(table.get(&d("__builtin__ set")), Some(&d("sets Set")));
        assert_eq!(
            table.get(&d("UserDict UserDict")),
            Some(&d("collections UserDict"))
        );
        assert!(rules.rename_rules(false).get(&d("UserDict UserDict")).is_none());
    }

    #[test]
    fn types_section_builds_catalog() {
        let rules = RulesConfig::from_toml_str(RULES).unwrap();
        let registry = rules.type_registry();
        assert_eq!(
            registry.lookup(&d("module1 Factory")),
            TypeLookup::Canonical(d("module1 NewFactory"))
        );
        assert_eq!(registry.lookup(&d("module1 Anonymous")), TypeLookup::Anonymous);
        assert_eq!(registry.lookup(&d("module3 Gone")), TypeLookup::Missing);
    }

    #[test]
    fn no_types_section_is_open() {
        let rules = RulesConfig::from_toml_str("").unwrap();
        assert_eq!(
            rules.type_registry().lookup(&d("module3 Anything")),
            TypeLookup::Canonical(d("module3 Anything"))
        );
        assert!(rules.decoder_registry().unwrap().is_empty());
    }

    #[test]
    fn invalid_rules_are_config_errors() {
        for text in [
            "[renames]\n\"module1\" = \"module2 OtherFactory\"",
            "[decoders]\n\"module1 Data\" = \"utf-8\"",
            "[decoders]\n\"module1 Data text\" = \"klingon\"",
            "encoding_fallbacks = [\"ebcdic\"]\n[decoders]\n\"module1 Data text\" = \"utf-8\"",
        ] {
            let err = RulesConfig::from_toml_str(text)
                .and_then(|rules| rules.decoder_registry().map(|_| ()))
                .unwrap_err();
            assert!(matches!(err, MigrationError::Config(_)), "{text}: {err}");
        }
    }

    #[test]
    fn decoders_from_rules_apply() {
        let rules = RulesConfig::from_toml_str(RULES).unwrap();
        let registry = rules.decoder_registry().unwrap();
        let mut state = vec![
            (Value::str("text"), Value::LegacyString(b"caf\xe9".to_vec())),
            (Value::str("binary"), Value::str("raw")),
        ];
        let mut warnings = WarningLog::new();
        assert!(registry
            .apply(&d("module1 Data"), &mut state, &mut warnings)
            .unwrap());
        assert_eq!(state[0].1, Value::str("café"));
        assert_eq!(state[1].1, Value::Bytes(b"raw".to_vec()));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn saved_renames_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("renames.toml");
        let rules = RenameRules::new().with(d("module1 Factory"), d("module1 NewFactory"));
        save_renames(&path, &rules).unwrap();

        let loaded = RulesConfig::load(&path).unwrap();
        assert_eq!(loaded.rename_rules(false), rules);
    }

    #[test]
    fn missing_rules_file_is_io_error() {
        let err = RulesConfig::load("/nonexistent/rules.toml").unwrap_err();
        assert!(matches!(err, MigrationError::Io { .. }));
    }
}
