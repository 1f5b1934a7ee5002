//! Loading and querying of typed configuration.
//!
//! Configuration is assembled from any number of sources (YAML files, JSON files, prefixed environment variables) by
//! [`ConfigurationLoader`], and is then either deserialized directly into a typed value or wrapped as a
//! [`GenericConfiguration`] that can be queried by key.
#![deny(missing_docs)]

use std::{
    borrow::Cow,
    collections::HashSet,
    path::Path,
    sync::Arc,
};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Profile, Provider,
};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;
use warden_error::GenericError;

mod provider;
use self::provider::FileProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A requested field was missing.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how the field can be set.
        ///
        /// Includes the matching environment variable names when environment variables were loaded.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// A requested field had a different data type than expected.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Any other configuration failure.
    #[snafu(display("Failed to load or query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        translate_error(&HashSet::new(), e)
    }
}

/// Where a configuration key may additionally be found, used to build helpful error messages.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LookupSource {
    Environment { prefix: String },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> String {
        match self {
            // The prefix is stored uppercased and with its trailing underscore already.
            LookupSource::Environment { prefix } => format!("{}{}", prefix, key.replace('.', "_").to_uppercase()),
        }
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that pulls from multiple sources.
///
/// Sources added later take precedence over sources added earlier.
///
/// # Supported sources
///
/// - YAML file
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    lookup_sources: HashSet<LookupSource>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid YAML, an error is returned.
    pub fn from_yaml<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigurationError> {
        let provider = FileProvider::from_yaml(&path).map_err(GenericError::from).context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring it if it cannot be read or parsed.
    pub fn try_from_yaml<P: AsRef<Path>>(mut self, path: P) -> Self {
        match FileProvider::from_yaml(&path) {
            Ok(provider) => self.providers.push(BoxedProvider(Box::new(provider))),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().display(), "Unable to read YAML configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid JSON, an error is returned.
    pub fn from_json<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigurationError> {
        let provider = FileProvider::from_json(&path).map_err(GenericError::from).context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Attempts to load the given JSON configuration file, ignoring it if it cannot be read or parsed.
    pub fn try_from_json<P: AsRef<Path>>(mut self, path: P) -> Self {
        match FileProvider::from_json(&path) {
            Ok(provider) => self.providers.push(BoxedProvider(Box::new(provider))),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().display(), "Unable to read JSON configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from environment variables starting with `prefix`.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, so a prefix of `warden` matches
    /// `WARDEN_*`. Matching is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment could not be read, an error is returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` is neither `Send` nor `Sync`, so the variables are snapshotted into a serialized provider instead.
        let values = Env::prefixed(&prefix).data()?;
        if let Some(dict) = values.get(&Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(dict.clone()))));
            self.lookup_sources.insert(LookupSource::Environment { prefix });
        }
        Ok(self)
    }

    fn merged(&self) -> Figment {
        self.providers
            .iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider))
    }

    /// Consumes the loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error is returned.
    pub fn into_typed<'a, T: Deserialize<'a>>(self) -> Result<T, ConfigurationError> {
        self.merged()
            .extract()
            .map_err(|e| translate_error(&self.lookup_sources, e))
    }

    /// Consumes the loader, wrapping the merged configuration in a queryable [`GenericConfiguration`].
    pub fn into_generic(self) -> GenericConfiguration {
        let figment = self.merged();
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment,
                lookup_sources: self.lookup_sources,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    lookup_sources: HashSet<LookupSource>,
}

/// Merged configuration in its raw form.
///
/// Keys take the form `a.b.c`, where periods indicate a nested lookup. Given the YAML document below, querying `a.b.c`
/// yields `"value"`, and querying `a.b` yields the nested map.
///
/// ```yaml
/// a:
///   b:
///     c: value
/// ```
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T: Deserialize<'a>>(&self, key: &str) -> Result<T, ConfigurationError> {
        let figment = &self.inner.figment;
        match figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) => {
                // Environment variables cannot express nesting, so `foo.bar` may only exist as `foo_bar`.
                let fallback_key = key.replace('.', "_");
                figment
                    .extract_inner(&fallback_key)
                    .map_err(|e| translate_error(&self.inner.lookup_sources, e))
            }
            Err(e) => Err(translate_error(&self.inner.lookup_sources, e)),
        }
    }

    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist, or the value could not be deserialized into `T`, an error is returned.
    pub fn get_typed<'a, T: Deserialize<'a>>(&self, key: &str) -> Result<T, ConfigurationError> {
        self.get(key)
    }

    /// Gets a configuration value by key, falling back to `T::default()` on any error.
    pub fn get_typed_or_default<'a, T: Default + Deserialize<'a>>(&self, key: &str) -> T {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the key exists but the value could not be deserialized into `T`, an error is returned.
    pub fn try_get_typed<'a, T: Deserialize<'a>>(&self, key: &str) -> Result<Option<T>, ConfigurationError> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error is returned.
    pub fn as_typed<'a, T: Deserialize<'a>>(&self) -> Result<T, ConfigurationError> {
        self.inner
            .figment
            .extract()
            .map_err(|e| translate_error(&self.inner.lookup_sources, e))
    }
}

fn translate_error(lookup_sources: &HashSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = lookup_sources
                .iter()
                .map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));
            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Tuning {
        max_retries: usize,
        window_ms: u64,
    }

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn typed_extraction_from_yaml() {
        let file = yaml_file("max_retries: 3\nwindow_ms: 100\n");
        let tuning: Tuning = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(
            tuning,
            Tuning {
                max_retries: 3,
                window_ms: 100
            }
        );
    }

    #[test]
    fn nested_lookup_by_key() {
        let file = yaml_file("supervisor:\n  restart:\n    max_retries: 5\n");
        let config = ConfigurationLoader::default().from_yaml(file.path()).unwrap().into_generic();

        let max_retries: usize = config.get_typed("supervisor.restart.max_retries").unwrap();
        assert_eq!(max_retries, 5);

        let missing: Option<usize> = config.try_get_typed("supervisor.restart.window_ms").unwrap();
        assert_eq!(missing, None);

        let defaulted: u64 = config.get_typed_or_default("supervisor.restart.window_ms");
        assert_eq!(defaulted, 0);
    }

    #[test]
    fn later_sources_take_precedence() {
        let base = yaml_file("max_retries: 3\nwindow_ms: 100\n");
        let overlay = yaml_file("window_ms: 250\n");
        let tuning: Tuning = ConfigurationLoader::default()
            .from_yaml(base.path())
            .unwrap()
            .from_yaml(overlay.path())
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(tuning.max_retries, 3);
        assert_eq!(tuning.window_ms, 250);
    }

    #[test]
    fn missing_file_is_ignored_by_try_variant() {
        let config = ConfigurationLoader::default()
            .try_from_yaml("/nonexistent/warden.yaml")
            .into_generic();
        let value: Option<String> = config.try_get_typed("anything").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = ConfigurationLoader::default().from_json("/nonexistent/warden.json");
        assert!(matches!(result, Err(ConfigurationError::Generic { .. })));
    }

    #[test]
    fn environment_variables_are_found_by_nested_key() {
        std::env::set_var("WARDEN_CONFIG_TEST_SUPERVISOR_ID", "edge_sup");
        std::env::set_var("WARDEN_CONFIG_TEST_RESTART_SCHEME", "all_for_one");

        let config = ConfigurationLoader::default()
            .from_environment("warden_config_test")
            .unwrap()
            .into_generic();

        let supervisor_id: String = config.get_typed("supervisor.id").unwrap();
        assert_eq!(supervisor_id, "edge_sup");

        let scheme: Option<String> = config.try_get_typed("restart.scheme").unwrap();
        assert_eq!(scheme.as_deref(), Some("all_for_one"));

        // Missing keys point at the environment variable that would provide them.
        match config.get_typed::<String>("restart.window") {
            Err(ConfigurationError::MissingField { help_text, .. }) => {
                assert!(help_text.contains("WARDEN_CONFIG_TEST_RESTART_WINDOW"), "{}", help_text)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn empty_environment_prefix_is_rejected() {
        let result = ConfigurationLoader::default().from_environment("");
        assert!(matches!(result, Err(ConfigurationError::EmptyPrefix)));
    }

    #[test]
    fn invalid_field_type_names_the_field() {
        let file = yaml_file("max_retries: many\nwindow_ms: 100\n");
        let result = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_typed::<Tuning>();

        match result {
            Err(ConfigurationError::InvalidFieldType { field, .. }) => assert_eq!(field, "max_retries"),
            other => panic!("expected InvalidFieldType, got {:?}", other),
        }
    }

    #[test]
    fn missing_field_help_mentions_environment_variable() {
        let lookup_sources = HashSet::from([LookupSource::Environment {
            prefix: "WARDEN_".to_string(),
        }]);
        let err = translate_error(&lookup_sources, figment::Error::from(Kind::MissingField("window_ms".into())));

        match err {
            ConfigurationError::MissingField { help_text, field } => {
                assert_eq!(field, "window_ms");
                assert!(help_text.contains("WARDEN_WINDOW_MS"), "help text was: {}", help_text);
            }
            other => panic!("expected MissingField, got {:?}", other),
        }
    }
}
