use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    magic,
    utils::error::{WeaveError, WeaveResult},
};

/// Suppress an interceptor on methods carrying a given attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressEntry {
    /// Full name of the interceptor attribute type.
    pub interceptor: String,
    /// Full name of the attribute whose presence suppresses it.
    pub when: String,
}

/// Framework names and switches of a weaving pass. Every field has a
/// default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaverConfig {
    pub interceptor_interface: String,
    pub sync_root_interface: String,
    pub on_enter: String,
    pub on_exception: String,
    pub on_exit: String,
    pub sync_root_setter: String,
    pub exception_type: String,
    pub object_type: String,
    pub assign_field_attribute: String,
    pub exclusion_attributes: Vec<String>,
    pub suppress: Vec<SuppressEntry>,
    pub completion_methods: Vec<String>,
    pub state_machine_this_field: String,
    /// Run the stack analysis over every rewritten body.
    pub verify_output: bool,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        Self {
            interceptor_interface: magic::METHOD_INTERCEPTOR_INTERFACE.to_string(),
            sync_root_interface: magic::SYNC_ROOT_INTERFACE.to_string(),
            on_enter: magic::ON_ENTER.to_string(),
            on_exception: magic::ON_EXCEPTION.to_string(),
            on_exit: magic::ON_EXIT.to_string(),
            sync_root_setter: magic::SYNC_ROOT_SETTER.to_string(),
            exception_type: magic::EXCEPTION_TYPE.to_string(),
            object_type: magic::OBJECT_TYPE.to_string(),
            assign_field_attribute: magic::ASSIGN_FIELD_ATTRIBUTE.to_string(),
            exclusion_attributes: vec![magic::IGNORE_INTERCEPTION_ATTRIBUTE.to_string()],
            suppress: Vec::new(),
            completion_methods: magic::ASYNC_COMPLETION_METHODS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            state_machine_this_field: magic::STATE_MACHINE_THIS_FIELD.to_string(),
            verify_output: true,
        }
    }
}

impl WeaverConfig {
    /// Get the default path to the configuration file.
    pub fn default_path() -> PathBuf {
        if let Ok(config_path) = std::env::var(magic::ENV_CONFIG_PATH) {
            return config_path.into();
        }
        PathBuf::from(magic::DEFAULT_CONFIG_FILE)
    }

    pub fn from_toml_str(toml_str: &str, file: &str) -> WeaveResult<Self> {
        toml::from_str(toml_str).map_err(|e| WeaveError::ConfigParseError {
            source: e,
            file: file.to_string(),
        })
    }

    /// Load the configuration from a TOML file.
    pub fn load_from_toml(path: &Path) -> WeaveResult<Self> {
        let toml_str = std::fs::read_to_string(path)?;
        Self::from_toml_str(&toml_str, &path.display().to_string())
    }

    /// Load from [`Self::default_path`], falling back to the defaults when
    /// no file exists there.
    pub fn load_or_default() -> WeaveResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            log::debug!("Loading weaver configuration from {}", path.display());
            Self::load_from_toml(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_toml(&self, path: &Path) -> WeaveResult<()> {
        let toml_str = toml::to_string(self)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_the_builtin_names() {
        let conf = WeaverConfig::from_toml_str("", "<empty>").unwrap();
        assert_eq!(conf, WeaverConfig::default());
        assert_eq!(conf.interceptor_interface, "Loom.Interception.IMethodInterceptor");
        assert_eq!(conf.completion_methods, vec!["SetResult", "SetException"]);
        assert!(conf.verify_output);
    }

    #[test]
    fn partial_file_overrides_only_what_it_names() {
        let conf = WeaverConfig::from_toml_str(
            r#"
            exception_type = "Acme.Error"
            verify_output = false

            [[suppress]]
            interceptor = "Acme.Log"
            when = "Acme.Quiet"
            "#,
            "<inline>",
        )
        .unwrap();
        assert_eq!(conf.exception_type, "Acme.Error");
        assert!(!conf.verify_output);
        assert_eq!(
            conf.suppress,
            vec![SuppressEntry {
                interceptor: "Acme.Log".into(),
                when: "Acme.Quiet".into(),
            }]
        );
        assert_eq!(conf.on_enter, "OnEnter");
    }

    #[test]
    fn malformed_file_reports_its_name() {
        let err = WeaverConfig::from_toml_str("verify_output = 3", "loom.toml").unwrap_err();
        assert!(matches!(err, WeaveError::ConfigParseError { ref file, .. } if file == "loom.toml"));
    }
}
