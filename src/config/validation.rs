use super::{AppConfig, ConfigError, LogLevel};

/// Validate a parsed configuration before the server starts.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] on the first rule violation.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::Validation(
            "server.port must be non-zero".to_string(),
        ));
    }
    if config.server.timeout == 0 {
        return Err(ConfigError::Validation(
            "server.timeout must be non-zero".to_string(),
        ));
    }
    if config.grok.base_url.trim().is_empty() {
        return Err(ConfigError::Validation(
            "grok.base_url must not be empty".to_string(),
        ));
    }
    if config.grok.base_url.ends_with('/') {
        return Err(ConfigError::Validation(
            "grok.base_url must not end with '/'".to_string(),
        ));
    }
    if config.grok.models.is_empty() {
        return Err(ConfigError::Validation(
            "grok.models must list at least one model".to_string(),
        ));
    }
    if config.store.conversation_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "store.conversation_ttl_secs must be non-zero".to_string(),
        ));
    }
    if config.store.keep_per_token == 0 {
        return Err(ConfigError::Validation(
            "store.keep_per_token must be non-zero".to_string(),
        ));
    }
    for key in &config.auth.allowed_keys {
        if key.trim().is_empty() {
            return Err(ConfigError::Validation(
                "auth.allowed_keys must not contain empty keys".to_string(),
            ));
        }
    }
    if LogLevel::parse(&config.features.log_level).is_none() {
        return Err(ConfigError::Validation(format!(
            "features.log_level '{}' is not one of DISABLED/DEBUG/INFO/WARNING/ERROR",
            config.features.log_level
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn rejects_trailing_slash_base_url() {
        let mut config = AppConfig::default();
        config.grok.base_url = "https://grok.com/rest/app-chat/".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_zero_ttl() {
        let mut config = AppConfig::default();
        config.store.conversation_ttl_secs = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = AppConfig::default();
        config.features.log_level = "verbose".to_string();
        assert!(validate_config(&config).is_err());
    }
}
