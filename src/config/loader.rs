use super::schema::Config;
use crate::errors::GatewayError;
use std::path::Path;

/// Load and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<Config, GatewayError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    let config: Config = toml::from_str(&raw)
        .map_err(|e| GatewayError::Config(format!("invalid config {}: {}", path.display(), e)))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), GatewayError> {
    for bot in &config.bots {
        if bot.publisher_id.is_empty() || bot.bot_id.is_empty() {
            return Err(GatewayError::Config(
                "every [[bots]] entry needs a publisherId and a botId".to_string(),
            ));
        }
    }
    let mut seen = std::collections::HashSet::new();
    for bot in &config.bots {
        if !seen.insert((bot.publisher_id.as_str(), bot.bot_id.as_str())) {
            return Err(GatewayError::Config(format!(
                "duplicate bot {}/{}",
                bot.publisher_id, bot.bot_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp config");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_load_minimal_config() {
        let file = write_config("");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.bots.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9090

            [[bots]]
            publisherId = "pub-1"
            botId = "bot-1"

            [bots.settings]
            messengerAppSecret = "s"
            messengerPageAccessToken = "t"
            "#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.bots.len(), 1);
        assert_eq!(config.bots[0].settings.messenger_app_secret, "s");
    }

    #[test]
    fn test_duplicate_bots_rejected() {
        let file = write_config(
            r#"
            [[bots]]
            publisherId = "p"
            botId = "b"

            [[bots]]
            publisherId = "p"
            botId = "b"
            "#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_config(Path::new("/nonexistent/chatgate.toml")).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
