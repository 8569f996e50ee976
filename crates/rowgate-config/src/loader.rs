//! Loading of configuration documents from JSON or YAML files.

use std::path::Path;

use crate::error::{ConfigError, ConfigResult};
use crate::model::ServerConfig;

/// Supported on-disk document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON document.
    Json,
    /// YAML document.
    Yaml,
}

impl ConfigFormat {
    /// Infer the format from a file extension, defaulting to JSON.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::Yaml,
            _ => Self::Json,
        }
    }
}

/// Read and deserialize a configuration document. The document is not
/// validated; call [`ServerConfig::validate`] afterwards.
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub fn load_config(path: &Path, format: ConfigFormat) -> ConfigResult<ServerConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&raw, format)
}

/// Deserialize a configuration document from a string.
///
/// # Errors
///
/// Returns an error if the document cannot be decoded.
pub fn parse_config(raw: &str, format: ConfigFormat) -> ConfigResult<ServerConfig> {
    match format {
        ConfigFormat::Json => {
            serde_json::from_str(raw).map_err(|source| ConfigError::DecodeJson { source })
        }
        ConfigFormat::Yaml => {
            serde_yaml::from_str(raw).map_err(|source| ConfigError::DecodeYaml { source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_DOC: &str = r#"{
        "version": "1",
        "listen": "127.0.0.1:8000",
        "commonPrefix": "/api",
        "endpoints": [
            {
                "uri": "/info-json",
                "methods": ["GET"],
                "implType": "static-json",
                "script": "{\"apiVersion\":  1}"
            }
        ],
        "datasources": [
            { "name": "main", "dbname": "appdb", "pool": { "maxConns": 8 } }
        ]
    }"#;

    const YAML_DOC: &str = r#"
version: '1'
listen: '127.0.0.1:8000'
commonPrefix: /api
endpoints:
  - uri: /info-json
    methods: [GET]
    implType: static-json
    script: '{"apiVersion":  1}'
datasources:
  - name: main
    dbname: appdb
    pool:
      maxConns: 8
"#;

    #[test]
    fn json_document_round_trips() {
        let cfg = parse_config(JSON_DOC, ConfigFormat::Json).expect("json should parse");
        assert_eq!(cfg.version, "1");
        assert_eq!(cfg.common_prefix, "/api");
        assert_eq!(cfg.endpoints.len(), 1);
        assert_eq!(cfg.endpoints[0].impl_type, "static-json");
        assert_eq!(cfg.datasources[0].database, "appdb");
        assert_eq!(cfg.datasources[0].pool.as_ref().unwrap().max_conns, Some(8));
        assert!(cfg.ensure_valid().is_ok());
    }

    #[test]
    fn yaml_document_parses() {
        let cfg = parse_config(YAML_DOC, ConfigFormat::Yaml).expect("yaml should parse");
        assert_eq!(cfg.version, "1");
        assert_eq!(cfg.endpoints[0].uri, "/info-json");
        assert_eq!(cfg.datasources[0].name, "main");
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let err = parse_config("{nope", ConfigFormat::Json).unwrap_err();
        assert!(matches!(err, ConfigError::DecodeJson { .. }));
    }

    #[test]
    fn format_inference_prefers_extension() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("api.yaml")),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("api.yml")),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("api.json")),
            ConfigFormat::Json
        );
        assert_eq!(ConfigFormat::from_path(Path::new("api")), ConfigFormat::Json);
    }
}
