//! Golden configuration templates exposed as MCP resources.
//!
//! YAML files under the template directory are advertised as
//! `analyst://templates/{file}` resources and read back verbatim. The
//! catalog reads the filesystem on every call so templates can be added or
//! edited without a restart.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::ResourceConfig;
use crate::error::{RpcError, RpcResult};

const URI_PREFIX: &str = "analyst://templates/";
const YAML_MIME: &str = "application/x-yaml";

/// One advertised resource, serialized in MCP camelCase form.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Filesystem-backed catalog of YAML config templates.
pub struct ResourceCatalog {
    template_dir: PathBuf,
    advertise_templates: bool,
}

impl ResourceCatalog {
    pub fn new(template_dir: impl Into<PathBuf>, advertise_templates: bool) -> Self {
        Self {
            template_dir: template_dir.into(),
            advertise_templates,
        }
    }

    pub fn from_config(config: &ResourceConfig) -> Self {
        Self::new(config.template_dir.clone(), config.advertise_templates)
    }

    /// All YAML templates currently on disk. A missing directory is an
    /// empty catalog, not an error.
    pub async fn list(&self) -> RpcResult<Vec<ResourceDescriptor>> {
        let mut dir = match tokio::fs::read_dir(&self.template_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RpcError::Internal {
                    message: format!("template listing failed: {e}"),
                })
            }
        };

        let mut resources = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| RpcError::Internal {
            message: format!("template listing failed: {e}"),
        })? {
            let path = entry.path();
            if !is_yaml(&path) {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(file_name);
            resources.push(ResourceDescriptor {
                uri: format!("{URI_PREFIX}{file_name}"),
                name: stem.to_string(),
                mime_type: YAML_MIME.to_string(),
                description: Some(format!("Golden configuration template '{stem}'")),
            });
        }
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(resources)
    }

    /// URI templates advertised by `resources/templates/list`. Off by
    /// default so clients listing concrete resources do not see duplicates.
    pub fn templates(&self) -> Vec<Value> {
        if !self.advertise_templates {
            return Vec::new();
        }
        vec![json!({
            "uriTemplate": format!("{URI_PREFIX}{{name}}.yaml"),
            "name": "golden_config_template",
            "mimeType": YAML_MIME,
        })]
    }

    /// Read one template body by its `analyst://templates/...` URI.
    pub async fn read(&self, uri: &str) -> RpcResult<String> {
        let file_name = uri
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| RpcError::ResourceNotFound {
                uri: uri.to_string(),
            })?;
        // URIs must address files directly inside the template dir.
        if file_name.is_empty() || file_name.contains('/') || file_name.contains("..") {
            return Err(RpcError::ResourceNotFound {
                uri: uri.to_string(),
            });
        }
        let path = self.template_dir.join(file_name);
        if !is_yaml(&path) {
            return Err(RpcError::ResourceNotFound {
                uri: uri.to_string(),
            });
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RpcError::ResourceNotFound {
                    uri: uri.to_string(),
                })
            }
            Err(e) => Err(RpcError::Internal {
                message: format!("template read failed: {e}"),
            }),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        YAML_MIME
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
