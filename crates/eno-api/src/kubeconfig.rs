use std::path::Path;
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;

use crate::error::ApiError;

// ── Kubeconfig wire format (the subset this engine reads) ────────────────────

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default)]
    current_context: String,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    server: String,
    #[serde(rename = "certificate-authority-data", default)]
    certificate_authority_data: Option<String>,
    #[serde(rename = "certificate-authority", default)]
    certificate_authority: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Debug, Default, Deserialize)]
struct User {
    #[serde(default)]
    token: Option<String>,
    #[serde(rename = "client-certificate-data", default)]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key-data", default)]
    client_key_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: KubeContext,
}

#[derive(Debug, Deserialize)]
struct KubeContext {
    cluster: String,
    #[serde(default)]
    user: String,
}

// ── RestConfig ────────────────────────────────────────────────────────────────

/// Connection settings for one API server, resolved from a kubeconfig's
/// current context.
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub client: reqwest::Client,
}

impl RestConfig {
    /// Load a kubeconfig file and build a client for its current context.
    pub fn from_kubeconfig(path: &Path, request_timeout: Duration) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ApiError::Terminal(format!("reading kubeconfig {}: {}", path.display(), e))
        })?;
        let config: Kubeconfig = serde_yaml::from_str(&raw).map_err(|e| {
            ApiError::Terminal(format!("parsing kubeconfig {}: {}", path.display(), e))
        })?;
        Self::from_parsed(config, request_timeout)
    }

    /// Point at a bare URL with no auth — local test servers.
    pub fn anonymous(base_url: &str, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Terminal(format!("building http client: {}", e)))?;
        Ok(RestConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            client,
        })
    }

    fn from_parsed(config: Kubeconfig, request_timeout: Duration) -> Result<Self, ApiError> {
        let context = config
            .contexts
            .iter()
            .find(|c| c.name == config.current_context)
            .ok_or_else(|| {
                ApiError::Terminal(format!(
                    "kubeconfig has no context named {:?}",
                    config.current_context
                ))
            })?;
        let cluster = config
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .ok_or_else(|| {
                ApiError::Terminal(format!(
                    "kubeconfig has no cluster named {:?}",
                    context.context.cluster
                ))
            })?;
        let user = config
            .users
            .iter()
            .find(|u| u.name == context.context.user)
            .map(|u| &u.user);

        let mut builder = reqwest::Client::builder().timeout(request_timeout);

        if cluster.cluster.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca_pem) = cluster_ca(&cluster.cluster)? {
            let cert = reqwest::Certificate::from_pem(&ca_pem)
                .map_err(|e| ApiError::Terminal(format!("invalid cluster CA: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let mut token = None;
        if let Some(user) = user {
            token = user.token.clone();
            if let (Some(cert), Some(key)) =
                (&user.client_certificate_data, &user.client_key_data)
            {
                let mut pem = decode_b64(cert, "client-certificate-data")?;
                pem.extend_from_slice(&decode_b64(key, "client-key-data")?);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| ApiError::Terminal(format!("invalid client identity: {}", e)))?;
                builder = builder.identity(identity);
            }
        }

        let client = builder
            .build()
            .map_err(|e| ApiError::Terminal(format!("building http client: {}", e)))?;

        Ok(RestConfig {
            base_url: cluster.cluster.server.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }
}

fn cluster_ca(cluster: &Cluster) -> Result<Option<Vec<u8>>, ApiError> {
    if let Some(data) = &cluster.certificate_authority_data {
        return decode_b64(data, "certificate-authority-data").map(Some);
    }
    if let Some(path) = &cluster.certificate_authority {
        return std::fs::read(path)
            .map(Some)
            .map_err(|e| ApiError::Terminal(format!("reading cluster CA {}: {}", path, e)));
    }
    Ok(None)
}

fn decode_b64(data: &str, what: &str) -> Result<Vec<u8>, ApiError> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| ApiError::Terminal(format!("decoding {}: {}", what, e)))
}
