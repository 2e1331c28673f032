//! HTTP client of the external service catalogue.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode, Uri, header};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::CatalogConfig;
use crate::domain::aas::SubmodelElement;
use crate::domain::catalog::ServiceCatalog;
use crate::domain::error::DomainError;
use crate::domain::model::{HttpEndpoint, ServiceKind, SmartService};

const CATALOG_NAME: &str = "Service Catalog";
const ID_PLACEHOLDER: &str = "{id}";
const DEFAULT_METHOD: &str = "POST";

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description_short: Option<String>,
    #[serde(default)]
    description_long: Option<String>,
    #[serde(default)]
    input: Vec<SubmodelElement>,
    #[serde(default)]
    output: Vec<SubmodelElement>,
    #[serde(flatten)]
    kind: EntryKind,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum EntryKind {
    #[serde(rename_all = "camelCase")]
    Internal {
        rest_details: RestDetails,
        container: ContainerDetails,
    },
    #[serde(rename_all = "camelCase")]
    External { rest_details: RestDetails },
    Embedded,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestDetails {
    endpoint: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    output_mapping: Option<BTreeMap<String, String>>,
    #[serde(default)]
    payload: Option<String>,
}

impl From<RestDetails> for HttpEndpoint {
    fn from(rest: RestDetails) -> Self {
        Self {
            endpoint: rest.endpoint,
            method: rest
                .method
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_METHOD.to_owned()),
            headers: rest.headers.unwrap_or_default(),
            payload: rest.payload,
            output_mapping: rest.output_mapping.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerDetails {
    image: String,
    internal_port: u16,
}

impl CatalogEntry {
    fn into_service(self, catalog_id: &str) -> Result<SmartService, DomainError> {
        let kind = match self.kind {
            EntryKind::Internal {
                rest_details,
                container,
            } => ServiceKind::Internal {
                image: container.image,
                internal_port: container.internal_port,
                http: rest_details.into(),
                external_port: None,
            },
            EntryKind::External { rest_details } => ServiceKind::External {
                http: rest_details.into(),
            },
            EntryKind::Embedded => {
                return Err(DomainError::validation(format!(
                    "catalogue entry '{catalog_id}' is an embedded service and carries no artifact"
                )));
            }
        };

        let mut service = SmartService::new(Uuid::new_v4().to_string(), self.name, kind);
        service.service_catalog_id = Some(if self.id.is_empty() {
            catalog_id.to_owned()
        } else {
            self.id
        });
        service.description = self
            .description_short
            .filter(|d| !d.trim().is_empty())
            .or(self.description_long)
            .unwrap_or_default();
        service.input_parameters = self.input;
        service.output_parameters = self.output;
        Ok(service)
    }
}

/// Looks entries up with `GET {host}{path}`, `{id}` in the path replaced by the
/// catalogue id.
pub struct HttpServiceCatalog {
    host: String,
    path: String,
    timeout: Duration,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpServiceCatalog {
    /// Returns `None` when no catalogue host is configured.
    #[must_use]
    pub fn from_config(cfg: &CatalogConfig) -> Option<Self> {
        let host = cfg.host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
        Some(Self {
            host: host.trim_end_matches('/').to_owned(),
            path: cfg.path.clone(),
            timeout: cfg.timeout,
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        })
    }

    fn url(&self, catalog_id: &str) -> String {
        format!("{}{}", self.host, self.path.replace(ID_PLACEHOLDER, catalog_id))
    }

    async fn fetch(&self, url: &str, token: Option<&str>) -> Result<(StatusCode, Bytes), String> {
        let uri: Uri = url.parse().map_err(|e| format!("invalid url: {e}"))?;
        let mut request = Request::builder().uri(uri).header(header::ACCEPT, "application/json");
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = request.body(Empty::new()).map_err(|e| e.to_string())?;

        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| e.to_string())?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| e.to_string())?
                .to_bytes();
            Ok::<_, String>((status, body))
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| "request timed out".to_owned())?
    }
}

#[async_trait]
impl ServiceCatalog for HttpServiceCatalog {
    #[tracing::instrument(skip(self, token))]
    async fn lookup(&self, catalog_id: &str, token: Option<&str>) -> Result<SmartService, DomainError> {
        let url = self.url(catalog_id);
        let (status, body) = self.fetch(&url, token).await.map_err(|e| {
            DomainError::unavailable(CATALOG_NAME, format!("url: {url}, error: {e}"))
        })?;
        if status != StatusCode::OK {
            return Err(DomainError::unavailable(
                CATALOG_NAME,
                format!(
                    "url: {url}, code: {}, body: {}",
                    status.as_u16(),
                    String::from_utf8_lossy(&body)
                ),
            ));
        }
        let entry: CatalogEntry = serde_json::from_slice(&body).map_err(|e| {
            DomainError::unavailable(CATALOG_NAME, format!("url: {url}, malformed entry: {e}"))
        })?;
        let service = entry.into_service(catalog_id)?;
        tracing::debug!(service_id = %service.id, name = %service.name, "catalogue entry resolved");
        Ok(service)
    }
}
