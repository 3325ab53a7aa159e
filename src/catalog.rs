//! Trust-catalog consumption.
//!
//! Signature and metadata verification happen inside the catalog service;
//! the listing it returns is consumed here as already verified. This
//! module only fetches, orders, and selects from that listing.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::target::Target;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unable to build catalog client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("unable to read CA file {}: {source}", .path.display())]
    Ca {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to list targets for '{collection}': {source}")]
    List {
        collection: String,
        source: reqwest::Error,
    },
}

/// Read side of the external trust catalog.
#[derive(Debug)]
pub struct CatalogClient {
    server: String,
    http: reqwest::Client,
}

impl CatalogClient {
    /// Build a client for `server`, optionally trusting an extra root CA.
    pub fn new(server: &str, ca_file: Option<&Path>) -> Result<Self, CatalogError> {
        let mut builder = reqwest::Client::builder();
        if let Some(path) = ca_file {
            let pem = std::fs::read(path).map_err(|source| CatalogError::Ca {
                path: path.to_owned(),
                source,
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(CatalogError::Client)?;
            builder = builder.add_root_certificate(cert);
        }
        Ok(Self {
            server: server.trim_end_matches('/').to_owned(),
            http: builder.build().map_err(CatalogError::Client)?,
        })
    }

    /// List the published targets for a collection, newest name first.
    ///
    /// The order the catalog returns is not canonical, so the listing is
    /// sorted descending by name before callers select from it.
    pub async fn list_targets(&self, collection: &str) -> Result<Vec<Target>, CatalogError> {
        let url = format!("{}/v2/{collection}/targets", self.server);
        debug!("listing targets from {url}");

        let map = |source| CatalogError::List {
            collection: collection.to_owned(),
            source,
        };
        let mut targets: Vec<Target> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(map)?
            .error_for_status()
            .map_err(map)?
            .json()
            .await
            .map_err(map)?;

        targets.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(targets)
    }
}

/// Select one target for a version token: `"latest"` picks the first
/// listed entry, anything else the first exact (case-sensitive) name
/// match.
pub fn resolve<'a>(version: &str, targets: &'a [Target]) -> Option<&'a Target> {
    if version == "latest" {
        targets.first()
    } else {
        targets.iter().find(|target| target.name == version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::ContentHash;
    use mockito::Server;
    use serde_json::json;

    fn target(name: &str) -> Target {
        Target {
            name: name.to_owned(),
            hash: ContentHash::of(name.as_bytes()),
            custom: None,
        }
    }

    #[tokio::test]
    async fn list_targets_sorts_descending_by_name() {
        let mut server = Server::new_async().await;
        let body = json!([
            {"name": "v1-intel", "sha256": ContentHash::of(b"1").to_hex()},
            {"name": "v3-intel", "sha256": ContentHash::of(b"3").to_hex()},
            {"name": "v2-intel", "sha256": ContentHash::of(b"2").to_hex()},
        ]);

        let mock = server
            .mock("GET", "/v2/fleet/base/targets")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = CatalogClient::new(&server.url(), None).unwrap();
        let targets = client.list_targets("fleet/base").await.unwrap();

        let names: Vec<_> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["v3-intel", "v2-intel", "v1-intel"]);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn list_targets_propagates_server_errors() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/fleet/base/targets")
            .with_status(500)
            .create_async()
            .await;

        let client = CatalogClient::new(&server.url(), None).unwrap();
        let err = client.list_targets("fleet/base").await.unwrap_err();
        assert!(matches!(err, CatalogError::List { .. }));

        mock.assert_async().await;
    }

    #[test]
    fn new_rejects_unreadable_ca_file() {
        let err = CatalogClient::new(
            "https://catalog.example.com",
            Some(Path::new("/nonexistent/ca.pem")),
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::Ca { .. }));
    }

    #[test]
    fn resolve_latest_picks_first_entry() {
        let targets = vec![target("v3-intel"), target("v2-intel")];
        assert_eq!(resolve("latest", &targets).unwrap().name, "v3-intel");
    }

    #[test]
    fn resolve_exact_matches_case_sensitively() {
        let targets = vec![target("v3-intel"), target("v2-intel")];
        assert_eq!(resolve("v2-intel", &targets).unwrap().name, "v2-intel");
        assert!(resolve("V2-INTEL", &targets).is_none());
        assert!(resolve("v9-intel", &targets).is_none());
    }

    #[test]
    fn resolve_empty_list_finds_nothing() {
        assert!(resolve("latest", &[]).is_none());
    }
}
