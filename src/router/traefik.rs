use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, IntoUrl, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use crate::router::Route;

static HOST_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"Host\(([^)]*)\)").unwrap());
static VALUE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new("`([^`]+)`").unwrap());

/// Reads routes from the Traefik HTTP API.
#[derive(Debug)]
pub struct TraefikRouter {
    base_url: Url,
    client: Client,
}

impl TraefikRouter {
    pub fn new<U: IntoUrl>(url: U) -> Result<Self, TraefikError> {
        let base_url = url.into_url()?;

        if base_url.cannot_be_a_base() {
            Err(TraefikError::BadBaseUrl)
        } else {
            Ok(Self {
                base_url,
                client: Client::new(),
            })
        }
    }
}

#[async_trait::async_trait]
impl super::Router for TraefikRouter {
    type Error = TraefikError;

    #[tracing::instrument(skip(self), fields(url = %self.base_url))]
    async fn get_routes(&self) -> Result<Vec<Route>, Self::Error> {
        let url = self.base_url.join("api/http/routers")?;
        let routers = self.client.get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<TraefikRouterInfo>>()
            .await?;

        debug!(?routers, "got {} routers from Traefik", routers.len());

        Ok(routers.iter()
            .filter(|r| r.status.as_deref() != Some("disabled"))
            .flat_map(|r| parse_domains(&r.rule)
                .map(|d| Route {
                    id: r.name.clone(),
                    host: d.to_owned(),
                })
            )
            .collect()
        )
    }
}

/// Parses domains out of Traefik rule expressions.
///
/// Both ``Host(`a`)`` and the multi-value ``Host(`a`, `b`)`` form are
/// understood.
fn parse_domains(rule: &str) -> impl Iterator<Item=&str> {
    HOST_REGEX.captures_iter(rule)
        .filter_map(|cap| cap.get(1))
        .flat_map(|args| VALUE_REGEX.captures_iter(args.as_str()))
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str())
}

#[derive(Debug, Error)]
pub enum TraefikError {
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),
    #[error("bad base url")]
    BadBaseUrl,
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),
}

#[derive(Debug, Deserialize)]
struct TraefikRouterInfo {
    rule: String,
    name: String,
    status: Option<String>,
}
