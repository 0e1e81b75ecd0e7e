//! InfluxDB v2 HTTP API client.

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::metrics::STORE_FAILURES_TOTAL;
use crate::model::{Authorization, AuthorizationRequest, Bucket};
use crate::store::flux::{parse_annotated_csv, FluxQuery, FluxRecord};
use crate::store::line_protocol::Point;
use crate::store::TimeSeriesStore;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BUCKET_PAGE_SIZE: usize = 100;

pub struct InfluxClient {
    base_url: String,
    token: String,
    org: String,
    client: Client,
}

#[derive(Default, Deserialize)]
struct Links {
    next: Option<String>,
}

#[derive(Deserialize)]
struct BucketsResponse {
    #[serde(default)]
    links: Links,
    #[serde(default)]
    buckets: Vec<Bucket>,
}

impl InfluxClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: config.influx_url.trim_end_matches('/').to_string(),
            token: config.influx_token.clone(),
            org: config.influx_org.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(AUTHORIZATION, format!("Token {}", self.token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = match self.authorized(request).send().await {
            Ok(r) => r,
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();
                return Err(e.into());
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        STORE_FAILURES_TOTAL.inc();
        let body = response.text().await.unwrap_or_default();
        warn!("Store returned HTTP {}: {}", status, body);
        Err(Error::Store {
            status: status.as_u16(),
            body,
        })
    }

    async fn post_query(&self, flux: &str, annotations: &[&str]) -> Result<String> {
        let body = json!({
            "query": flux,
            "type": "flux",
            "dialect": {
                "header": true,
                "delimiter": ",",
                "commentPrefix": "#",
                "annotations": annotations,
                "dateTimeFormat": "RFC3339",
            }
        });

        debug!("Query: {}", flux);
        let response = self
            .send(
                self.client
                    .post(self.url("/api/v2/query"))
                    .query(&[("org", self.org.as_str())])
                    .header(ACCEPT, "application/csv")
                    .json(&body),
            )
            .await?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxClient {
    /// Every bucket of the organization, paging until the store stops
    /// returning a `next` link.
    async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let limit = BUCKET_PAGE_SIZE.to_string();
        let mut buckets = Vec::new();
        loop {
            let offset = buckets.len().to_string();
            let response = self
                .send(self.client.get(self.url("/api/v2/buckets")).query(&[
                    ("org", self.org.as_str()),
                    ("limit", limit.as_str()),
                    ("offset", offset.as_str()),
                ]))
                .await?;
            let page: BucketsResponse = response.json().await?;
            let done = page.links.next.is_none() || page.buckets.is_empty();
            buckets.extend(page.buckets);
            if done {
                return Ok(buckets);
            }
        }
    }

    async fn find_bucket_by_name(&self, name: &str) -> Result<Option<Bucket>> {
        let response = self
            .send(
                self.client
                    .get(self.url("/api/v2/buckets"))
                    .query(&[("org", self.org.as_str()), ("name", name)]),
            )
            .await;

        let response = match response {
            Ok(r) => r,
            Err(Error::Store { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let parsed: BucketsResponse = response.json().await?;
        Ok(parsed.buckets.into_iter().find(|b| b.name == name))
    }

    async fn create_authorization(&self, request: &AuthorizationRequest) -> Result<Authorization> {
        let response = self
            .send(self.client.post(self.url("/api/v2/authorizations")).json(request))
            .await?;
        Ok(response.json().await?)
    }

    async fn write(&self, bucket: &str, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Result<Vec<_>>>()?
            .join("\n");
        debug!("Writing to {}: {}", bucket, body);

        self.send(
            self.client
                .post(self.url("/api/v2/write"))
                .query(&[
                    ("org", self.org.as_str()),
                    ("bucket", bucket),
                    ("precision", "ns"),
                ])
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(body),
        )
        .await?;
        Ok(())
    }

    async fn query(&self, query: &FluxQuery) -> Result<Vec<FluxRecord>> {
        let body = self.post_query(&query.to_flux(), &["datatype"]).await?;
        parse_annotated_csv(&body)
    }

    async fn query_csv(&self, flux: &str) -> Result<String> {
        self.post_query(flux, &["group", "datatype", "default"]).await
    }
}
