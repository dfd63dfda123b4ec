//! Socrata SODA source.
//!
//! Pulls `{api_base}/resource/{dataset}.json` page by page, ordered by the
//! system `:id` column so offsets stay stable while paging. Incremental pulls
//! add `$where=<field> > '<floating timestamp>'`.

use async_trait::async_trait;
use embers_core::config::SocrataConfig;
use embers_core::loader::models::{FetchQuery, RawRecord};
use embers_core::loader::traits::RecordSource;
use embers_core::{Error, Result};
use reqwest::Client;
use tracing::instrument;

const APP_TOKEN_HEADER: &str = "X-App-Token";

#[derive(Clone)]
pub struct SocrataSource {
    client: Client,
    name: String,
    api_base: String,
    dataset_id: String,
    app_token: Option<String>,
    page_size: u32,
}

impl SocrataSource {
    pub fn new(cfg: &SocrataConfig) -> Result<Self> {
        if cfg.page_size == 0 {
            return Err(Error::InvalidInput(
                "socrata page_size must be > 0".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::backend("build http client", e))?;
        Ok(Self {
            client,
            name: format!("socrata:{}", cfg.dataset_id),
            api_base: cfg.api_base().trim_end_matches('/').to_string(),
            dataset_id: cfg.dataset_id.clone(),
            app_token: cfg.app_token.clone(),
            page_size: cfg.page_size,
        })
    }

    /// Point at another host (a proxy or a local stand-in).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/resource/{}.json", self.api_base, self.dataset_id)
    }

    /// SoQL filter for a query, `None` for complete history.
    pub fn where_clause(query: &FetchQuery) -> Option<String> {
        match query {
            FetchQuery::All => None,
            FetchQuery::After { field, watermark } => Some(format!(
                "{field} > '{}'",
                watermark.to_floating_literal()
            )),
        }
    }

    #[instrument(level = "debug", skip(self, filter))]
    async fn fetch_page(&self, filter: Option<&str>, offset: u64) -> Result<Vec<RawRecord>> {
        let limit = self.page_size.to_string();
        let offset_s = offset.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("$limit", limit.as_str()),
            ("$offset", offset_s.as_str()),
            ("$order", ":id"),
        ];
        if let Some(w) = filter {
            params.push(("$where", w));
        }

        let mut req = self.client.get(self.endpoint()).query(&params);
        if let Some(token) = &self.app_token {
            req = req.header(APP_TOKEN_HEADER, token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::source_err(format!("GET {}", self.endpoint()), e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(Error::SourceMessage(format!(
                "GET {} returned {status}: {snippet}",
                self.endpoint()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::source_err("decode socrata response", e))?;
        let serde_json::Value::Array(items) = body else {
            return Err(Error::DataShape(
                "socrata response is not a JSON array".to_string(),
            ));
        };
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                RawRecord::from_value(item).map_err(|e| match e {
                    Error::DataShape(msg) => {
                        Error::DataShape(format!("offset {}: {msg}", offset + i as u64))
                    }
                    other => other,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RecordSource for SocrataSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(level = "info", skip(self), fields(source = %self.name))]
    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<RawRecord>> {
        let filter = Self::where_clause(query);
        let page_size = u64::from(self.page_size);
        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let page = self.fetch_page(filter.as_deref(), offset).await?;
            let n = page.len() as u64;
            out.extend(page);
            tracing::debug!(offset, records = n, "fetched page");
            if n < page_size {
                break;
            }
            offset += n;
        }
        tracing::info!(records = out.len(), "socrata fetch complete");
        Ok(out)
    }
}
