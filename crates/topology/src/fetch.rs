//! Non-streaming management fetches, retried with the shared policy.

use crate::model::{CollectionManifest, Pool, PoolServices, TerseBucket};
use crate::retry::Retry;
use crate::CredentialsProvider;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use url::Url;

/// The management endpoints of one cluster, resolved against its base URL.
#[derive(Clone)]
pub struct Fetcher {
    http: reqwest::Client,
    base: Url,
    pool_name: String,
    auth: Arc<dyn CredentialsProvider>,
    retry: Retry,
}

impl Fetcher {
    pub fn new(
        http: reqwest::Client,
        cluster_url: &str,
        pool_name: &str,
        auth: Arc<dyn CredentialsProvider>,
        config: &crate::Config,
    ) -> crate::Result<Self> {
        let base =
            Url::parse(cluster_url).map_err(|_| crate::Error::InvalidUrl(cluster_url.to_string()))?;
        if base.host_str().is_none() {
            return Err(crate::Error::InvalidUrl(cluster_url.to_string()));
        }
        Ok(Self {
            http,
            base,
            pool_name: pool_name.to_string(),
            auth,
            retry: Retry::new(
                config.fetch_retries,
                config.fetch_backoff,
                config.fetch_backoff_factor,
            ),
        })
    }

    /// The hostname through which this process reaches the cluster, used for
    /// empty-hostname substitution.
    pub fn client_host(&self) -> &str {
        self.base.host_str().unwrap_or_default()
    }

    pub fn endpoint(&self, path: &str) -> String {
        let mut url = self.base.clone();
        url.set_path(path);
        url.to_string()
    }

    pub fn pool_streaming_endpoint(&self) -> String {
        self.endpoint(&format!("poolsStreaming/{}", self.pool_name))
    }

    pub fn services_streaming_endpoint(&self) -> String {
        self.endpoint(&format!("pools/{}/nodeServicesStreaming", self.pool_name))
    }

    pub fn bucket_streaming_endpoint(&self, bucket: &str) -> String {
        self.endpoint(&format!("pools/{}/bs/{bucket}", self.pool_name))
    }

    pub fn credentials(&self) -> (String, String) {
        self.auth.credentials()
    }

    pub async fn pool(&self) -> crate::Result<Pool> {
        self.get_json(&format!("pools/{}", self.pool_name)).await
    }

    pub async fn pool_services(&self) -> crate::Result<PoolServices> {
        self.get_json(&format!("pools/{}/nodeServices", self.pool_name))
            .await
    }

    pub async fn terse_bucket(&self, bucket: &str) -> crate::Result<TerseBucket> {
        self.get_json(&format!("pools/{}/b/{bucket}", self.pool_name))
            .await
    }

    pub async fn collection_manifest(&self, bucket: &str) -> crate::Result<CollectionManifest> {
        self.get_json(&format!("pools/{}/b/{bucket}/scopes", self.pool_name))
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> crate::Result<T> {
        let endpoint = self.endpoint(path);

        self.retry
            .run_filtered(
                // A dropped bucket will never come back, and a decode failure
                // will not improve with repetition.
                |err| !matches!(err, crate::Error::NotFound { .. } | crate::Error::Json(_)),
                |attempt, last: Option<&crate::Error>| {
                    if let Some(err) = last {
                        tracing::debug!(%endpoint, attempt, %err, "retrying management fetch");
                    }
                    self.fetch_once(endpoint.clone())
                },
            )
            .await
    }

    async fn fetch_once<T: DeserializeOwned>(&self, endpoint: String) -> crate::Result<T> {
        let (user, password) = self.auth.credentials();
        let response = self
            .http
            .get(&endpoint)
            .basic_auth(user, Some(password))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            reqwest::StatusCode::NOT_FOUND => {
                Err(crate::Error::not_found("endpoint", endpoint))
            }
            status => Err(crate::Error::HttpStatus { endpoint, status }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::StaticCredentials;

    fn fetcher(url: &str) -> crate::Result<Fetcher> {
        Fetcher::new(
            reqwest::Client::new(),
            url,
            "default",
            Arc::new(StaticCredentials("user".into(), "pass".into())),
            &crate::Config::default(),
        )
    }

    #[test]
    fn endpoints_resolve_against_the_cluster_url() {
        let f = fetcher("http://cb.local:8091").unwrap();
        assert_eq!(
            f.pool_streaming_endpoint(),
            "http://cb.local:8091/poolsStreaming/default"
        );
        assert_eq!(
            f.bucket_streaming_endpoint("travel"),
            "http://cb.local:8091/pools/default/bs/travel"
        );
        assert_eq!(f.client_host(), "cb.local");
    }

    #[test]
    fn invalid_urls_are_rejected_up_front() {
        assert!(matches!(
            fetcher("not a url"),
            Err(crate::Error::InvalidUrl(_))
        ));
    }
}
