use log::debug;
use parking_lot::Mutex;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{RequestBuilder, StatusCode};

use crate::config::{ConfigError, HttpConfig, ServiceEndpoints};
use crate::http::{polling_client, RequestError};
use crate::stores::{decode_all_data, AllData, DataKind, ItemDescriptor};

const LATEST_ALL_PATH: &str = "/sdk/latest-all";

/// Result of a conditional request.
#[derive(Debug, PartialEq)]
pub(crate) enum Fetched<T> {
    /// The service answered 304: nothing changed since the last successful fetch.
    NotModified,
    Data(T),
}

#[derive(Clone, Debug, Default)]
struct Validators {
    etag: Option<String>,
    last_modified: Option<String>,
}

/// FeatureRequester fetches flag data from the polling endpoints.
///
/// Full-snapshot requests are conditional: the validators of the last 200 response are sent
/// back, so an unchanged snapshot costs a 304 and no store write.
pub(crate) struct FeatureRequester {
    client: reqwest::Client,
    base_url: String,
    filter: Option<String>,
    validators: Mutex<Option<Validators>>,
}

impl FeatureRequester {
    pub fn new(
        sdk_key: &str,
        endpoints: &ServiceEndpoints,
        http: &HttpConfig,
        filter: Option<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            client: polling_client(sdk_key, http)?,
            base_url: endpoints.polling(),
            filter,
            validators: Mutex::new(None),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.filter {
            Some(filter) => request.query(&[("filter", filter)]),
            None => request,
        }
    }

    pub async fn request_all(&self) -> Result<Fetched<AllData>, RequestError> {
        let mut request = self.get(LATEST_ALL_PATH);
        let validators = self.validators.lock().clone();
        if let Some(validators) = validators {
            if let Some(etag) = validators.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = validators.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => {
                debug!("Flag data has not changed since the last poll");
                Ok(Fetched::NotModified)
            }
            StatusCode::OK => {
                let header = |name| {
                    response
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                };
                let validators = Validators {
                    etag: header(ETAG),
                    last_modified: header(LAST_MODIFIED),
                };

                let body = response.bytes().await?;
                let all_data = decode_all_data(serde_json::from_slice(&body)?)?;
                *self.validators.lock() = Some(validators);
                Ok(Fetched::Data(all_data))
            }
            status => Err(RequestError::UnexpectedStatus {
                status: status.as_u16(),
            }),
        }
    }

    pub async fn request_item(
        &self,
        kind: DataKind,
        key: &str,
    ) -> Result<ItemDescriptor, RequestError> {
        let response = self.get(&kind.item_request_path(key)).send().await?;
        if response.status() != StatusCode::OK {
            return Err(RequestError::UnexpectedStatus {
                status: response.status().as_u16(),
            });
        }
        let body = response.bytes().await?;
        Ok(kind.deserialize(&body)?)
    }
}
