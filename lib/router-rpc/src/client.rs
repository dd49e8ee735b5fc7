//! Client for a remote router

use crate::{Result, RpcError};
use reqwest::StatusCode;
use router_api::{
    Ack, ErrorResponse, LookupRequest, LookupResponse, ReadRequest, ReadResponse, WatchRequest,
    LOOKUP_PATH, SERVICE_ID, TABLE_CREATE_PATH, TABLE_DELETE_PATH, TABLE_READ_PATH,
    TABLE_UPDATE_PATH, WATCH_PATH,
};
use router_core::{Event, LookupQuery, ReadOptions, Route, RouterError, WatchOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

/// RouterClient calls a router served by `RouterServer`
#[derive(Clone, Debug)]
pub struct RouterClient {
    http: reqwest::Client,
    base_url: String,
}

impl RouterClient {
    /// Create a client for the router at `address` (`host:port` or a URL)
    pub fn new(address: impl AsRef<str>) -> Self {
        Self::with_client(reqwest::Client::new(), address)
    }

    pub fn with_client(http: reqwest::Client, address: impl AsRef<str>) -> Self {
        let address = address.as_ref().trim_end_matches('/');
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Look up routes for a service on the remote router
    pub async fn lookup(&self, service: &str, query: &LookupQuery) -> Result<Vec<Route>> {
        let response: LookupResponse = self
            .call(
                LOOKUP_PATH,
                &LookupRequest {
                    service: service.to_string(),
                    options: query.clone().into(),
                },
            )
            .await?;
        Ok(response.routes.into_iter().map(Into::into).collect())
    }

    /// Open a stream of the remote table's changes
    pub async fn watch(&self, options: WatchOptions) -> Result<RemoteWatcher> {
        let response = self
            .http
            .post(self.url(WATCH_PATH))
            .json(&WatchRequest {
                service: Some(options.service),
            })
            .send()
            .await?;
        let response = check(response).await?;
        Ok(RemoteWatcher {
            response,
            buffer: Vec::new(),
        })
    }

    /// The remote routing table
    pub fn table(&self) -> RemoteTable {
        RemoteTable {
            client: self.clone(),
        }
    }

    async fn call<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        trace!("Calling {}{}", self.base_url, path);
        let response = self.http.post(self.url(path)).json(request).send().await?;
        let response = check(response).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Map an error status to an error, 404 meaning no route
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.bytes().await?;
    if status == StatusCode::NOT_FOUND {
        return Err(RpcError::Router(RouterError::RouteNotFound));
    }

    let err = serde_json::from_slice::<ErrorResponse>(&body).unwrap_or_else(|_| {
        ErrorResponse::new(
            SERVICE_ID,
            status.as_u16(),
            String::from_utf8_lossy(&body).into_owned(),
        )
    });
    Err(RpcError::Status(err))
}

/// RemoteTable manipulates the table of a remote router
#[derive(Clone, Debug)]
pub struct RemoteTable {
    client: RouterClient,
}

impl RemoteTable {
    pub async fn create(&self, route: Route) -> Result<()> {
        let _: Ack = self
            .client
            .call(TABLE_CREATE_PATH, &router_api::Route::from(route))
            .await?;
        Ok(())
    }

    pub async fn update(&self, route: Route) -> Result<()> {
        let _: Ack = self
            .client
            .call(TABLE_UPDATE_PATH, &router_api::Route::from(route))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, route: Route) -> Result<()> {
        let _: Ack = self
            .client
            .call(TABLE_DELETE_PATH, &router_api::Route::from(route))
            .await?;
        Ok(())
    }

    pub async fn read(&self, options: ReadOptions) -> Result<Vec<Route>> {
        let response: ReadResponse = self
            .client
            .call(
                TABLE_READ_PATH,
                &ReadRequest {
                    service: options.service,
                },
            )
            .await?;
        Ok(response.routes.into_iter().map(Into::into).collect())
    }
}

/// RemoteWatcher reads the event stream of a remote table
#[derive(Debug)]
pub struct RemoteWatcher {
    response: reqwest::Response,
    buffer: Vec<u8>,
}

impl RemoteWatcher {
    /// Next table event. Fails with `WatcherStopped` once the stream ends.
    pub async fn next(&mut self) -> Result<Event> {
        loop {
            if let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=end).collect();
                let line = &line[..end];
                if line.is_empty() {
                    continue;
                }
                let event: router_api::Event = serde_json::from_slice(line)?;
                return Ok(event.into());
            }

            match self.response.chunk().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => return Err(RpcError::Router(RouterError::WatcherStopped)),
            }
        }
    }

    /// Close the stream
    pub fn stop(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(
            RouterClient::new("127.0.0.1:8084").base_url(),
            "http://127.0.0.1:8084"
        );
        assert_eq!(
            RouterClient::new("http://router:8084/").base_url(),
            "http://router:8084"
        );
    }
}
