use std::future::Future;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::stream::{BoxError, FetchBody};

/// The live network call behind record mode and miss fallbacks.
///
/// Errors are handed to the caller untouched, so implementations should return the
/// underlying client error rather than a description of it.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: Request<Bytes>,
    ) -> impl Future<Output = Result<Response<FetchBody>, BoxError>> + Send;
}

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// HTTP/1.1 + HTTP/2 client over rustls with the platform's root certificates.
#[derive(Clone)]
pub struct HyperTransport {
    client: HttpsClient,
}

impl HyperTransport {
    pub fn new() -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl Transport for HyperTransport {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<FetchBody>, BoxError> {
        let request = request.map(Full::new);
        let response = self.client.request(request).await?;
        Ok(response.map(|body| {
            body.map_err(|err| -> BoxError { Box::new(err) })
                .boxed()
        }))
    }
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}
