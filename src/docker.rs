//! Main entrypoint for interacting with the Docker API.
//!
//! API Reference: <https://docs.docker.com/engine/api/v1.41/>

use std::{env, io};
#[cfg(feature = "tls")]
use std::path::Path;

use futures_util::{future, stream::Stream, TryStreamExt};
use hyper::{client::HttpConnector, Body, Client, Method};
use mime::Mime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    container::Containers,
    errors::{Error, Result},
    image::Images,
    transport::{Headers, Payload, Transport},
};

#[cfg(feature = "tls")]
use hyper_openssl::HttpsConnector;
#[cfg(feature = "tls")]
use openssl::ssl::{SslConnector, SslFiletype, SslMethod};

#[cfg(feature = "unix-socket")]
use hyperlocal::UnixConnector;

/// Daemon address used when `DOCKER_HOST` is unset
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Entrypoint interface for communicating with docker daemon
#[derive(Debug, Clone)]
pub struct Docker {
    transport: Transport,
}

fn get_http_connector() -> HttpConnector {
    let mut http = HttpConnector::new();
    http.enforce_http(false);

    http
}

#[cfg(feature = "tls")]
fn get_docker_for_tcp_tls(
    host: String,
    cert_path: &Path,
    verify: bool,
) -> Result<Docker> {
    let http = get_http_connector();
    let mut connector = SslConnector::builder(SslMethod::tls())?;
    connector.set_cipher_list("DEFAULT")?;
    let cert = cert_path.join("cert.pem");
    let key = cert_path.join("key.pem");
    connector.set_certificate_file(cert.as_path(), SslFiletype::PEM)?;
    connector.set_private_key_file(key.as_path(), SslFiletype::PEM)?;
    if verify {
        let ca = cert_path.join("ca.pem");
        connector.set_ca_file(ca.as_path())?;
    }

    Ok(Docker {
        transport: Transport::EncryptedTcp {
            client: Client::builder().build(HttpsConnector::with_connector(http, connector)?),
            host: format!("https://{}", host),
        },
    })
}

/// Authority of a `tcp://` host, the only scheme upgraded to TLS from the environment
#[cfg(feature = "tls")]
fn tcp_authority(host: &str) -> Option<&str> {
    let mut it = host.split("://");
    match (it.next(), it.next()) {
        (Some("tcp"), Some(authority)) if !authority.is_empty() => Some(authority),
        _ => None,
    }
}

impl Docker {
    /// Connects to a daemon at `uri`, picking the transport from its scheme:
    /// `unix://` (with feature `unix-socket`), `tcp://` or `http://`.
    ///
    /// TLS connections are made with [Docker::tls](Docker::tls) or [Docker::from_env](Docker::from_env).
    pub fn new<S>(uri: S) -> Result<Docker>
    where
        S: AsRef<str>,
    {
        let uri = uri.as_ref();
        let mut it = uri.split("://");

        match it.next() {
            #[cfg(feature = "unix-socket")]
            Some("unix") => {
                if let Some(path) = it.next() {
                    Ok(Docker::unix(path))
                } else {
                    Err(Error::MissingAuthority)
                }
            }
            #[cfg(not(feature = "unix-socket"))]
            Some("unix") => Err(Error::UnsupportedScheme("unix".to_string())),
            Some("tcp") | Some("http") => {
                if let Some(host) = it.next() {
                    Ok(Docker::tcp(host))
                } else {
                    Err(Error::MissingAuthority)
                }
            }
            Some(scheme) => Err(Error::UnsupportedScheme(scheme.to_string())),
            // split always yields at least one element
            None => unreachable!(),
        }
    }

    /// Creates a Docker instance the way the docker cli would, from `DOCKER_HOST`,
    /// `DOCKER_CERT_PATH` and `DOCKER_TLS_VERIFY`.
    ///
    /// A tcp host is upgraded to TLS when a certificate path is configured.
    pub fn from_env() -> Result<Docker> {
        let host = env::var("DOCKER_HOST").unwrap_or_else(|_| DEFAULT_DOCKER_HOST.to_owned());
        Docker::from_host(host)
    }

    /// Like [Docker::from_env](Docker::from_env) but with an explicit host uri
    pub fn from_host<S>(host: S) -> Result<Docker>
    where
        S: AsRef<str>,
    {
        let host = host.as_ref();
        log::debug!("connecting to docker daemon at {}", host);
        #[cfg(feature = "tls")]
        {
            let certs = env::var("DOCKER_CERT_PATH");
            if let (Ok(certs), Some(authority)) = (certs, tcp_authority(host)) {
                let verify = env::var("DOCKER_TLS_VERIFY").is_ok();
                log::debug!("using client certificates from {}", certs);
                return Docker::tls(authority, certs, verify);
            }
        }
        Docker::new(host)
    }

    /// Connects to a daemon listening on the Unix socket at `socket_path`, e.g. `/run/docker.sock`
    #[cfg(feature = "unix-socket")]
    pub fn unix<S>(socket_path: S) -> Docker
    where
        S: Into<String>,
    {
        Docker {
            transport: Transport::Unix {
                client: Client::builder()
                    .pool_max_idle_per_host(0)
                    .build(UnixConnector),
                path: socket_path.into(),
            },
        }
    }

    /// Connects over TLS to the daemon at `host` (an authority such as `10.0.0.5:2376`).
    ///
    /// `cert_path` holds the client's `cert.pem` and `key.pem`, plus `ca.pem` used when `verify` is set.
    #[cfg(feature = "tls")]
    pub fn tls<S, P>(
        host: S,
        cert_path: P,
        verify: bool,
    ) -> Result<Docker>
    where
        S: Into<String>,
        P: AsRef<Path>,
    {
        get_docker_for_tcp_tls(host.into(), cert_path.as_ref(), verify)
    }

    /// Connects to a daemon at `host` over plain http
    pub fn tcp<S>(host: S) -> Docker
    where
        S: Into<String>,
    {
        let http = get_http_connector();
        Docker {
            transport: Transport::Tcp {
                client: Client::builder().build(http),
                host: format!("tcp://{}", host.into()),
            },
        }
    }

    pub fn images(&'_ self) -> Images<'_> {
        Images::new(self)
    }

    pub fn containers(&'_ self) -> Containers<'_> {
        Containers::new(self)
    }

    /// Daemon and API version; a cheap way to check the daemon answers
    pub async fn version(&self) -> Result<Version> {
        self.get_json("/version").await
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<T> {
        let body = self
            .transport
            .request(Method::GET, endpoint, Payload::None, Headers::None)
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub(crate) async fn post(
        &self,
        endpoint: &str,
        body: Option<(Body, Mime)>,
    ) -> Result<String> {
        self.transport
            .request(Method::POST, endpoint, body, Headers::None)
            .await
    }

    pub(crate) async fn post_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: Option<(Body, Mime)>,
    ) -> Result<T> {
        let response = self.post(endpoint, body).await?;
        Ok(serde_json::from_str(&response)?)
    }

    pub(crate) async fn delete(
        &self,
        endpoint: &str,
    ) -> Result<String> {
        self.transport
            .request(Method::DELETE, endpoint, Payload::None, Headers::None)
            .await
    }

    /// Send a streaming post request that returns a stream of JSON values
    ///
    /// The daemon writes one JSON value per line; chunk boundaries may fall anywhere.
    pub(crate) fn stream_post_into_values<'a, H>(
        &'a self,
        endpoint: impl AsRef<str> + 'a,
        body: Option<(Body, Mime)>,
        headers: Option<H>,
    ) -> impl Stream<Item = Result<Value>> + 'a
    where
        H: IntoIterator<Item = (&'static str, String)> + 'a,
    {
        let reader = Box::pin(
            self.transport
                .stream_chunks(Method::POST, endpoint, body, headers)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        )
        .into_async_read();

        futures_codec::FramedRead::new(reader, futures_codec::LinesCodec {})
            .map_err(Error::IO)
            .try_filter(|line| future::ready(!line.trim().is_empty()))
            .and_then(|line: String| async move {
                serde_json::from_str(&line).map_err(Error::SerdeJsonError)
            })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Version {
    pub version: String,
    pub api_version: String,
    pub git_commit: String,
    pub go_version: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
    pub build_time: String,
}

#[cfg(test)]
mod tests {
    use super::{Docker, Error};
    #[test]
    fn creates_correct_docker() {
        let d = Docker::new("tcp://127.0.0.1:80");
        d.unwrap();
        let d = Docker::new("http://127.0.0.1:80");
        d.unwrap();

        #[cfg(feature = "unix-socket")]
        {
            let d = Docker::new("unix:///var/run/docker.sock");
            d.unwrap();
        }

        #[cfg(not(feature = "unix-socket"))]
        {
            let d = Docker::new("unix:///var/run/docker.sock");
            match d.unwrap_err() {
                Error::UnsupportedScheme(scheme) if &scheme == "unix" => {}
                e => panic!(r#"Expected Error::UnsupportedScheme("unix"), got {}"#, e),
            }
        }

        let d = Docker::new("rand://127.0.0.1:80");
        match d.unwrap_err() {
            Error::UnsupportedScheme(scheme) if &scheme == "rand" => {}
            e => panic!(r#"Expected Error::UnsupportedScheme("rand"), got {}"#, e),
        }

        let d = Docker::new("invalid_uri");
        match d.unwrap_err() {
            Error::UnsupportedScheme(scheme) if &scheme == "invalid_uri" => {}
            e => panic!(
                r#"Expected Error::UnsupportedScheme("invalid_uri"), got {}"#,
                e
            ),
        }
        let d = Docker::new("");
        match d.unwrap_err() {
            Error::UnsupportedScheme(scheme) if scheme.is_empty() => {}
            e => panic!(r#"Expected Error::UnsupportedScheme(""), got {}"#, e),
        }
    }

    #[cfg(feature = "tls")]
    #[test]
    fn only_tcp_hosts_switch_to_tls() {
        use super::tcp_authority;

        assert_eq!(tcp_authority("tcp://10.0.0.5:2376"), Some("10.0.0.5:2376"));
        assert_eq!(tcp_authority("tcp://"), None);
        assert_eq!(tcp_authority("http://10.0.0.5:2375"), None);
        assert_eq!(tcp_authority("unix:///var/run/docker.sock"), None);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn tls_reads_client_certificates() {
        let dir = std::env::temp_dir().join("imageswap-missing-certs");
        match Docker::tls("10.0.0.5:2376", &dir, false) {
            Err(Error::Tls(_)) => {}
            other => panic!("expected a certificate error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn explicit_host_without_certs_is_plain() {
        // DOCKER_CERT_PATH is not set in the test environment
        if std::env::var("DOCKER_CERT_PATH").is_err() {
            let d = Docker::from_host("tcp://127.0.0.1:2375").unwrap();
            assert_eq!(format!("{:?}", d.transport), "Tcp(tcp://127.0.0.1:2375)");
        }
    }
}
