use std::{
    fmt,
    time::Duration,
};

use log::{debug, trace};
use reqwest::{
    header::{
        AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, COOKIE, HeaderMap, RANGE,
        SET_COOKIE,
    },
    Method, Request, Response, StatusCode,
};
use thiserror::Error;
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::{
    constants::{CLOUD_BASE_URL, FUS_BASE_URL, NONCE_ENDPOINT, USER_AGENT},
    crypto::{self, CryptoError, FusKeys},
};

/// Response header carrying a freshly issued, encrypted nonce
const NONCE_HEADER: &str = "NONCE";
/// Name of the sticky session cookie
const SESSION_COOKIE: &str = "JSESSIONID";
/// Connect timeout used by the official client
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(25_000);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to initialize HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("HTTP request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP request to {url} returned {status}")]
    Status {
        url: String,
        status: StatusCode,
    },
    #[error("Failed to read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl TransportError {
    /// Turn a non-2xx response into [`TransportError::Status`].
    pub fn check_status(response: Response) -> Result<Response, Self> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(Self::Status {
                url: response.url().to_string(),
                status,
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Handshake with {endpoint} failed: server did not provide a nonce ({status})")]
    HandshakeFailed {
        endpoint: &'static str,
        status: StatusCode,
    },
    #[error("Session is not authenticated (state: {0})")]
    NotAuthenticated(SessionState),
    #[error("Invalid nonce received from {endpoint}: {source}")]
    Nonce {
        endpoint: String,
        #[source]
        source: CryptoError,
    },
    #[error("Failed to serialize request XML: {0}")]
    Xml(#[from] xmltree::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle of a [`FusSession`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// No nonce has been requested yet
    Uninitialized,
    /// The session holds a nonce and can sign requests
    Authenticated,
    /// The bootstrap handshake failed
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Authenticated => f.write_str("authenticated"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// The mutable per-session secrets. These are only ever replaced as a whole so
/// that a token is never sent alongside a cookie from a different exchange.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct SessionSecrets {
    encrypted_nonce: String,
    nonce: String,
    signature: String,
    session_id: String,
}

impl SessionSecrets {
    /// Opaque base64 token last issued by the server.
    pub fn encrypted_nonce(&self) -> &str {
        &self.encrypted_nonce
    }

    /// Plaintext nonce recovered from [`Self::encrypted_nonce`].
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Nonce re-encrypted with the session key.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Sticky `JSESSIONID` cookie value.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Compute the secrets implied by a newly issued nonce token. The session
    /// cookie from the same response is used if there was one. Otherwise, the
    /// current cookie is carried over.
    pub fn rotate(
        &self,
        keys: &FusKeys,
        token: &str,
        session_id: Option<&str>,
    ) -> Result<Self, CryptoError> {
        let nonce = crypto::decrypt_nonce(keys, token)?;
        let signature = crypto::sign_nonce(keys, &nonce)?;

        Ok(Self {
            encrypted_nonce: token.trim().to_owned(),
            nonce,
            signature,
            session_id: session_id.unwrap_or(&self.session_id).to_owned(),
        })
    }
}

impl fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSecrets")
            .field("encrypted_nonce", &self.encrypted_nonce)
            .field("nonce", &"<redacted>")
            .field("signature", &self.signature)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// A type representing the Authorization field for FUS requests.
#[derive(Debug)]
struct Authorization<'a> {
    nonce: &'a str,
    signature: &'a str,
    nc: &'a str,
    type_: &'a str,
    realm: &'a str,
    newauth: bool,
}

impl<'a> From<&'a SessionSecrets> for Authorization<'a> {
    fn from(secrets: &'a SessionSecrets) -> Self {
        Self {
            nonce: &secrets.encrypted_nonce,
            signature: &secrets.signature,
            nc: "",
            type_: "",
            realm: "",
            // Only the encrypted nonce mechanism is supported
            newauth: true,
        }
    }
}

impl fmt::Display for Authorization<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FUS nonce=\"{}\", signature=\"{}\", nc=\"{}\", type=\"{}\", realm=\"{}\", newauth=\"{}\"",
            self.nonce,
            self.signature,
            self.nc,
            self.type_,
            self.realm,
            u8::from(self.newauth),
        )
    }
}

/// Which FUS host a request is sent to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Host {
    /// Authenticated metadata and control endpoints
    Fus,
    /// Bulk binary downloads
    Cloud,
}

/// A single request to be signed and sent by [`FusSession::send`].
#[derive(Debug)]
pub struct FusRequest<'a> {
    endpoint: &'a str,
    method: Method,
    host: Host,
    body: Option<Vec<u8>>,
    query: Option<String>,
    resume_offset: Option<u64>,
}

impl<'a> FusRequest<'a> {
    fn new(method: Method, endpoint: &'a str) -> Self {
        Self {
            endpoint,
            method,
            host: Host::Fus,
            body: None,
            query: None,
            resume_offset: None,
        }
    }

    pub fn post(endpoint: &'a str) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn get(endpoint: &'a str) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the raw query string. It is appended verbatim because FUS returns
    /// HTTP 405 if the requested file name is URL-encoded.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn host(mut self, host: Host) -> Self {
        self.host = host;
        self
    }

    /// Request the response body starting at `offset`. An offset of 0 sends no
    /// `Range` header.
    pub fn resume_from(mut self, offset: u64) -> Self {
        self.resume_offset = Some(offset);
        self
    }
}

/// Builder type for creating FUS sessions with non-default behavior.
#[derive(Clone)]
pub struct SessionBuilder {
    keys: FusKeys,
    ignore_tls_validation: bool,
    no_proxy: bool,
    connect_timeout: Duration,
    fus_base_url: String,
    cloud_base_url: String,
}

impl SessionBuilder {
    pub fn new(keys: FusKeys) -> Self {
        Self {
            keys,
            ignore_tls_validation: false,
            no_proxy: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            fus_base_url: FUS_BASE_URL.to_owned(),
            cloud_base_url: CLOUD_BASE_URL.to_owned(),
        }
    }

    /// Ignore TLS certificate validation when performing HTTPS requests. By
    /// default, TLS certificate validation is enabled.
    pub fn ignore_tls_validation(mut self, value: bool) -> Self {
        self.ignore_tls_validation = value;
        self
    }

    /// Bypass any proxy configured through the environment.
    pub fn no_proxy(mut self, value: bool) -> Self {
        self.no_proxy = value;
        self
    }

    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Override the host serving the authenticated endpoints.
    pub fn fus_base_url(mut self, url: impl Into<String>) -> Self {
        self.fus_base_url = url.into();
        self
    }

    /// Override the host serving firmware binaries.
    pub fn cloud_base_url(mut self, url: impl Into<String>) -> Self {
        self.cloud_base_url = url.into();
        self
    }

    /// Build an HTTP client with the transport options of this builder.
    pub fn http_client(&self) -> Result<reqwest::Client, TransportError> {
        debug!("TLS validation enabled: {}", !self.ignore_tls_validation);

        let mut builder = reqwest::ClientBuilder::new()
            .danger_accept_invalid_certs(self.ignore_tls_validation)
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
            .referer(false);
        if self.no_proxy {
            builder = builder.no_proxy();
        }

        builder.build().map_err(TransportError::Client)
    }

    /// Build a session without performing the handshake.
    pub fn build(&self) -> Result<FusSession, TransportError> {
        Ok(FusSession {
            client: self.http_client()?,
            keys: self.keys.clone(),
            fus_base_url: self.fus_base_url.trim_end_matches('/').to_owned(),
            cloud_base_url: self.cloud_base_url.trim_end_matches('/').to_owned(),
            secrets: SessionSecrets::default(),
            state: SessionState::Uninitialized,
        })
    }

    /// Build a session and authenticate it.
    pub async fn connect(&self) -> Result<FusSession, ProtocolError> {
        let mut session = self.build()?;
        session.handshake().await?;
        Ok(session)
    }
}

/// An authenticated FUS session. Every response may rotate the nonce that the
/// next request must be signed with, so requests take `&mut self` and are
/// strictly sequential.
pub struct FusSession {
    client: reqwest::Client,
    keys: FusKeys,
    fus_base_url: String,
    cloud_base_url: String,
    secrets: SessionSecrets,
    state: SessionState,
}

impl fmt::Debug for FusSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusSession")
            .field("keys", &"<redacted>")
            .field("fus_base_url", &self.fus_base_url)
            .field("cloud_base_url", &self.cloud_base_url)
            .field("secrets", &self.secrets)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl FusSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn secrets(&self) -> &SessionSecrets {
        &self.secrets
    }

    /// The current plaintext nonce, used as the `LOGIC_CHECK` selector.
    pub fn nonce(&self) -> Result<&str, ProtocolError> {
        match self.state {
            SessionState::Authenticated => Ok(&self.secrets.nonce),
            s => Err(ProtocolError::NotAuthenticated(s)),
        }
    }

    /// Request the initial nonce. The session is marked as failed if the
    /// request fails or the server does not issue a usable nonce.
    pub async fn handshake(&mut self) -> Result<(), ProtocolError> {
        let (response, rotated) = match self.execute(FusRequest::post(NONCE_ENDPOINT)).await {
            Ok(r) => r,
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(e);
            }
        };

        if !rotated {
            self.state = SessionState::Failed;
            return Err(ProtocolError::HandshakeFailed {
                endpoint: NONCE_ENDPOINT,
                status: response.status(),
            });
        }

        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Sign and send a request. The response is returned regardless of its
    /// HTTP status, but any nonce it carries has already been absorbed.
    pub async fn send(&mut self, request: FusRequest<'_>) -> Result<Response, ProtocolError> {
        if self.state != SessionState::Authenticated {
            return Err(ProtocolError::NotAuthenticated(self.state));
        }

        self.execute(request).await.map(|(r, _)| r)
    }

    /// Send a request and absorb the secrets from its response. Also returns
    /// whether the nonce was rotated.
    async fn execute(
        &mut self,
        request: FusRequest<'_>,
    ) -> Result<(Response, bool), ProtocolError> {
        let endpoint = request.endpoint;
        let http_request = self.build_request(request)?;
        let url = http_request.url().to_string();

        debug!("{} {url}", http_request.method().as_str());

        let response = self.client.execute(http_request).await
            .map_err(|source| TransportError::Request { url: url.clone(), source })?;

        debug!("{} from {url}", response.status());

        let rotated = self.absorb(endpoint, response.headers())?;

        Ok((response, rotated))
    }

    fn build_request(&self, request: FusRequest<'_>) -> Result<Request, TransportError> {
        let base = match request.host {
            Host::Fus => &self.fus_base_url,
            Host::Cloud => &self.cloud_base_url,
        };
        let mut url = format!("{}/{}", base, request.endpoint);
        if let Some(q) = &request.query {
            url.push('?');
            url.push_str(q);
        }

        let mut builder = self.client.request(request.method.clone(), &url)
            .header(AUTHORIZATION, Authorization::from(&self.secrets).to_string())
            .header(CACHE_CONTROL, "no-cache");

        if !self.secrets.session_id.is_empty() {
            builder = builder.header(COOKIE,
                format!("{SESSION_COOKIE}={}", self.secrets.session_id));
        }

        if let Some(offset) = request.resume_offset.filter(|o| *o > 0) {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }

        builder = match request.body {
            Some(body) => builder.body(body),
            None if request.method == Method::POST => builder.header(CONTENT_LENGTH, 0),
            None => builder,
        };

        builder.build().map_err(|source| TransportError::Request { url, source })
    }

    /// Update the session secrets from response headers. Returns whether the
    /// nonce was rotated.
    ///
    /// The nonce, signature and session cookie only ever change together. A
    /// `JSESSIONID` cookie that arrives without a `NONCE` header is ignored,
    /// so the cookie can never be paired with a nonce issued for a different
    /// session.
    fn absorb(&mut self, endpoint: &str, headers: &HeaderMap) -> Result<bool, ProtocolError> {
        let session_id = session_cookie(headers);

        // A token that is not ASCII is rejected by the base64 decoder
        let token = match headers.get(NONCE_HEADER) {
            Some(v) => String::from_utf8_lossy(v.as_bytes()),
            None => {
                if let Some(id) = session_id {
                    if id != self.secrets.session_id {
                        debug!("Ignoring session cookie from {endpoint} without a new nonce");
                    }
                }
                return Ok(false);
            }
        };

        trace!("Nonce token from {endpoint}: {token}");

        self.secrets = self.secrets.rotate(&self.keys, &token, session_id.as_deref())
            .map_err(|source| ProtocolError::Nonce {
                endpoint: endpoint.to_owned(),
                source,
            })?;

        debug!("Nonce rotated by {endpoint}");

        Ok(true)
    }
}

/// Find the `JSESSIONID` value in the `Set-Cookie` headers.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers.get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|v| v.split_once('='))
        .find(|(name, _)| name.trim() == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_owned())
}

fn create_text_node(name: &str, text: &str) -> XMLNode {
    let mut elem = Element::new(name);
    elem.children.push(XMLNode::Text(text.to_owned()));
    XMLNode::Element(elem)
}

/// Serialize a FUS request document. Fields are emitted in the given order as
/// `FUSBody/Put/<name>/Data` nodes.
pub fn build_request_xml(fields: &[(&str, &str)]) -> Result<Vec<u8>, xmltree::Error> {
    let mut hdr = Element::new("FUSHdr");
    hdr.children.push(create_text_node("ProtoVer", "1.0"));

    let mut put = Element::new("Put");
    for (name, value) in fields {
        let mut field = Element::new(name);
        field.children.push(create_text_node("Data", value));
        put.children.push(XMLNode::Element(field));
    }

    let mut body = Element::new("FUSBody");
    body.children.push(XMLNode::Element(put));

    let mut msg = Element::new("FUSMsg");
    msg.children.push(XMLNode::Element(hdr));
    msg.children.push(XMLNode::Element(body));

    let mut buf = vec![];
    msg.write_with_config(&mut buf, EmitterConfig::new().write_document_declaration(false))?;

    Ok(buf)
}
