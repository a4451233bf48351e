//! In-process HTTP server for exercising the client against canned replies.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::Response,
    Router,
};
use tokio::net::TcpListener;

pub const TEST_FIXED_KEY: &[u8] = b"testing_testing_testing_testing_";
pub const TEST_FLEXIBLE_KEY_SUFFIX: &[u8] = b"testing_testing_";
/// Encrypted form of the nonce `testing_testing_` under the test keys
pub const TEST_NONCE_TOKEN: &str = "yrJiFOygpIxnq4nbWdT2NLk1Odu8m5+zcFKQL4PzV0A=";
pub const TEST_NONCE: &str = "testing_testing_";
/// Encrypted form of the nonce `0123456789ABCDEFxyz` under the test keys
pub const ROTATED_NONCE_TOKEN: &str = "QM6tWHgLFIQwAVlHk791mRVTRODA6OSLNKgdeCHI+hY=";
pub const ROTATED_NONCE: &str = "0123456789ABCDEFxyz";
pub const ROTATED_SIGNATURE: &str = "dwIetgK7U76es8slKI1/EpqYmk2nk/koPyLNcndCDGk=";

#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: vec![],
            body: vec![],
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap();

        for (name, value) in self.headers {
            // Raw bytes so that non-ASCII values reach the client untouched
            let value = HeaderValue::from_bytes(value.as_bytes()).unwrap();
            response.headers_mut().append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(), value);
        }

        response
    }
}

type Handler = dyn Fn(&Request) -> Reply + Send + Sync;

#[derive(Clone)]
struct ServerState {
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<Request>>>,
}

pub struct FakeServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl FakeServer {
    /// Serve every path with `handler`. Requests are recorded in the order
    /// they arrive.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let requests = Arc::new(Mutex::new(vec![]));
        let state = ServerState {
            handler: Arc::new(handler),
            requests: requests.clone(),
        };

        let app = Router::new()
            .fallback(record_and_reply)
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

async fn record_and_reply(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = Request {
        method: method.to_string(),
        target: uri.to_string(),
        headers: headers.iter()
            .map(|(n, v)| (n.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect(),
        body: body.to_vec(),
    };

    let reply = (state.handler)(&request);
    state.requests.lock().unwrap().push(request);

    reply.into_response()
}
