//! HTTP service served on the process's listener.
//!
//! Every request is answered with `URL` followed by the request URI. The
//! `x-moult-pid` header names the process that served it, which makes a
//! restart visible from the outside.

use std::io;
use std::time::Duration;

use axum::{http::Uri, response::IntoResponse, Router};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto::Builder,
    service::TowerToHyperService,
};
use moult_ecdysis::Service;
use tokio::net::TcpListener;
use tracing::{debug, info};

pub const PID_HEADER: &str = "x-moult-pid";

pub fn create_router() -> Router {
    Router::new().fallback(echo_url)
}

async fn echo_url(uri: Uri) -> impl IntoResponse {
    ([(PID_HEADER, std::process::id().to_string())], format!("URL{uri}"))
}

/// Accept loop handing each connection to hyper on its own task.
pub struct HttpService {
    router: Router,
    conn_builder: Builder<TokioExecutor>,
}

impl HttpService {
    pub fn new(router: Router, read_timeout: Duration) -> Self {
        let mut conn_builder = Builder::new(TokioExecutor::new());
        conn_builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(read_timeout);

        Self { router, conn_builder }
    }
}

impl Service for HttpService {
    async fn serve(&self, listener: &TcpListener) -> io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "HTTP service accepting connections");

        loop {
            let (stream, peer) = listener.accept().await?;
            let service = TowerToHyperService::new(self.router.clone());
            let conn_builder = self.conn_builder.clone();

            tokio::spawn(async move {
                if let Err(e) = conn_builder.serve_connection(TokioIo::new(stream), service).await {
                    debug!(%peer, error = %e, "Connection ended with error");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn request(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_echoes_request_uri() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = HttpService::new(create_router(), Duration::from_secs(6));

        let server = async move { service.serve(&listener).await };
        let client = async move {
            let response = request(addr, "/hello/world?x=1").await;
            assert!(response.starts_with("HTTP/1.1 200"), "{response}");
            assert!(response.ends_with("URL/hello/world?x=1"), "{response}");
            let pid_line = format!("x-moult-pid: {}", std::process::id());
            assert!(response.contains(&pid_line), "{response}");
        };

        tokio::select! {
            result = server => panic!("server stopped: {result:?}"),
            () = client => {}
        }
    }
}
