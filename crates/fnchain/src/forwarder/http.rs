use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use crate::context::CallContext;
use crate::error::CallError;
use crate::options::CallOptions;
use crate::resolve::HostConfig;
use crate::runnable::{PIPE_CAPACITY, Runnable};

/// One hop served by a plain HTTP endpoint: input is the POST body, the
/// response body is the output, options become the query string.
#[derive(Debug, Clone)]
pub struct HttpCall {
    client: reqwest::Client,
    url: reqwest::Url,
    endpoint: String,
}

impl HttpCall {
    pub fn new(client: reqwest::Client, host: &HostConfig) -> Result<Self, CallError> {
        let endpoint = host.endpoint();
        let url = reqwest::Url::parse(&format!("http://{endpoint}/"))
            .map_err(|e| CallError::Malformed(format!("invalid http endpoint {endpoint}: {e}")))?;
        Ok(Self {
            client,
            url,
            endpoint,
        })
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }

    async fn exchange(
        &self,
        request: reqwest::RequestBuilder,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        let mut response = request
            .send()
            .await
            .map_err(|e| CallError::transport(&self.endpoint, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Remote {
                endpoint: self.endpoint.clone(),
                message: format!("HTTP {status}: {}", body.trim()),
            });
        }
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CallError::transport(&self.endpoint, e))?
        {
            output.write_all(&chunk).await?;
        }
        output.flush().await?;
        Ok(())
    }
}

/// Copy the caller's input into the request body pipe.
///
/// The body is dropped once the server answers; that is not an error.
async fn feed_body(
    input: &mut (dyn AsyncRead + Send + Unpin),
    mut pipe: tokio::io::DuplexStream,
) -> Result<(), CallError> {
    match tokio::io::copy(input, &mut pipe).await {
        Ok(_) => {
            let _ = pipe.shutdown().await;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Runnable for HttpCall {
    async fn run(
        &self,
        ctx: &CallContext,
        options: &CallOptions,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        if let Some(err) = ctx.error() {
            return Err(err);
        }
        let mut url = self.url.clone();
        options.apply_to_url(&mut url);

        let (pipe, body) = tokio::io::duplex(PIPE_CAPACITY);
        let request = self
            .client
            .post(url)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body)));

        let feed = feed_body(input, pipe);
        let exchange = self.exchange(request, output);
        tokio::pin!(feed, exchange);

        let mut fed = false;
        loop {
            tokio::select! {
                res = &mut feed, if !fed => {
                    res?;
                    fed = true;
                }
                res = &mut exchange => break res,
                err = ctx.done() => break Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::Transport;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    struct Upper;

    impl Respond for Upper {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            ResponseTemplate::new(200).set_body_bytes(request.body.to_ascii_uppercase())
        }
    }

    fn call_for(server: &MockServer) -> HttpCall {
        let addr = server.address();
        let host = HostConfig {
            transport: Transport::Http,
            host: addr.ip().to_string(),
            port: addr.port(),
            options: CallOptions::new(),
        };
        HttpCall::new(reqwest::Client::new(), &host).unwrap()
    }

    async fn run(call: &HttpCall, ctx: &CallContext, options: &CallOptions, input: &[u8]) -> (Result<(), CallError>, Vec<u8>) {
        let mut input = input;
        let mut out = Vec::new();
        let res = call.run(ctx, options, &mut input, &mut out).await;
        (res, out)
    }

    #[tokio::test]
    async fn posts_input_and_streams_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(query_param("n", "3"))
            .respond_with(Upper)
            .expect(1)
            .mount(&server)
            .await;

        let call = call_for(&server);
        let input = b"hello over http".repeat(10_000);
        let (res, out) = run(&call, &CallContext::new(), &CallOptions::parse(["n=3"]), &input).await;
        res.unwrap();
        assert_eq!(out, input.to_ascii_uppercase());
    }

    #[tokio::test]
    async fn error_status_is_remote_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("exploded\n"))
            .mount(&server)
            .await;

        let call = call_for(&server);
        let (res, out) = run(&call, &CallContext::new(), &CallOptions::new(), b"x").await;
        match res.unwrap_err() {
            CallError::Remote { message, .. } => {
                assert!(message.contains("500"), "{message}");
                assert!(message.ends_with("exploded"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn slow_endpoint_honors_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let call = call_for(&server);
        let ctx = CallContext::new().with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let (res, _) = run(&call, &ctx, &CallOptions::new(), b"x").await;
        assert!(matches!(res.unwrap_err(), CallError::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let host = HostConfig {
            transport: Transport::Http,
            host: "127.0.0.1".into(),
            port,
            options: CallOptions::new(),
        };
        let call = HttpCall::new(reqwest::Client::new(), &host).unwrap();
        let (res, _) = run(&call, &CallContext::new(), &CallOptions::new(), b"x").await;
        assert_eq!(res.unwrap_err().kind(), crate::ErrorKind::Transport);
    }
}
