use std::sync::Arc;

use futures::{StreamExt, stream::BoxStream};
use http::header::WWW_AUTHENTICATE;
use reqwest::header::ACCEPT;
use rmcp::{
    model::{ClientJsonRpcMessage, ServerJsonRpcMessage},
    transport::streamable_http_client::{
        AuthRequiredError, SseError, StreamableHttpClient, StreamableHttpError,
        StreamableHttpPostResponse,
    },
};
use sse_stream::{Sse, SseStream};
use tracing::debug;

const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
const JSON_MIME_TYPE: &str = "application/json";

/// The round-tripper decoration for remote backends: the wrapped
/// `reqwest::Client` carries the backend's evaluated headers as defaults,
/// and this wrapper defensively sets `Accept` on POSTs only when the
/// backend spec did not pin one itself (GETs delegate to the inner client,
/// which already asks for an event stream).
///
/// Response handling is lenient: a 200 with a missing or unexpected
/// Content-Type is decoded as JSON when possible and otherwise treated as
/// an acknowledgment, since some remote servers omit the header on
/// notification responses.
#[derive(Clone)]
pub struct DecoratedClient {
    inner: reqwest::Client,
    /// The backend spec pinned its own Accept header.
    accept_pinned: bool,
}

impl DecoratedClient {
    pub fn new(client: reqwest::Client, accept_pinned: bool) -> Self {
        Self {
            inner: client,
            accept_pinned,
        }
    }
}

impl StreamableHttpClient for DecoratedClient {
    type Error = reqwest::Error;

    async fn get_stream(
        &self,
        uri: Arc<str>,
        session_id: Arc<str>,
        last_event_id: Option<String>,
        auth_token: Option<String>,
    ) -> Result<BoxStream<'static, Result<Sse, SseError>>, StreamableHttpError<Self::Error>> {
        self.inner
            .get_stream(uri, session_id, last_event_id, auth_token)
            .await
    }

    async fn delete_session(
        &self,
        uri: Arc<str>,
        session_id: Arc<str>,
        auth_token: Option<String>,
    ) -> Result<(), StreamableHttpError<Self::Error>> {
        self.inner.delete_session(uri, session_id, auth_token).await
    }

    async fn post_message(
        &self,
        uri: Arc<str>,
        message: ClientJsonRpcMessage,
        session_id: Option<Arc<str>>,
        auth_token: Option<String>,
    ) -> Result<StreamableHttpPostResponse, StreamableHttpError<Self::Error>> {
        let mut request = self.inner.post(uri.as_ref());
        if !self.accept_pinned {
            // The request body is JSON, so ask for JSON back; the response
            // branch below still accepts a stream if the server sends one.
            request = request.header(ACCEPT, JSON_MIME_TYPE);
        }
        if let Some(auth_header) = auth_token {
            request = request.bearer_auth(auth_header);
        }
        if let Some(session_id) = session_id {
            request = request.header(HEADER_SESSION_ID, session_id.as_ref());
        }
        let response = request.json(&message).send().await?;

        // A 401 with a challenge is surfaced so the authorization
        // orchestrator can take over.
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            && let Some(header) = response.headers().get(WWW_AUTHENTICATE)
        {
            let header = header
                .to_str()
                .map_err(|_| {
                    StreamableHttpError::UnexpectedServerResponse(
                        "invalid www-authenticate header value".into(),
                    )
                })?
                .to_string();
            return Err(StreamableHttpError::AuthRequired(AuthRequiredError {
                www_authenticate_header: header,
            }));
        }

        let status = response.status();
        if matches!(
            status,
            reqwest::StatusCode::ACCEPTED | reqwest::StatusCode::NO_CONTENT
        ) {
            return Ok(StreamableHttpPostResponse::Accepted);
        }

        let content_type = response.headers().get(reqwest::header::CONTENT_TYPE);
        let session_id_val = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        match content_type {
            Some(ct) if ct.as_bytes().starts_with(EVENT_STREAM_MIME_TYPE.as_bytes()) => {
                let event_stream = SseStream::from_byte_stream(response.bytes_stream()).boxed();
                Ok(StreamableHttpPostResponse::Sse(event_stream, session_id_val))
            }
            Some(ct) if ct.as_bytes().starts_with(JSON_MIME_TYPE.as_bytes()) => {
                let message: ServerJsonRpcMessage = response.json().await?;
                Ok(StreamableHttpPostResponse::Json(message, session_id_val))
            }
            _ => {
                debug!(
                    content_type = ?content_type.map(|ct| String::from_utf8_lossy(ct.as_bytes()).to_string()),
                    status = %status,
                    "missing or unexpected Content-Type, attempting JSON decode"
                );

                let bytes = response.bytes().await?;
                if !bytes.is_empty()
                    && let Ok(message) = serde_json::from_slice::<ServerJsonRpcMessage>(&bytes)
                {
                    return Ok(StreamableHttpPostResponse::Json(message, session_id_val));
                }

                Ok(StreamableHttpPostResponse::Accepted)
            }
        }
    }
}
