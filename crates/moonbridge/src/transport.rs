//! Mechanical I/O against the printer service: HTTP requests and the
//! persistent websocket.
//!
//! No retries happen at this layer and no payload is interpreted here;
//! retry policy belongs to the coordinator and payload shapes to the
//! protocol module. Failures are mapped to [`ConnectionError`] carrying
//! the target URL.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::ConnectionError;

/// HTTP side of the transport. One instance per configured printer.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) => format!("{}{}?{}", self.base_url, path, q),
            None => format!("{}{}", self.base_url, path),
        }
    }

    /// GET a path and return the raw body. Non-2xx statuses are errors.
    pub async fn get(&self, path: &str, query: Option<&str>) -> Result<String, ConnectionError> {
        let url = self.url(path, query);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| ConnectionError::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::Status {
                url,
                status: status.as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|source| ConnectionError::Http { url, source })
    }

    /// POST a JSON body to a path, returning the status code on success.
    /// Non-2xx statuses are errors.
    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<u16, ConnectionError> {
        let url = self.url(path, None);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| ConnectionError::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::Status {
                url,
                status: status.as_u16(),
            });
        }

        Ok(status.as_u16())
    }
}

/// A connected text-frame socket.
///
/// The trait exists so the coordinator's receive loop can be exercised
/// against a scripted mock in tests.
#[async_trait]
pub trait Socket: Send {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Block until the next text frame. `Ok(None)` means the peer closed
    /// the connection cleanly.
    async fn recv(&mut self) -> Result<Option<String>, ConnectionError>;

    async fn close(&mut self);
}

/// Dials new sockets, so a degraded coordinator can re-establish the
/// session and tests can inject mocks.
#[async_trait]
pub trait SocketFactory: Send + Sync + 'static {
    type Socket: Socket;

    async fn connect(&self) -> Result<Self::Socket, ConnectionError>;
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Real websocket implementation using tokio-tungstenite.
pub struct WsSocket {
    url: String,
    sink: futures_util::stream::SplitSink<WsStream, Message>,
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|source| ConnectionError::Ws {
                url: self.url.clone(),
                source,
            })
    }

    async fn recv(&mut self) -> Result<Option<String>, ConnectionError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Pings and pongs are answered by tungstenite itself;
                // binary frames are not part of the Moonraker protocol.
                Some(Ok(other)) => {
                    debug!("ignoring non-text websocket frame: {:?}", other);
                }
                Some(Err(source)) => {
                    return Err(ConnectionError::Ws {
                        url: self.url.clone(),
                        source,
                    });
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

/// Factory producing [`WsSocket`]s for a fixed endpoint URL.
pub struct WsSocketFactory {
    url: String,
}

impl WsSocketFactory {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl SocketFactory for WsSocketFactory {
    type Socket = WsSocket;

    async fn connect(&self) -> Result<WsSocket, ConnectionError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|source| ConnectionError::Ws {
                url: self.url.clone(),
                source,
            })?;

        let (sink, stream) = ws.split();
        Ok(WsSocket {
            url: self.url.clone(),
            sink,
            stream,
        })
    }
}

/// Scripted socket for tests: hands out queued frames and records what
/// was sent.
#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{ConnectionError, Socket, SocketFactory};

    #[derive(Default)]
    pub struct MockScript {
        pub frames: Mutex<VecDeque<String>>,
        pub sent: Mutex<Vec<String>>,
    }

    pub struct MockSocket {
        pub script: Arc<MockScript>,
    }

    #[async_trait]
    impl Socket for MockSocket {
        async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
            self.script.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>, ConnectionError> {
            Ok(self.script.frames.lock().unwrap().pop_front())
        }

        async fn close(&mut self) {}
    }

    pub struct MockSocketFactory {
        pub script: Arc<MockScript>,
    }

    impl MockSocketFactory {
        pub fn new(frames: Vec<&str>) -> (Self, Arc<MockScript>) {
            let script = Arc::new(MockScript {
                frames: Mutex::new(frames.into_iter().map(String::from).collect()),
                sent: Mutex::new(Vec::new()),
            });
            (
                Self {
                    script: script.clone(),
                },
                script,
            )
        }
    }

    #[async_trait]
    impl SocketFactory for MockSocketFactory {
        type Socket = MockSocket;

        async fn connect(&self) -> Result<MockSocket, ConnectionError> {
            Ok(MockSocket {
                script: self.script.clone(),
            })
        }
    }
}
