//! Connection gateway: binds a channel to an agent, performs one request,
//! closes the channel and interprets the response.
//!
//! Channels are opened per invocation, so two invocations never share a
//! handle. The whole invocation (bind + execute) is bounded by the configured
//! timeout.

use std::{path::PathBuf, sync::Arc, time::Duration};

use futures::future::BoxFuture;

use crate::error::AgentError;
use crate::protocol::interpret_response;
use crate::types::{AgentId, AgentOutcome, AgentPayload, CorrelationId};

/// A bound connection to one agent.
pub trait AgentChannel: Send {
    /// Send one request and wait for the agent's raw response.
    fn execute<'a>(
        &'a mut self,
        correlation_id: CorrelationId,
        request: &'a AgentPayload,
    ) -> BoxFuture<'a, Result<AgentPayload, AgentError>>;

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Opens channels to out-of-process agents.
pub trait AgentTransport: Send + Sync {
    fn bind<'a>(&'a self, agent: &'a AgentId)
        -> BoxFuture<'a, Result<Box<dyn AgentChannel>, AgentError>>;
}

#[derive(Clone)]
pub struct Gateway {
    transport: Arc<dyn AgentTransport>,
    invoke_timeout: Duration,
}

impl Gateway {
    pub fn new(transport: Arc<dyn AgentTransport>, invoke_timeout: Duration) -> Self {
        Self {
            transport,
            invoke_timeout,
        }
    }

    pub fn invoke_timeout(&self) -> Duration {
        self.invoke_timeout
    }

    pub async fn invoke(
        &self,
        correlation_id: CorrelationId,
        agent: &AgentId,
        payload: &AgentPayload,
    ) -> AgentOutcome {
        match tokio::time::timeout(
            self.invoke_timeout,
            self.invoke_once(correlation_id, agent, payload),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    target = "agent_broker::gateway",
                    correlation_id = %correlation_id,
                    agent = %agent,
                    timeout_ms = self.invoke_timeout.as_millis() as u64,
                    "agent invocation timed out"
                );
                AgentOutcome::Failure(AgentError::Timeout(self.invoke_timeout))
            }
        }
    }

    async fn invoke_once(
        &self,
        correlation_id: CorrelationId,
        agent: &AgentId,
        payload: &AgentPayload,
    ) -> AgentOutcome {
        let mut channel = match self.transport.bind(agent).await {
            Ok(channel) => channel,
            Err(error) => {
                tracing::warn!(
                    target = "agent_broker::gateway",
                    correlation_id = %correlation_id,
                    agent = %agent,
                    error = %error,
                    "failed to bind agent channel"
                );
                return AgentOutcome::Failure(error);
            }
        };

        tracing::debug!(
            target = "agent_broker::gateway",
            correlation_id = %correlation_id,
            agent = %agent,
            action = %payload.action,
            "executing agent request"
        );
        let response = channel.execute(correlation_id, payload).await;
        channel.close().await;

        match response {
            Ok(raw) => interpret_response(raw),
            Err(error) => AgentOutcome::Failure(error),
        }
    }
}

/// Agents listening on `<agent_dir>/<agent>.sock`, speaking one JSON line per
/// message.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixSocketTransport {
    agent_dir: PathBuf,
}

#[cfg(unix)]
impl UnixSocketTransport {
    pub fn new(agent_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent_dir: agent_dir.into(),
        }
    }

    pub fn socket_path(&self, agent: &AgentId) -> Result<PathBuf, AgentError> {
        let name = agent.as_str();
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(AgentError::connection(format!(
                "invalid agent identity {name:?}"
            )));
        }
        Ok(self.agent_dir.join(format!("{name}.sock")))
    }
}

#[cfg(unix)]
impl AgentTransport for UnixSocketTransport {
    fn bind<'a>(
        &'a self,
        agent: &'a AgentId,
    ) -> BoxFuture<'a, Result<Box<dyn AgentChannel>, AgentError>> {
        Box::pin(async move {
            let path = self.socket_path(agent)?;
            let stream = tokio::net::UnixStream::connect(&path)
                .await
                .map_err(|e| AgentError::connection(format!("connect {}: {e}", path.display())))?;
            Ok(Box::new(UnixAgentChannel {
                stream: tokio::io::BufReader::new(stream),
            }) as Box<dyn AgentChannel>)
        })
    }
}

/// Upper bound on one response line from an agent.
#[cfg(unix)]
pub const MAX_RESPONSE_BYTES: u64 = 256 * 1024;

#[cfg(unix)]
struct UnixAgentChannel {
    stream: tokio::io::BufReader<tokio::net::UnixStream>,
}

#[cfg(unix)]
impl AgentChannel for UnixAgentChannel {
    fn execute<'a>(
        &'a mut self,
        correlation_id: CorrelationId,
        request: &'a AgentPayload,
    ) -> BoxFuture<'a, Result<AgentPayload, AgentError>> {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

        use crate::protocol::{ProtocolEnvelope, MSG_AGENT_REQUEST, MSG_AGENT_RESPONSE};

        Box::pin(async move {
            let request_id = correlation_id.to_string();
            let frame = ProtocolEnvelope::new(MSG_AGENT_REQUEST, Some(request_id.clone()), request);
            let mut line = serde_json::to_string(&frame)
                .map_err(|e| AgentError::protocol(format!("encode request: {e}")))?;
            line.push('\n');

            self.stream
                .get_mut()
                .write_all(line.as_bytes())
                .await
                .map_err(|e| AgentError::connection(format!("write request: {e}")))?;

            let mut reply = Vec::new();
            let read = (&mut self.stream)
                .take(MAX_RESPONSE_BYTES)
                .read_until(b'\n', &mut reply)
                .await
                .map_err(|e| AgentError::connection(format!("read response: {e}")))?;
            if read == 0 {
                return Err(AgentError::connection(
                    "agent closed the connection without answering",
                ));
            }
            if !reply.ends_with(b"\n") && read as u64 >= MAX_RESPONSE_BYTES {
                return Err(AgentError::protocol(format!(
                    "response exceeds {MAX_RESPONSE_BYTES} bytes"
                )));
            }

            let reply = std::str::from_utf8(&reply)
                .map_err(|e| AgentError::protocol(format!("response is not UTF-8: {e}")))?;
            let frame: ProtocolEnvelope<AgentPayload> = serde_json::from_str(reply.trim_end())
                .map_err(|e| AgentError::protocol(format!("decode response: {e}")))?;
            if frame.msg_type != MSG_AGENT_RESPONSE {
                return Err(AgentError::protocol(format!(
                    "unexpected message type {}",
                    frame.msg_type
                )));
            }
            if let Some(id) = frame.request_id.as_deref() {
                if id != request_id {
                    return Err(AgentError::protocol(format!(
                        "response for request {id} while waiting for {request_id}"
                    )));
                }
            }
            Ok(frame.payload)
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        use tokio::io::AsyncWriteExt;

        Box::pin(async move {
            let mut stream = self.stream.into_inner();
            let _ = stream.shutdown().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::BoxFuture;

    use super::{AgentChannel, AgentTransport, Gateway};
    use crate::error::AgentError;
    use crate::protocol::{EXTRA_RESULT_CODE, EXTRA_SIGNATURE};
    use crate::types::{AgentId, AgentOutcome, AgentPayload, CorrelationId};

    struct FixedTransport {
        response: Result<AgentPayload, AgentError>,
        delay: Duration,
        bind_error: Option<AgentError>,
    }

    struct FixedChannel {
        response: Result<AgentPayload, AgentError>,
        delay: Duration,
    }

    impl AgentTransport for FixedTransport {
        fn bind<'a>(
            &'a self,
            _agent: &'a AgentId,
        ) -> BoxFuture<'a, Result<Box<dyn AgentChannel>, AgentError>> {
            Box::pin(async move {
                if let Some(error) = &self.bind_error {
                    return Err(error.clone());
                }
                Ok(Box::new(FixedChannel {
                    response: self.response.clone(),
                    delay: self.delay,
                }) as Box<dyn AgentChannel>)
            })
        }
    }

    impl AgentChannel for FixedChannel {
        fn execute<'a>(
            &'a mut self,
            _correlation_id: CorrelationId,
            _request: &'a AgentPayload,
        ) -> BoxFuture<'a, Result<AgentPayload, AgentError>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.response.clone()
            })
        }
    }

    fn gateway(transport: FixedTransport, timeout: Duration) -> Gateway {
        Gateway::new(Arc::new(transport), timeout)
    }

    #[tokio::test]
    async fn success_response_is_interpreted() {
        let raw = AgentPayload::new("sign")
            .with_extra(EXTRA_RESULT_CODE, 1)
            .with_extra(EXTRA_SIGNATURE, "c2ln");
        let gw = gateway(
            FixedTransport {
                response: Ok(raw.clone()),
                delay: Duration::ZERO,
                bind_error: None,
            },
            Duration::from_secs(5),
        );
        let outcome = gw
            .invoke(CorrelationId::new(), &AgentId::new("a"), &AgentPayload::new("sign"))
            .await;
        assert_eq!(outcome, AgentOutcome::Success(raw));
    }

    #[tokio::test]
    async fn bind_failure_is_connection_error() {
        let gw = gateway(
            FixedTransport {
                response: Ok(AgentPayload::default()),
                delay: Duration::ZERO,
                bind_error: Some(AgentError::connection("refused")),
            },
            Duration::from_secs(5),
        );
        let outcome = gw
            .invoke(CorrelationId::new(), &AgentId::new("a"), &AgentPayload::new("sign"))
            .await;
        assert_eq!(
            outcome,
            AgentOutcome::Failure(AgentError::connection("refused"))
        );
    }

    #[tokio::test]
    async fn slow_agent_times_out() {
        let timeout = Duration::from_millis(50);
        let gw = gateway(
            FixedTransport {
                response: Ok(AgentPayload::default()),
                delay: Duration::from_secs(10),
                bind_error: None,
            },
            timeout,
        );
        let outcome = gw
            .invoke(CorrelationId::new(), &AgentId::new("a"), &AgentPayload::new("sign"))
            .await;
        assert_eq!(outcome, AgentOutcome::Failure(AgentError::Timeout(timeout)));
    }

    #[cfg(unix)]
    mod unix {
        use std::time::Duration;

        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::UnixListener;

        use super::super::{Gateway, UnixSocketTransport, MAX_RESPONSE_BYTES};
        use crate::error::AgentError;
        use crate::protocol::{
            ProtocolEnvelope, EXTRA_RESULT_CODE, MSG_AGENT_REQUEST, MSG_AGENT_RESPONSE,
        };
        use crate::types::{AgentId, AgentOutcome, AgentPayload, CorrelationId};

        #[test]
        fn rejects_path_like_agent_names() {
            let transport = UnixSocketTransport::new("/run/agents");
            assert!(transport.socket_path(&AgentId::new("../etc")).is_err());
            assert!(transport.socket_path(&AgentId::new("a/b")).is_err());
            assert_eq!(
                transport.socket_path(&AgentId::new("okc")).unwrap(),
                std::path::Path::new("/run/agents/okc.sock")
            );
        }

        #[tokio::test]
        async fn socket_round_trip_echoes_request_id() {
            let dir = tempfile::tempdir().unwrap();
            let listener = UnixListener::bind(dir.path().join("okc.sock")).unwrap();

            let server = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut stream = BufReader::new(stream);
                let mut line = String::new();
                stream.read_line(&mut line).await.unwrap();
                let request: ProtocolEnvelope<AgentPayload> =
                    serde_json::from_str(line.trim_end()).unwrap();
                assert_eq!(request.msg_type, MSG_AGENT_REQUEST);

                let reply = ProtocolEnvelope::new(
                    MSG_AGENT_RESPONSE,
                    request.request_id.clone(),
                    AgentPayload::new(request.payload.action.clone())
                        .with_extra(EXTRA_RESULT_CODE, 1)
                        .with_extra("key_id", "k1"),
                );
                let mut out = serde_json::to_string(&reply).unwrap();
                out.push('\n');
                stream.get_mut().write_all(out.as_bytes()).await.unwrap();
                request
            });

            let gw = Gateway::new(
                std::sync::Arc::new(UnixSocketTransport::new(dir.path())),
                Duration::from_secs(5),
            );
            let id = CorrelationId::new();
            let outcome = gw
                .invoke(id, &AgentId::new("okc"), &AgentPayload::new("select_key"))
                .await;

            match outcome {
                AgentOutcome::Success(payload) => assert_eq!(payload.extra_str("key_id"), Some("k1")),
                other => panic!("unexpected outcome: {other:?}"),
            }
            let request = server.await.unwrap();
            assert_eq!(request.request_id, Some(id.to_string()));
        }

        /// Accepts one connection, swallows the request line, writes `reply`.
        fn serve_raw(listener: UnixListener, reply: Vec<u8>) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut stream = BufReader::new(stream);
                let mut line = String::new();
                stream.read_line(&mut line).await.unwrap();
                let _ = stream.get_mut().write_all(&reply).await;
            })
        }

        #[tokio::test]
        async fn oversized_response_is_protocol_error() {
            let dir = tempfile::tempdir().unwrap();
            let listener = UnixListener::bind(dir.path().join("okc.sock")).unwrap();
            let server = serve_raw(listener, vec![b'a'; MAX_RESPONSE_BYTES as usize + 16]);

            let gw = Gateway::new(
                std::sync::Arc::new(UnixSocketTransport::new(dir.path())),
                Duration::from_secs(5),
            );
            let outcome = gw
                .invoke(CorrelationId::new(), &AgentId::new("okc"), &AgentPayload::new("sign"))
                .await;
            match outcome {
                AgentOutcome::Failure(AgentError::Protocol(message)) => {
                    assert!(message.contains("exceeds"))
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
            server.await.unwrap();
        }

        #[tokio::test]
        async fn non_utf8_response_is_protocol_error() {
            let dir = tempfile::tempdir().unwrap();
            let listener = UnixListener::bind(dir.path().join("okc.sock")).unwrap();
            let server = serve_raw(listener, vec![0xff, 0xfe, b'{', b'\n']);

            let gw = Gateway::new(
                std::sync::Arc::new(UnixSocketTransport::new(dir.path())),
                Duration::from_secs(5),
            );
            let outcome = gw
                .invoke(CorrelationId::new(), &AgentId::new("okc"), &AgentPayload::new("sign"))
                .await;
            assert!(matches!(
                outcome,
                AgentOutcome::Failure(AgentError::Protocol(_))
            ));
            server.await.unwrap();
        }

        #[tokio::test]
        async fn missing_socket_is_connection_error() {
            let dir = tempfile::tempdir().unwrap();
            let gw = Gateway::new(
                std::sync::Arc::new(UnixSocketTransport::new(dir.path())),
                Duration::from_secs(5),
            );
            let outcome = gw
                .invoke(CorrelationId::new(), &AgentId::new("absent"), &AgentPayload::new("sign"))
                .await;
            assert!(matches!(
                outcome,
                AgentOutcome::Failure(AgentError::Connection(_))
            ));
        }
    }
}
