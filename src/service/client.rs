use async_trait::async_trait;
use rand::{thread_rng, Rng};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;

use crate::core::matcher::{FaceMatcher, MatchError, Similarity};
use crate::service::protocol::{read_frame, write_frame, CompareRequest, Request, Response};

const CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// [`FaceMatcher`] backed by the external comparison service on a Unix socket.
pub struct ServiceMatcher {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ServiceMatcher {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { socket_path: socket_path.into(), timeout }
    }

    /// Round-trips a ping to confirm the service is answering.
    pub async fn ping(&self) -> Result<(), MatchError> {
        match self.exchange(&Request::Ping).await? {
            Response::Pong => Ok(()),
            Response::Error(msg) => Err(MatchError::Rejected(msg)),
            other => Err(MatchError::Protocol(format!("unexpected reply to ping: {:?}", other))),
        }
    }

    async fn connect_with_retry(&self) -> Result<UnixStream, MatchError> {
        let mut attempt = 1;
        loop {
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < CONNECT_RETRIES => {
                    tracing::warn!("Failed to connect to match service (attempt {}): {}", attempt, e);
                    tokio::time::sleep(RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(MatchError::Unavailable(format!(
                        "{}: {}", self.socket_path.display(), e
                    )));
                }
            }
        }
    }

    async fn exchange(&self, request: &Request) -> Result<Response, MatchError> {
        let round_trip = async {
            let mut stream = self.connect_with_retry().await?;
            write_frame(&mut stream, request).await
                .map_err(|e| MatchError::Protocol(format!("Failed to send request: {}", e)))?;
            read_frame::<_, Response>(&mut stream).await
                .map_err(|e| MatchError::Protocol(format!("Failed to read response: {}", e)))
        };

        tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| MatchError::Timeout(self.timeout))?
    }
}

fn request_id() -> String {
    let bytes: [u8; 8] = thread_rng().gen();
    hex::encode(bytes)
}

#[async_trait]
impl FaceMatcher for ServiceMatcher {
    fn name(&self) -> &str {
        "service"
    }

    async fn compare(&self, probe: &[u8], reference: &[u8]) -> Result<Similarity, MatchError> {
        let id = request_id();
        let request = Request::Compare(CompareRequest {
            request_id: id.clone(),
            probe_jpeg: probe.to_vec(),
            reference_jpeg: reference.to_vec(),
        });

        tracing::debug!("Sending compare request {} ({} + {} bytes)", id, probe.len(), reference.len());
        match self.exchange(&request).await? {
            Response::Similarity(reply) if reply.request_id == id => Similarity::new(reply.similarity),
            Response::Similarity(reply) => Err(MatchError::Protocol(format!(
                "reply for request {} while waiting for {}", reply.request_id, id
            ))),
            Response::Error(msg) => Err(MatchError::Rejected(msg)),
            Response::Pong => Err(MatchError::Protocol("unexpected pong".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::protocol::SimilarityResponse;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    /// Answers a single request with whatever `reply` builds from it.
    fn serve_once<F>(listener: UnixListener, reply: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(Request) -> Response + Send + 'static,
    {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request: Request = read_frame(&mut stream).await.unwrap();
            write_frame(&mut stream, &reply(request)).await.unwrap();
        })
    }

    #[tokio::test]
    async fn test_compare_returns_service_score() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("matcher.sock");
        let server = serve_once(UnixListener::bind(&socket).unwrap(), |request| match request {
            Request::Compare(c) => {
                assert_eq!(c.probe_jpeg, b"probe");
                Response::Similarity(SimilarityResponse { request_id: c.request_id, similarity: 0.82 })
            }
            Request::Ping => Response::Pong,
        });

        let matcher = ServiceMatcher::new(&socket, Duration::from_secs(5));
        let score = matcher.compare(b"probe", b"reference").await.unwrap();
        assert!((score.value() - 0.82).abs() < f32::EPSILON);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_score_is_an_error() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("matcher.sock");
        let server = serve_once(UnixListener::bind(&socket).unwrap(), |request| match request {
            Request::Compare(c) => Response::Similarity(SimilarityResponse { request_id: c.request_id, similarity: 1.7 }),
            Request::Ping => Response::Pong,
        });

        let matcher = ServiceMatcher::new(&socket, Duration::from_secs(5));
        assert_eq!(matcher.compare(b"p", b"r").await, Err(MatchError::InvalidScore(1.7)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_service_error_is_rejected() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("matcher.sock");
        let server = serve_once(UnixListener::bind(&socket).unwrap(), |_| Response::Error("no face found".into()));

        let matcher = ServiceMatcher::new(&socket, Duration::from_secs(5));
        assert_eq!(matcher.compare(b"p", b"r").await, Err(MatchError::Rejected("no face found".into())));
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_socket_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let matcher = ServiceMatcher::new(dir.path().join("absent.sock"), Duration::from_secs(30));

        assert!(matches!(matcher.ping().await, Err(MatchError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_silent_service_times_out() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("matcher.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let matcher = ServiceMatcher::new(&socket, Duration::from_millis(300));
        assert_eq!(matcher.compare(b"p", b"r").await, Err(MatchError::Timeout(Duration::from_millis(300))));
    }
}
