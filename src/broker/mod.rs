//! Long-lived connection to the broker.
//!
//! Registers the worker, keeps the broker alive with pings, and
//! multiplexes broker traffic with job-completion notifications from the
//! executor. Envelopes on the internal channels carry the same frame
//! layout as the wire.

pub mod transport;

pub use transport::{BrokerTransport, TcpTransport, TransportError};

use crate::config::WorkerConfig;
use crate::job::EvalRequest;
use err_derive::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(display = "unexpected broker message: {:?}", _0)]
    UnexpectedMessage(Vec<String>),

    #[error(display = "ill-formed envelope: {}", _0)]
    Malformed(String),
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected,
    Connecting,
    Registered,
    Idle,
    Working,
    Terminated,
}

/// What the multiplexed poll produced.
enum LoopEvent {
    Broker(Vec<String>),
    JobDone(Vec<String>),
    PingDue,
    TransportFailed(TransportError),
    ExecutorGone,
}

pub struct BrokerConnection<T: BrokerTransport> {
    config: Arc<WorkerConfig>,
    transport: T,
    state: BrokerState,
    /// Eval envelopes forwarded to the executor.
    eval_tx: mpsc::Sender<Vec<String>>,
    /// Done envelopes coming back from the executor.
    done_rx: mpsc::Receiver<Vec<String>>,
    /// Ping intervals left before the broker is declared gone.
    liveness: u64,
    last_send: Instant,
}

impl<T: BrokerTransport> BrokerConnection<T> {
    pub fn new(
        config: Arc<WorkerConfig>,
        transport: T,
        eval_tx: mpsc::Sender<Vec<String>>,
        done_rx: mpsc::Receiver<Vec<String>>,
    ) -> BrokerConnection<T> {
        let liveness = config.max_broker_liveness;
        BrokerConnection {
            config,
            transport,
            state: BrokerState::Disconnected,
            eval_tx,
            done_rx,
            liveness,
            last_send: Instant::now(),
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    /// Registration envelope: verb, hwgroup, one frame per header pair,
    /// a separator, and the worker description.
    fn init_frames(&self) -> Vec<String> {
        let mut frames = vec!["init".to_owned(), self.config.hwgroup.clone()];
        for (key, value) in &self.config.headers {
            frames.push(format!("{key}={value}"));
        }
        frames.push(String::new());
        frames.push(format!("description={}", self.config.worker_description()));
        frames
    }

    async fn send(&mut self, frames: &[String]) -> Result<(), TransportError> {
        self.transport.send(frames).await?;
        self.last_send = Instant::now();
        Ok(())
    }

    /// Connect to the broker and register. No acknowledgement is
    /// expected.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.state = BrokerState::Connecting;
        tracing::info!("connecting to {}", self.config.broker_uri);
        self.transport.connect(&self.config.broker_uri).await?;
        let frames = self.init_frames();
        self.send(&frames).await?;
        // Registration needs no acknowledgement.
        self.state = BrokerState::Registered;
        self.liveness = self.config.max_broker_liveness;
        tracing::info!("registered at the broker");
        Ok(())
    }

    /// Main loop; returns when the transport dies or the executor side
    /// of the channel pair is gone.
    pub async fn serve(&mut self) {
        let ping_interval = Duration::from_millis(self.config.broker_ping_interval);
        if self.state == BrokerState::Registered {
            self.state = BrokerState::Idle;
        }

        while self.state != BrokerState::Terminated {
            let poll_timeout = ping_interval.saturating_sub(self.last_send.elapsed());

            let event = {
                let transport = &mut self.transport;
                let done_rx = &mut self.done_rx;
                tokio::select! {
                    received = tokio::time::timeout(poll_timeout, transport.recv()) => {
                        match received {
                            Err(_elapsed) => LoopEvent::PingDue,
                            Ok(Ok(frames)) => LoopEvent::Broker(frames),
                            Ok(Err(e)) => LoopEvent::TransportFailed(e),
                        }
                    }
                    done = done_rx.recv() => match done {
                        Some(frames) => LoopEvent::JobDone(frames),
                        None => LoopEvent::ExecutorGone,
                    },
                }
            };

            match event {
                LoopEvent::Broker(frames) => {
                    self.liveness = self.config.max_broker_liveness;
                    if let Err(e) = self.handle_broker_message(frames).await {
                        tracing::error!("transport failure: {e}");
                        self.state = BrokerState::Terminated;
                    }
                }
                LoopEvent::JobDone(frames) => {
                    tracing::debug!("job finished, reporting to broker");
                    if let Err(e) = self.send(&frames).await {
                        tracing::error!("transport failure: {e}");
                        self.state = BrokerState::Terminated;
                    } else if self.state == BrokerState::Working {
                        self.state = BrokerState::Idle;
                    }
                }
                LoopEvent::PingDue => {
                    if self.liveness == 0 {
                        tracing::warn!("broker is unresponsive, reconnecting");
                        let was_working = self.state == BrokerState::Working;
                        self.state = BrokerState::Disconnected;
                        match self.connect().await {
                            Ok(()) => {
                                // A job may still be running through the
                                // reconnect.
                                self.state = if was_working {
                                    BrokerState::Working
                                } else {
                                    BrokerState::Idle
                                };
                            }
                            Err(e) => {
                                tracing::error!("reconnect failed: {e}");
                                self.state = BrokerState::Terminated;
                            }
                        }
                        continue;
                    }
                    self.liveness -= 1;
                    if let Err(e) = self.send(&["ping".to_owned()]).await {
                        tracing::error!("transport failure: {e}");
                        self.state = BrokerState::Terminated;
                    }
                }
                LoopEvent::TransportFailed(e) => {
                    tracing::error!("terminating the broker loop: {e}");
                    self.state = BrokerState::Terminated;
                }
                LoopEvent::ExecutorGone => {
                    tracing::error!("executor channel closed, terminating");
                    self.state = BrokerState::Terminated;
                }
            }
        }
    }

    async fn handle_broker_message(&mut self, frames: Vec<String>) -> Result<(), TransportError> {
        match frames.first().map(String::as_str) {
            Some("eval") => match parse_eval(&frames) {
                Ok(request) => {
                    let job_id = request.job_id.clone();
                    if self.state == BrokerState::Idle {
                        tracing::info!(%job_id, "accepting job");
                        self.send(&["accept".to_owned(), job_id]).await?;
                        self.state = BrokerState::Working;
                        if self.eval_tx.send(frames).await.is_err() {
                            tracing::error!("executor channel closed, terminating");
                            self.state = BrokerState::Terminated;
                        }
                    } else {
                        tracing::warn!(%job_id, "job arrived while busy, rejecting");
                        self.send(&["reject".to_owned(), job_id]).await?;
                    }
                }
                Err(e) => tracing::error!("{e}"),
            },
            Some("intro") => {
                tracing::info!("broker asked for reintroduction");
                let frames = self.init_frames();
                self.send(&frames).await?;
            }
            Some("pong") => {
                tracing::trace!("pong");
            }
            _ => {
                tracing::error!("{}", ProtocolError::UnexpectedMessage(frames));
            }
        }
        Ok(())
    }
}

/// Parse an `eval` envelope.
///
/// The canonical shape is `["eval", job_id, archive_url, result_url]`;
/// routing headers may appear between the job id and an empty separator
/// frame.
pub fn parse_eval(frames: &[String]) -> Result<EvalRequest, ProtocolError> {
    if frames.len() < 4 || frames[0] != "eval" {
        return Err(ProtocolError::Malformed(format!(
            "eval envelope has {} frames",
            frames.len()
        )));
    }
    let job_id = frames[1].clone();

    let rest = &frames[2..];
    let (headers, urls) = match rest.iter().position(|f| f.is_empty()) {
        Some(sep) => (&rest[..sep], &rest[sep + 1..]),
        None => (&rest[..0], rest),
    };
    if urls.len() != 2 {
        return Err(ProtocolError::Malformed(
            "eval envelope must carry exactly two URLs".into(),
        ));
    }

    let headers = headers
        .iter()
        .map(|frame| {
            frame
                .split_once('=')
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .ok_or_else(|| {
                    ProtocolError::Malformed(format!("header frame without '=': {frame}"))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(EvalRequest {
        job_id,
        archive_url: urls[0].clone(),
        result_url: urls[1].clone(),
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::transport::mock::{MockRemote, MockTransport};
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> Arc<WorkerConfig> {
        Arc::new(
            WorkerConfig::from_yaml(
                "worker-id: 1\nbroker-uri: tcp://localhost:9876\nhwgroup: group_1\n\
                 broker-ping-interval: 50\nmax-broker-liveness: 4\n\
                 worker-description: linux_worker_1\n\
                 headers:\n    env: c\n    threads: 2\n",
            )
            .unwrap(),
        )
    }

    struct Harness {
        connection: BrokerConnection<MockTransport>,
        remote: MockRemote,
        eval_rx: mpsc::Receiver<Vec<String>>,
        done_tx: mpsc::Sender<Vec<String>>,
    }

    fn harness() -> Harness {
        let (transport, remote) = MockTransport::new();
        let (eval_tx, eval_rx) = mpsc::channel(4);
        let (done_tx, done_rx) = mpsc::channel(4);
        Harness {
            connection: BrokerConnection::new(config(), transport, eval_tx, done_rx),
            remote,
            eval_rx,
            done_tx,
        }
    }

    #[tokio::test]
    async fn sends_init_on_connect() {
        let mut h = harness();
        h.connection.connect().await.unwrap();
        assert_eq!(h.connection.state(), BrokerState::Registered);
        assert_eq!(
            h.remote.sent_frames(),
            vec![vec![
                "init".to_owned(),
                "group_1".to_owned(),
                "env=c".to_owned(),
                "threads=2".to_owned(),
                String::new(),
                "description=linux_worker_1".to_owned(),
            ]]
        );
    }

    #[tokio::test]
    async fn accepts_and_forwards_eval() {
        let mut h = harness();
        h.connection.connect().await.unwrap();
        h.remote.push(&[
            "eval",
            "10",
            "http://localhost:5487/submission_archives/10.tar.gz",
            "http://localhost:5487/results/10",
        ]);
        h.remote.fail(); // stop the loop after the eval

        h.connection.serve().await;
        assert_eq!(h.connection.state(), BrokerState::Terminated);

        let forwarded = h.eval_rx.recv().await.unwrap();
        assert_eq!(
            forwarded,
            vec![
                "eval",
                "10",
                "http://localhost:5487/submission_archives/10.tar.gz",
                "http://localhost:5487/results/10",
            ]
        );

        let sent = h.remote.sent_frames();
        assert_eq!(sent[1], vec!["accept".to_owned(), "10".to_owned()]);
    }

    #[tokio::test]
    async fn rejects_eval_while_working() {
        let mut h = harness();
        h.connection.connect().await.unwrap();
        h.remote.push(&["eval", "10", "u1", "u2"]);
        h.remote.push(&["eval", "11", "u3", "u4"]);
        h.remote.fail();

        h.connection.serve().await;

        let sent = h.remote.sent_frames();
        assert_eq!(sent[1], vec!["accept".to_owned(), "10".to_owned()]);
        assert_eq!(sent[2], vec!["reject".to_owned(), "11".to_owned()]);
        // Only the first job reached the executor.
        assert_eq!(h.eval_rx.recv().await.unwrap()[1], "10");
        assert!(h.eval_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwards_done_and_returns_to_idle() {
        let mut h = harness();
        h.connection.connect().await.unwrap();
        h.remote.push(&["eval", "10", "u1", "u2"]);

        let done_tx = h.done_tx.clone();
        let remote = h.remote.clone();
        tokio::spawn(async move {
            // Let the eval round-trip first, then finish the job.
            tokio::time::sleep(Duration::from_millis(20)).await;
            done_tx
                .send(vec!["done".to_owned(), "10".to_owned(), "OK".to_owned()])
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.fail();
        });

        h.connection.serve().await;

        let sent = h.remote.sent_frames();
        assert!(sent.contains(&vec![
            "done".to_owned(),
            "10".to_owned(),
            "OK".to_owned()
        ]));
    }

    #[tokio::test]
    async fn pings_when_idle() {
        let mut h = harness();
        h.connection.connect().await.unwrap();

        let remote = h.remote.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(140)).await;
            remote.fail();
        });
        h.connection.serve().await;

        let pings = h
            .remote
            .sent_frames()
            .iter()
            .filter(|f| f.as_slice() == ["ping"])
            .count();
        assert!(pings >= 1, "expected at least one ping");
    }

    #[tokio::test]
    async fn reconnects_after_liveness_expires() {
        let mut h = harness();
        h.connection.connect().await.unwrap();

        let remote = h.remote.clone();
        tokio::spawn(async move {
            // 4 pings at 50 ms each, then the reconnect; give it slack.
            tokio::time::sleep(Duration::from_millis(400)).await;
            remote.fail();
        });
        h.connection.serve().await;

        let inits = h
            .remote
            .sent_frames()
            .iter()
            .filter(|f| f.first().map(String::as_str) == Some("init"))
            .count();
        assert!(inits >= 2, "expected a re-registration, got {inits} inits");
        assert!(h.connection.transport.connected_to.lock().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn intro_triggers_reregistration() {
        let mut h = harness();
        h.connection.connect().await.unwrap();
        h.remote.push(&["intro"]);
        h.remote.fail();
        h.connection.serve().await;

        let inits = h
            .remote
            .sent_frames()
            .iter()
            .filter(|f| f.first().map(String::as_str) == Some("init"))
            .count();
        assert_eq!(inits, 2);
    }

    #[tokio::test]
    async fn malformed_envelope_keeps_the_loop_alive() {
        let mut h = harness();
        h.connection.connect().await.unwrap();
        h.remote.push(&["eval", "10"]); // too short
        h.remote.push(&["gibberish"]);
        h.remote.push(&["eval", "11", "u1", "u2"]);
        h.remote.fail();
        h.connection.serve().await;

        // The valid job after the garbage still went through.
        assert_eq!(h.eval_rx.recv().await.unwrap()[1], "11");
    }

    #[tokio::test]
    async fn header_map_round_trips_through_frames() {
        let mut h = harness();
        h.connection.connect().await.unwrap();

        // Header frames of the registration envelope decode back into
        // the configured pairs.
        let init = h.remote.sent_frames().remove(0);
        let decoded: Vec<(String, String)> = init[2..]
            .iter()
            .take_while(|f| !f.is_empty())
            .map(|f| {
                let (k, v) = f.split_once('=').unwrap();
                (k.to_owned(), v.to_owned())
            })
            .collect();
        assert_eq!(decoded, config().headers);
    }

    #[test]
    fn parse_eval_with_headers() {
        let frames: Vec<String> = ["eval", "42", "env=c", "hwgroup=group_1", "", "u1", "u2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let request = parse_eval(&frames).unwrap();
        assert_eq!(request.job_id, "42");
        assert_eq!(request.archive_url, "u1");
        assert_eq!(request.result_url, "u2");
        assert_eq!(
            request.headers,
            vec![
                ("env".to_owned(), "c".to_owned()),
                ("hwgroup".to_owned(), "group_1".to_owned()),
            ]
        );
    }

    #[test]
    fn parse_eval_without_headers() {
        let frames: Vec<String> = ["eval", "10", "u1", "u2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let request = parse_eval(&frames).unwrap();
        assert_eq!(request.job_id, "10");
        assert!(request.headers.is_empty());
    }

    #[test]
    fn parse_eval_rejects_garbage() {
        let short: Vec<String> = ["eval", "10"].iter().map(|s| s.to_string()).collect();
        assert!(parse_eval(&short).is_err());
        let bad_header: Vec<String> = ["eval", "10", "noequals", "", "u1", "u2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(parse_eval(&bad_header).is_err());
    }
}
