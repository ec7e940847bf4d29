//! The daemon loop: connect, register, poll for work, run it, report it.
//!
//! One control flow owns the session. Task executions run on their own
//! tasks and hand their outcomes back over a channel; every outbound frame
//! is written from this loop.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{RunnerIdentity, SessionPolicy, StallPolicy, TaskPolicy};
use crate::error::{Error, ExecutionError, TransportError};
use crate::protocol::{Action, Dispatcher, Message, MessageType};
use crate::reporter::ResultReporter;
use crate::runner::capacity::CapacityGate;
use crate::runner::handler::{EventHandler, HandlerRegistry};
use crate::runner::supervisor::{Completion, Supervisor};
use crate::runner::task::{Outcome, TaskAssignment};
use crate::session::{Connector, ReadFailure, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Disconnected,
    Connecting,
    Idle,
    Dispatching,
    ShuttingDown,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::Dispatching => "dispatching",
            Self::ShuttingDown => "shutting_down",
        };
        write!(f, "{s}")
    }
}

/// Long-running worker bound to one server.
pub struct Daemon {
    identity: Arc<RunnerIdentity>,
    session: Session,
    dispatcher: Dispatcher,
    supervisor: Supervisor,
    completions: mpsc::UnboundedReceiver<Completion>,
    reporter: ResultReporter,
    task_policy: TaskPolicy,
    shutdown: CancellationToken,
    state: DaemonState,
    /// When the unanswered Register or RequestBuild was sent.
    request_sent: Option<Instant>,
    /// The at-capacity debug line was already emitted for this full gate.
    logged_at_capacity: bool,
    /// Launched tasks whose completion has not been received.
    in_flight: usize,
}

impl Daemon {
    pub fn new(
        identity: Arc<RunnerIdentity>,
        session_policy: SessionPolicy,
        task_policy: TaskPolicy,
        connector: Arc<dyn Connector>,
        handlers: HandlerRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        let gate = Arc::new(CapacityGate::new(identity.capacity()));
        let (supervisor, completions) = Supervisor::new(gate, &task_policy, shutdown.clone());
        Self {
            dispatcher: Dispatcher::new(identity.uuid(), handlers),
            session: Session::new(connector, session_policy),
            identity,
            supervisor,
            completions,
            reporter: ResultReporter::new(),
            task_policy,
            shutdown,
            state: DaemonState::Disconnected,
            request_sent: None,
            logged_at_capacity: false,
            in_flight: 0,
        }
    }

    /// Run until shutdown is requested.
    ///
    /// Transport and protocol failures are handled inside the loop. The
    /// only error returned is a stalled session under the `exit` policy.
    pub async fn run(mut self) -> Result<(), Error> {
        let policy = self.session.policy().clone();
        tracing::info!(
            endpoint = %self.session.endpoint(),
            capacity = self.identity.capacity(),
            events = ?self.dispatcher.handlers().events(),
            "Runner starting"
        );

        let mut reconnect = tokio::time::interval(policy.reconnect_interval);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Keepalive ping and re-poll cadence while connected.
        let period = policy.heartbeat_interval.unwrap_or(policy.read_timeout);
        let mut idle = tokio::time::interval_at(Instant::now() + period, period);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            if self.session.is_connected() {
                tokio::select! {
                    biased;

                    _ = self.shutdown.cancelled() => break Ok(()),
                    Some(done) = self.completions.recv() => self.on_completion(done).await,
                    _ = idle.tick() => self.on_idle_tick(policy.heartbeat_interval.is_some()).await,
                    read = self.session.read_next() => {
                        if let Err(e) = self.on_read(read, policy.on_stall).await {
                            break Err(e);
                        }
                    }
                }
            } else {
                self.set_state(DaemonState::Disconnected);
                tokio::select! {
                    biased;

                    _ = self.shutdown.cancelled() => break Ok(()),
                    Some(done) = self.completions.recv() => self.on_completion(done).await,
                    _ = reconnect.tick() => {
                        if self.try_connect().await {
                            idle.reset();
                        }
                    }
                }
            }
        };

        if result.is_err() {
            self.shutdown.cancel();
        }
        self.shut_down().await;
        result
    }

    fn set_state(&mut self, next: DaemonState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "State change");
            self.state = next;
        }
    }

    fn gate(&self) -> &Arc<CapacityGate> {
        self.supervisor.gate()
    }

    /// One connect attempt. On success the runner registers itself.
    async fn try_connect(&mut self) -> bool {
        self.set_state(DaemonState::Connecting);
        let connected = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return false,
            result = self.session.connect() => result,
        };
        if let Err(e) = connected {
            tracing::warn!(error = %e, "Connect attempt failed");
            self.set_state(DaemonState::Disconnected);
            return false;
        }

        self.logged_at_capacity = false;
        self.set_state(DaemonState::Idle);
        if let Err(e) = self
            .session
            .write_message(&Message::register(self.identity.uuid()))
            .await
        {
            tracing::warn!(error = %e, "Failed to register");
            self.request_sent = None;
            return false;
        }
        // The server answers Register the way it answers a work request.
        self.request_sent = Some(Instant::now());
        true
    }

    async fn on_read(
        &mut self,
        read: Result<Vec<u8>, ReadFailure>,
        on_stall: StallPolicy,
    ) -> Result<(), Error> {
        let payload = match read {
            Ok(payload) => payload,
            Err(ReadFailure::Stalled { failures }) => {
                self.lost_connection();
                return match on_stall {
                    StallPolicy::Reconnect => {
                        tracing::warn!(failures, "Session stalled, reconnecting");
                        Ok(())
                    }
                    StallPolicy::Exit => {
                        tracing::error!(failures, "Session stalled, stopping runner");
                        Err(TransportError::Stalled { failures }.into())
                    }
                };
            }
            Err(ReadFailure::Timeout) => {
                tracing::debug!(
                    failures = self.session.consecutive_failures(),
                    "No message within read window"
                );
                return Ok(());
            }
            Err(ReadFailure::Io(e)) => {
                tracing::warn!(
                    error = %e,
                    failures = self.session.consecutive_failures(),
                    "Read error"
                );
                return Ok(());
            }
            Err(failure @ (ReadFailure::GracefulClose | ReadFailure::AbnormalClose(_))) => {
                tracing::info!(reason = %failure, "Disconnected from server");
                self.lost_connection();
                return Ok(());
            }
            Err(ReadFailure::NotConnected) => return Ok(()),
        };

        self.set_state(DaemonState::Dispatching);
        self.handle_payload(&payload).await;
        if self.session.is_connected() {
            self.set_state(DaemonState::Idle);
        }
        Ok(())
    }

    fn lost_connection(&mut self) {
        self.request_sent = None;
        self.logged_at_capacity = false;
        self.set_state(DaemonState::Disconnected);
    }

    async fn handle_payload(&mut self, payload: &[u8]) {
        let msg = match Message::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding message");
                return;
            }
        };
        tracing::debug!(kind = %msg.kind, build_uuid = %msg.build_uuid, "Received message");
        if matches!(
            msg.kind,
            MessageType::Register | MessageType::Error | MessageType::Idle | MessageType::RequestBuild
        ) {
            self.request_sent = None;
        }

        match self.dispatcher.dispatch(msg) {
            Ok(Action::Reply(reply)) => self.request_work(reply).await,
            Ok(Action::Execute {
                assignment,
                handler,
            }) => self.accept(assignment, handler).await,
            Err(e) => tracing::warn!(error = %e, "Protocol error"),
        }
    }

    async fn accept(&mut self, assignment: TaskAssignment, handler: Arc<dyn EventHandler>) {
        let build_uuid = assignment.build_uuid().to_string();
        let runner_uuid = assignment.runner_uuid().to_string();
        match self.supervisor.launch(assignment, handler) {
            Ok(()) => {
                self.in_flight += 1;
                self.poll_for_work().await;
            }
            Err(e) => {
                if matches!(e, ExecutionError::CapacityExhausted { .. }) {
                    tracing::warn!(build_uuid = %build_uuid, "Assignment arrived at capacity, rejecting");
                }
                let outcome = Outcome::Failed(e.to_string());
                let _ = self
                    .reporter
                    .report(&mut self.session, &build_uuid, &runner_uuid, &outcome)
                    .await;
            }
        }
    }

    async fn on_completion(&mut self, done: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Completion {
            assignment,
            outcome,
            elapsed,
        } = done;

        if !self.session.is_connected() {
            tracing::warn!(
                build_uuid = %assignment.build_uuid(),
                outcome = %outcome,
                elapsed = ?elapsed,
                "Disconnected, dropping build result"
            );
            return;
        }
        let _ = self
            .reporter
            .report(
                &mut self.session,
                assignment.build_uuid(),
                assignment.runner_uuid(),
                &outcome,
            )
            .await;
        self.poll_for_work().await;
    }

    async fn on_idle_tick(&mut self, ping: bool) {
        if ping {
            if let Err(e) = self.session.heartbeat().await {
                tracing::warn!(error = %e, "Heartbeat failed");
                self.lost_connection();
                return;
            }
        }
        self.poll_for_work().await;
    }

    /// Ask for work if nothing is outstanding and a slot is free.
    async fn poll_for_work(&mut self) {
        let msg = Message::request_build(self.identity.uuid());
        self.request_work(msg).await;
    }

    /// A request is pending until answered or until a full read window
    /// passes without an answer.
    fn request_pending(&self) -> bool {
        let stale_after = self.session.policy().read_timeout;
        match self.request_sent {
            Some(sent) if sent.elapsed() < stale_after => true,
            Some(_) => {
                tracing::debug!("Work request went unanswered, asking again");
                false
            }
            None => false,
        }
    }

    /// Send a RequestBuild unless one is already pending. Held back while
    /// the gate is full; the next completion asks again.
    async fn request_work(&mut self, msg: Message) {
        if !self.session.is_connected() || self.request_pending() {
            return;
        }
        if self.gate().available() == 0 {
            if !self.logged_at_capacity {
                tracing::debug!(
                    outstanding = self.gate().outstanding(),
                    "At capacity, deferring work request"
                );
                self.logged_at_capacity = true;
            }
            return;
        }
        self.logged_at_capacity = false;
        match self.session.write_message(&msg).await {
            Ok(()) => self.request_sent = Some(Instant::now()),
            Err(e) => tracing::warn!(error = %e, "Failed to request work"),
        }
    }

    async fn shut_down(&mut self) {
        self.set_state(DaemonState::ShuttingDown);
        tracing::info!(in_flight = self.in_flight, "Shutting down");

        let deadline = Instant::now() + self.task_policy.shutdown_grace;
        while self.in_flight > 0 {
            match tokio::time::timeout_at(deadline, self.completions.recv()).await {
                Ok(Some(done)) => {
                    self.in_flight -= 1;
                    if self.session.is_connected() {
                        let _ = self
                            .reporter
                            .report(
                                &mut self.session,
                                done.assignment.build_uuid(),
                                done.assignment.runner_uuid(),
                                &done.outcome,
                            )
                            .await;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(abandoned = self.in_flight, "Shutdown grace expired");
                    break;
                }
            }
        }

        self.session.close().await;
        tracing::info!("Runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::protocol::MessageType;
    use crate::runner::handler::testing::{Script, ScriptedHandler};
    use crate::session::transport::mock::{MockConnector, Peer};

    fn session_policy() -> SessionPolicy {
        SessionPolicy {
            reconnect_interval: Duration::from_secs(1),
            read_timeout: Duration::from_secs(30),
            heartbeat_interval: None,
            ..SessionPolicy::default()
        }
    }

    fn daemon(
        connector: &MockConnector,
        capacity: usize,
        script: Script,
        policy: SessionPolicy,
    ) -> (Daemon, CancellationToken) {
        let identity = Arc::new(RunnerIdentity::new("R1", "test", Vec::new(), capacity).unwrap());
        let mut handlers = HandlerRegistry::new();
        handlers.register(ScriptedHandler::new("push", script));
        let shutdown = CancellationToken::new();
        let daemon = Daemon::new(
            identity,
            policy,
            TaskPolicy::default(),
            Arc::new(connector.clone()),
            handlers,
            shutdown.clone(),
        );
        (daemon, shutdown)
    }

    fn msg(kind: MessageType) -> String {
        Message::new(kind, "R1").encode().unwrap()
    }

    fn assign(build: &str, event: &str) -> String {
        Message {
            build_uuid: build.into(),
            event_name: event.into(),
            event_payload: "{}".into(),
            ..Message::new(MessageType::RequestBuild, "R1")
        }
        .encode()
        .unwrap()
    }

    async fn next(peer: &mut Peer) -> Message {
        let text = peer.next_text().await.expect("runner hung up");
        Message::decode(text.as_bytes()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_are_spaced() {
        let connector = MockConnector::new();
        let (daemon, shutdown) = daemon(&connector, 1, Script::Succeed, session_policy());
        let run = tokio::spawn(daemon.run());

        tokio::time::sleep(Duration::from_millis(5500)).await;
        shutdown.cancel();
        run.await.unwrap().unwrap();

        let attempts = connector.attempts();
        assert!(attempts.len() >= 5, "{} attempts", attempts.len());
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registers_then_requests_work() {
        let connector = MockConnector::new();
        let mut peer = connector.accept_next();
        let (daemon, shutdown) = daemon(&connector, 1, Script::Succeed, session_policy());
        let run = tokio::spawn(daemon.run());

        let register = next(&mut peer).await;
        assert_eq!(register.kind, MessageType::Register);
        assert_eq!(register.runner_uuid, "R1");

        peer.send_text(msg(MessageType::Register));
        assert_eq!(next(&mut peer).await, Message::request_build("R1"));
        peer.send_text(msg(MessageType::Idle));
        assert_eq!(next(&mut peer).await, Message::request_build("R1"));

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_register_ack_yields_one_request() {
        let connector = MockConnector::new();
        let mut peer = connector.accept_next();
        let (daemon, shutdown) = daemon(&connector, 1, Script::Succeed, SessionPolicy::default());
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut peer).await.kind, MessageType::Register);
        // Past the first heartbeat tick.
        tokio::time::sleep(Duration::from_secs(6)).await;
        peer.send_text(msg(MessageType::Register));

        assert_eq!(next(&mut peer).await, Message::request_build("R1"));
        let extra = tokio::time::timeout(Duration::from_secs(8), peer.next_text()).await;
        assert!(extra.is_err(), "second request while one is pending: {extra:?}");

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_is_repeated_after_a_read_window() {
        let connector = MockConnector::new();
        let mut peer = connector.accept_next();
        let (daemon, shutdown) = daemon(&connector, 1, Script::Succeed, session_policy());
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut peer).await.kind, MessageType::Register);
        let started = Instant::now();
        assert_eq!(next(&mut peer).await, Message::request_build("R1"));
        assert!(started.elapsed() >= session_policy().read_timeout);

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn defers_requests_while_at_capacity() {
        let connector = MockConnector::new();
        let mut peer = connector.accept_next();
        let (daemon, shutdown) = daemon(
            &connector,
            1,
            Script::Sleep(Duration::from_secs(10)),
            session_policy(),
        );
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut peer).await.kind, MessageType::Register);
        peer.send_text(assign("B1", "push"));
        // Full after one task: no refill request, and the idle reply waits.
        peer.send_text(msg(MessageType::Idle));

        let result = next(&mut peer).await;
        assert_eq!(result.kind, MessageType::BuildResult);
        assert_eq!(result.build_uuid, "B1");
        assert_eq!(result.err_code, 0);
        assert_eq!(next(&mut peer).await, Message::request_build("R1"));

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refills_remaining_capacity() {
        let connector = MockConnector::new();
        let mut peer = connector.accept_next();
        let (daemon, shutdown) = daemon(
            &connector,
            2,
            Script::Sleep(Duration::from_secs(10)),
            session_policy(),
        );
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut peer).await.kind, MessageType::Register);
        peer.send_text(assign("B1", "push"));
        assert_eq!(next(&mut peer).await, Message::request_build("R1"));

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_assignment_beyond_capacity() {
        let connector = MockConnector::new();
        let mut peer = connector.accept_next();
        let (daemon, shutdown) = daemon(
            &connector,
            1,
            Script::Sleep(Duration::from_secs(10)),
            session_policy(),
        );
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut peer).await.kind, MessageType::Register);
        peer.send_text(assign("B1", "push"));
        peer.send_text(assign("B2", "push"));

        let rejected = next(&mut peer).await;
        assert_eq!(rejected.kind, MessageType::BuildResult);
        assert_eq!(rejected.build_uuid, "B2");
        assert_eq!(rejected.err_code, 1);
        assert!(rejected.err_content.contains("capacity"), "{}", rejected.err_content);

        let finished = next(&mut peer).await;
        assert_eq!(finished.build_uuid, "B1");
        assert_eq!(finished.err_code, 0);

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_event_gets_no_result() {
        let connector = MockConnector::new();
        let mut peer = connector.accept_next();
        let (daemon, shutdown) = daemon(&connector, 1, Script::Succeed, session_policy());
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut peer).await.kind, MessageType::Register);
        peer.send_text(assign("B1", "deploy"));
        // The idle tick re-polls since nothing answered the assignment.
        assert_eq!(next(&mut peer).await, Message::request_build("R1"));

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_and_unsupported_messages_are_skipped() {
        let connector = MockConnector::new();
        let mut peer = connector.accept_next();
        let (daemon, shutdown) = daemon(&connector, 1, Script::Succeed, session_policy());
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut peer).await.kind, MessageType::Register);
        peer.send_text("{{ not json");
        peer.send_text(r#"{"version":2,"type":4,"runnerUUID":"R1"}"#);
        peer.send_text(msg(MessageType::Idle));
        assert_eq!(next(&mut peer).await, Message::request_build("R1"));

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reregisters_after_abnormal_close() {
        let connector = MockConnector::new();
        let mut first = connector.accept_next();
        let (daemon, shutdown) = daemon(&connector, 1, Script::Succeed, session_policy());
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut first).await.kind, MessageType::Register);
        let mut second = connector.accept_next();
        first.fail(TransportError::Reset);

        assert_eq!(next(&mut second).await.kind, MessageType::Register);
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_secs(1));

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_a_quiet_session_alive() {
        let connector = MockConnector::new();
        let Peer {
            inbound,
            mut outbound,
        } = connector.accept_next();
        let policy = SessionPolicy {
            heartbeat_interval: Some(Duration::from_secs(5)),
            read_timeout: Duration::from_secs(10),
            max_read_failures: 1,
            ..session_policy()
        };
        let (daemon, shutdown) = daemon(&connector, 1, Script::Succeed, policy);
        let run = tokio::spawn(daemon.run());

        let pings = tokio::spawn(async move {
            let mut pings = 0;
            while let Some(frame) = outbound.recv().await {
                if matches!(frame, crate::session::Frame::Ping) {
                    pings += 1;
                    let _ = inbound.send(Ok(crate::session::Frame::Pong));
                }
            }
            pings
        });

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts().len(), 1);

        shutdown.cancel();
        run.await.unwrap().unwrap();
        let pings = pings.await.unwrap();
        assert!(pings >= 20, "{pings} pings");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_heartbeat_reconnects() {
        let connector = MockConnector::new();
        let mut first = connector.accept_next();
        let policy = SessionPolicy {
            heartbeat_interval: Some(Duration::from_secs(5)),
            ..session_policy()
        };
        let (daemon, shutdown) = daemon(&connector, 1, Script::Succeed, policy);
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut first).await.kind, MessageType::Register);
        let mut second = connector.accept_next();
        // Writes start failing; reads stay open.
        let Peer {
            inbound: _inbound,
            outbound,
        } = first;
        drop(outbound);

        assert_eq!(next(&mut second).await.kind, MessageType::Register);
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_secs(5));

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stall_reconnect_policy_reregisters() {
        let connector = MockConnector::new();
        let mut first = connector.accept_next();
        let mut second = connector.accept_next();
        let policy = SessionPolicy {
            read_timeout: Duration::from_secs(1),
            max_read_failures: 2,
            on_stall: StallPolicy::Reconnect,
            ..session_policy()
        };
        let (daemon, shutdown) = daemon(&connector, 1, Script::Succeed, policy);
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut first).await.kind, MessageType::Register);
        assert_eq!(next(&mut second).await.kind, MessageType::Register);
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_secs(3));

        second.send_text(msg(MessageType::Register));
        assert_eq!(next(&mut second).await, Message::request_build("R1"));
        assert!(!run.is_finished());

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stall_exit_policy_stops_the_daemon() {
        let connector = MockConnector::new();
        let _peer = connector.accept_next();
        let policy = SessionPolicy {
            read_timeout: Duration::from_secs(1),
            max_read_failures: 2,
            on_stall: StallPolicy::Exit,
            ..session_policy()
        };
        let (daemon, _shutdown) = daemon(&connector, 1, Script::Succeed, policy);

        let err = daemon.run().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::Stalled { failures: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_cancelled_tasks_and_closes() {
        let connector = MockConnector::new();
        let mut peer = connector.accept_next();
        let (daemon, shutdown) = daemon(
            &connector,
            1,
            Script::Sleep(Duration::from_secs(3600)),
            session_policy(),
        );
        let run = tokio::spawn(daemon.run());

        assert_eq!(next(&mut peer).await.kind, MessageType::Register);
        peer.send_text(assign("B1", "push"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert!(started.elapsed() < TaskPolicy::default().shutdown_grace);

        let text = peer.next_text().await.unwrap();
        let result: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(result["type"], 5);
        assert_eq!(result["buildUUID"], "B1");
        assert_eq!(result["errCode"], 1);
        assert!(result["errContent"].as_str().unwrap().contains("shutting down"));
        assert!(matches!(
            peer.outbound.recv().await,
            Some(crate::session::Frame::Close(_))
        ));
    }
}
