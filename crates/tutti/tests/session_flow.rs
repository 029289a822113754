//! End-to-end session tests: a real controller on loopback TCP with
//! `DeviceAgent`s as the devices.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tutti::controller::StartOutcome;
use tutti::device::{DeviceAgent, DeviceAgentConfig, ScriptedHandler};
use tutti::session::{AbortReason, Outcome, Role, SessionRequest, SessionState};
use tutti::{ControllerHandle, Daemon, TuttiError};
use tutticonf::TuttiConfig;
use tuttiproto::{
    Body, Capability, DeviceId, FrameCodec, HelloPayload, Message, RetryPolicy, PROTOCOL_VERSION,
};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    daemon: Daemon,
    shutdown: CancellationToken,
    reports: tempfile::TempDir,
}

impl Rig {
    async fn start(tune: impl FnOnce(&mut TuttiConfig)) -> Self {
        let reports = tempfile::tempdir().unwrap();
        let mut config = TuttiConfig::default();
        config.infra.paths.report_dir = reports.path().to_path_buf();
        config.infra.bind.device_listen = "127.0.0.1:0".to_string();
        config.infra.bind.http_port = 0;
        config.coordination.session.start_timeout_ms = 1000;
        config.coordination.session.stop_timeout_ms = 1000;
        config.coordination.session.start_lead_ms = 50;
        tune(&mut config);

        let shutdown = CancellationToken::new();
        let daemon = tutti::launch(&config, shutdown.clone()).await.unwrap();
        Self {
            daemon,
            shutdown,
            reports,
        }
    }

    fn controller(&self) -> &ControllerHandle {
        &self.daemon.controller
    }

    fn device(&self, id: &str, caps: &[Capability], handler: Arc<ScriptedHandler>) -> Device {
        let config = DeviceAgentConfig::new(id, self.daemon.device_addr.to_string())
            .with_capabilities(caps.iter().cloned())
            .with_retry(
                RetryPolicy::default()
                    .with_max_attempts(3)
                    .with_backoff(Duration::from_millis(20), Duration::from_millis(100)),
            );
        let agent = DeviceAgent::new(config, handler.clone());
        let token = CancellationToken::new();
        tokio::spawn(agent.clone().run(token.clone()));
        Device {
            agent,
            handler,
            token,
        }
    }

    async fn wait_active(&self, count: usize) {
        let registry = self.controller().registry().clone();
        timeout(WAIT, async move {
            while registry.active().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("devices never became active");
    }

    async fn wait_state(&self, pred: impl Fn(Option<SessionState>) -> bool) {
        let controller = self.controller().clone();
        timeout(WAIT, async move {
            loop {
                let state = controller.current_session().await.unwrap().map(|v| v.state);
                if pred(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never reached the expected state");
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Device {
    agent: DeviceAgent,
    handler: Arc<ScriptedHandler>,
    token: CancellationToken,
}

impl Drop for Device {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn scripted() -> Arc<ScriptedHandler> {
    Arc::new(ScriptedHandler::new())
}

fn request(caps: &[Capability]) -> SessionRequest {
    SessionRequest::for_capabilities(caps.iter().cloned())
}

#[tokio::test]
async fn three_devices_record_and_stop() {
    let rig = Rig::start(|_| {}).await;
    let rig_dev = rig.device("rig", &[Capability::Camera, Capability::Gsr], scripted());
    let cam = rig.device("cam", &[Capability::Camera], scripted());
    let thermal = rig.device("thermal", &[Capability::Thermal], scripted());
    rig.wait_active(3).await;

    let view = rig
        .controller()
        .create_session(request(&[Capability::Camera, Capability::Gsr]))
        .await
        .unwrap();
    assert_eq!(view.state, SessionState::Configuring);
    assert_eq!(view.participants.len(), 2);
    assert_eq!(view.excluded.len(), 1);
    assert_eq!(view.excluded[0].device_id, DeviceId::from("thermal"));

    let session = match rig.controller().start_session().await.unwrap() {
        StartOutcome::Recording { session } => session,
        StartOutcome::Aborted { report } => panic!("aborted: {:?}", report.abort),
    };
    assert_eq!(session.state, SessionState::Recording);
    let start_id = session.start_command_id.unwrap();

    let report = rig.controller().stop_session().await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(report.start_command_id, Some(start_id));
    assert_eq!(report.device(&DeviceId::from("rig")).unwrap().role, Role::Required);
    assert_eq!(report.device(&DeviceId::from("cam")).unwrap().role, Role::Optional);
    assert!(report.device(&DeviceId::from("rig")).unwrap().stop.is_some());

    // One start command, one id, applied by both participants
    for device in [&rig_dev, &cam] {
        let starts: Vec<_> = device
            .handler
            .applied()
            .into_iter()
            .filter(|c| c.command_name == "start")
            .collect();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].command_id, start_id);
        assert!(starts[0].parameters.contains_key("startAtReference"));
    }
    assert!(thermal.handler.applied().is_empty());
    assert!(rig_dev.agent.stats().sync_replies > 0);

    let written = rig
        .reports
        .path()
        .join(format!("{}.json", report.session_id));
    assert!(written.exists());
    assert!(rig.controller().current_session().await.unwrap().is_none());
}

#[tokio::test]
async fn silent_required_device_times_out_start() {
    let rig = Rig::start(|c| {
        c.coordination.session.start_timeout_ms = 300;
        c.coordination.session.command_retry_base_ms = 20;
        c.coordination.session.command_retry_max_ms = 50;
    })
    .await;
    let _quiet = rig.device(
        "quiet",
        &[Capability::Camera],
        Arc::new(ScriptedHandler::new().silent_on("start")),
    );
    let _loud = rig.device("loud", &[Capability::Camera], scripted());
    rig.wait_active(2).await;

    rig.controller()
        .create_session(request(&[Capability::Camera]))
        .await
        .unwrap();
    let report = match rig.controller().start_session().await.unwrap() {
        StartOutcome::Aborted { report } => report,
        StartOutcome::Recording { .. } => panic!("recorded without a required ack"),
    };

    assert_eq!(report.outcome, Outcome::Aborted);
    let abort = report.abort.as_ref().unwrap();
    assert_eq!(abort.reason, AbortReason::StartTimeout { timeout_ms: 300 });
    assert_eq!(abort.non_responding, vec![DeviceId::from("quiet")]);
    assert_eq!(abort.missing_required, vec![DeviceId::from("quiet")]);
    assert_eq!(abort.responding, vec![DeviceId::from("loud")]);

    // Re-sent twice, then given up on well before the deadline
    let quiet = report.device(&DeviceId::from("quiet")).unwrap();
    assert_eq!(quiet.resends, 2);
    assert!(quiet.unresponsive);
    let loud = report.device(&DeviceId::from("loud")).unwrap();
    assert_eq!(loud.resends, 0);
    assert!(!loud.unresponsive);
}

#[tokio::test]
async fn lost_start_is_resent_with_the_same_id() {
    let rig = Rig::start(|c| {
        c.coordination.session.start_timeout_ms = 3000;
        c.coordination.session.command_retry_base_ms = 100;
    })
    .await;
    let lossy = rig.device(
        "lossy",
        &[Capability::Camera],
        Arc::new(ScriptedHandler::new().dropping_first("start", 1)),
    );
    rig.wait_active(1).await;

    rig.controller()
        .create_session(request(&[Capability::Camera]))
        .await
        .unwrap();
    let session = match rig.controller().start_session().await.unwrap() {
        StartOutcome::Recording { session } => session,
        StartOutcome::Aborted { report } => panic!("aborted: {:?}", report.abort),
    };

    let starts: Vec<_> = lossy
        .handler
        .applied()
        .into_iter()
        .filter(|c| c.command_name == "start")
        .collect();
    assert_eq!(starts.len(), 1);
    assert_eq!(Some(starts[0].command_id), session.start_command_id);

    let report = rig.controller().stop_session().await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    let lossy_report = report.device(&DeviceId::from("lossy")).unwrap();
    assert_eq!(lossy_report.resends, 1);
    assert!(!lossy_report.unresponsive);
}

#[tokio::test]
async fn required_rejection_aborts_and_retry_demotes() {
    let rig = Rig::start(|_| {}).await;
    let _gsr = rig.device(
        "gsr",
        &[Capability::Camera, Capability::Gsr],
        Arc::new(ScriptedHandler::new().failing("start")),
    );
    let _cam = rig.device("cam", &[Capability::Camera, Capability::Gsr], scripted());
    rig.wait_active(2).await;

    rig.controller()
        .create_session(request(&[Capability::Camera, Capability::Gsr]))
        .await
        .unwrap();
    let report = match rig.controller().start_session().await.unwrap() {
        StartOutcome::Aborted { report } => report,
        StartOutcome::Recording { .. } => panic!("recorded despite a rejection"),
    };
    match &report.abort.as_ref().unwrap().reason {
        AbortReason::RequiredRejected { device, command, .. } => {
            assert_eq!(device, &DeviceId::from("gsr"));
            assert_eq!(command, "start");
        }
        other => panic!("unexpected abort reason {:?}", other),
    }

    let retried = rig
        .controller()
        .retry(vec![DeviceId::from("gsr")])
        .await
        .unwrap();
    assert_eq!(retried.retry_of, Some(report.session_id.clone()));
    let gsr = retried
        .participants
        .iter()
        .find(|p| p.device_id == DeviceId::from("gsr"))
        .unwrap();
    assert_eq!(gsr.role, Role::Optional);
    assert!(gsr.demoted);

    match rig.controller().start_session().await.unwrap() {
        StartOutcome::Recording { session } => assert_eq!(session.state, SessionState::Recording),
        StartOutcome::Aborted { report } => panic!("retry aborted: {:?}", report.abort),
    }
}

#[tokio::test]
async fn optional_loss_keeps_recording_required_loss_aborts() {
    let rig = Rig::start(|_| {}).await;
    let required = rig.device("required", &[Capability::Camera, Capability::Audio], scripted());
    let optional = rig.device("optional", &[Capability::Audio], scripted());
    rig.wait_active(2).await;

    rig.controller()
        .create_session(request(&[Capability::Camera, Capability::Audio]))
        .await
        .unwrap();
    assert!(matches!(
        rig.controller().start_session().await.unwrap(),
        StartOutcome::Recording { .. }
    ));

    optional.token.cancel();
    let registry = rig.controller().registry().clone();
    timeout(WAIT, async {
        while registry.active().len() > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let view = rig.controller().current_session().await.unwrap().unwrap();
    assert_eq!(view.state, SessionState::Recording);

    required.token.cancel();
    rig.wait_state(|s| s.is_none()).await;

    let reports = rig.controller().reports().await.unwrap();
    let last = reports.last().unwrap();
    assert_eq!(last.outcome, Outcome::Aborted);
    assert_eq!(
        last.abort.as_ref().unwrap().reason,
        AbortReason::RequiredDisconnected {
            device: DeviceId::from("required")
        }
    );
    assert!(last
        .device(&DeviceId::from("optional"))
        .unwrap()
        .disconnected_at
        .is_some());
}

#[tokio::test]
async fn unacked_command_is_replayed_after_reconnect() {
    let rig = Rig::start(|_| {}).await;
    let _anchor = rig.device("anchor", &[Capability::Camera, Capability::Imu], scripted());

    // A bare client that takes the configure command and vanishes without acking
    let stream = TcpStream::connect(rig.daemon.device_addr).await.unwrap();
    let mut flaky = Framed::new(stream, FrameCodec::default());
    flaky
        .send(Message::hello(HelloPayload {
            device_id: DeviceId::from("imu"),
            capabilities: vec![Capability::Imu],
            protocol_version: PROTOCOL_VERSION,
            device_name: None,
        }))
        .await
        .unwrap();
    rig.wait_active(2).await;

    let view = rig
        .controller()
        .create_session(request(&[Capability::Camera, Capability::Imu]))
        .await
        .unwrap();

    let configure = timeout(WAIT, async {
        loop {
            let message = flaky.next().await.unwrap().unwrap();
            if let Body::Command(command) = message.body {
                break command;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(configure.command_name, "configure");
    drop(flaky);

    let imu = rig.device("imu", &[Capability::Imu], scripted());
    timeout(WAIT, async {
        while imu.handler.applied().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let replayed = &imu.handler.applied()[0];
    assert_eq!(replayed.command_id, configure.command_id);
    assert_eq!(replayed.session_id.as_deref(), Some(view.session_id.as_str()));
    assert_eq!(imu.agent.stats().connections, 1);
}

#[tokio::test]
async fn second_session_is_rejected_while_active() {
    let rig = Rig::start(|_| {}).await;
    let _cam = rig.device("cam", &[Capability::Camera], scripted());
    rig.wait_active(1).await;

    rig.controller()
        .create_session(request(&[Capability::Camera]))
        .await
        .unwrap();
    let err = rig
        .controller()
        .create_session(request(&[Capability::Camera]))
        .await
        .unwrap_err();
    assert!(matches!(err, TuttiError::Consistency(_)));

    let err = rig.controller().stop_session().await.unwrap_err();
    assert!(matches!(err, TuttiError::Consistency(_)));
}
