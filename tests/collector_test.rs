mod common;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{wait_until, FixedProber, SwitchPresence};
use stream_pulse::api::StatusBoard;
use stream_pulse::collector::{CollectorClient, RemoteTargets};
use stream_pulse::env::StaticEnv;
use stream_pulse::host::HostState;
use stream_pulse::models::{HostSnapshot, SessionInfo};
use stream_pulse::reporting::{HttpReporter, ReportSink, TARGET_LOOKUP_TIMEOUT};
use stream_pulse::task::{ProbeContext, ProbeState, ProbeTask};
use stream_pulse::{Endpoint, Measurement};

fn reporter(server: &MockServer, env: StaticEnv, running: bool) -> HttpReporter {
    HttpReporter::new(
        CollectorClient::new(&server.uri()),
        "studio-1".into(),
        ".udvashunmesh.com".into(),
        Arc::new(env),
        Arc::new(SwitchPresence::new(running)),
        Arc::new(FixedProber { delay: Duration::ZERO }),
    )
}

fn host() -> HostSnapshot {
    HostSnapshot {
        local_ip: "192.168.1.20".into(),
        public_ip: "203.0.113.9".into(),
        isp: "Link3_Technologies_Limited".into(),
        app_running: true,
        session: SessionInfo {
            preview_ostream: "https://ostream.example/play?streamName=room7".into(),
            ..SessionInfo::default()
        },
    }
}

#[tokio::test]
async fn fetches_remote_targets() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/get_targets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "target": "a.com", "added_by": "ops" },
            { "target": "b.com" }
        ])))
        .mount(&server)
        .await;

    let client = CollectorClient::new(&format!("{}/", server.uri()));
    let targets = client.fetch_targets().await.unwrap();
    assert_eq!(targets, vec!["a.com", "b.com"]);
}

#[tokio::test]
async fn remote_targets_error_on_bad_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/get_targets"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = CollectorClient::new(&server.uri()).fetch_targets().await.unwrap_err();
    assert!(!err.is_transport());
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn unreachable_collector_is_a_transport_error() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let err = CollectorClient::new(&uri).fetch_targets().await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn measurement_report_carries_derived_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push_ping"))
        .and(body_partial_json(serde_json::json!({
            "client_id": "192.168.1.20",
            "computer_name": "studio-1",
            "target": "os-origin-server-2.udvashunmesh.com",
            "target_display": "os-origin-server-2",
            "stream_id": "room7",
            "isp_display": "Link3",
            "success": true,
            "rtt_ms": 12.5
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let r = reporter(&server, StaticEnv::default(), true);
    let endpoint = Endpoint::parse("os-origin-server-2.udvashunmesh.com").unwrap();
    r.report_measurement(&endpoint, &Measurement::reply(12.5, "time=12.5ms"), &host()).await;
}

#[tokio::test]
async fn ip_literal_target_passes_through() {
    let server = MockServer::start().await;
    let r = reporter(&server, StaticEnv::default(), true);
    let endpoint = Endpoint::parse("10.1.2.3").unwrap();
    let report = r.ping_report(&endpoint, &Measurement::failed("Timeout"), &host()).await;
    assert_eq!(report.target_ip, "10.1.2.3");
    assert!(!report.success);
    assert_eq!(report.rtt_ms, -10.0);
    assert_eq!(report.stream_id, "");
}

#[tokio::test]
async fn target_ip_comes_from_system_resolver() {
    let server = MockServer::start().await;
    let r = reporter(&server, StaticEnv::default(), true);
    let report = r
        .ping_report(&Endpoint::parse("localhost").unwrap(), &Measurement::reply(1.0, "time<1ms"), &host())
        .await;
    let ip: IpAddr = report.target_ip.parse().unwrap();
    assert!(ip.is_loopback());
}

#[tokio::test]
async fn unresolvable_target_is_bounded_by_lookup_timeout() {
    let server = MockServer::start().await;
    let r = reporter(&server, StaticEnv::default(), true);
    let endpoint = Endpoint::parse("no-such-host.invalid").unwrap();

    let started = Instant::now();
    let report = r.ping_report(&endpoint, &Measurement::failed("Timeout"), &host()).await;
    assert!(started.elapsed() < TARGET_LOOKUP_TIMEOUT + Duration::from_millis(500));
    assert_eq!(report.target_ip, "");
}

#[tokio::test]
async fn unresolvable_target_keeps_probe_cadence() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push_ping"))
        .and(body_partial_json(serde_json::json!({ "target": "no-such-host.invalid", "target_ip": "" })))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let sink: Arc<dyn ReportSink> = Arc::new(reporter(&server, StaticEnv::default(), true));
    let ctx = ProbeContext {
        prober: Arc::new(FixedProber { delay: Duration::ZERO }),
        sink,
        host: HostState::new(host()),
        board: StatusBoard::default(),
        ping_interval: Duration::from_millis(10),
        client_info_every: 60,
    };
    let handle = ProbeTask::spawn(Endpoint::parse("no-such-host.invalid").unwrap(), ctx);

    let started = Instant::now();
    assert!(wait_until(Duration::from_secs(5), || handle.probes() >= 3).await);
    assert!(started.elapsed() < TARGET_LOOKUP_TIMEOUT * 4);
    handle.stop().await;
    assert!(server.received_requests().await.unwrap().len() >= 3);
}

#[tokio::test]
async fn client_info_probes_streaming_servers() {
    let server = MockServer::start().await;
    let env = StaticEnv::new([
        ("OBS_STREAMING_SERVERS", "os-origin-server-1.example.com"),
        ("OBS_STREAM_PREVIEW", "rtmp://a.rtmp.youtube.com/live2|https://www.youtube.com/watch?v=abc"),
        ("OBS_ICR_CODE", "ICR-9"),
    ]);
    let report = reporter(&server, env, true).client_info(&host()).await;

    assert!(report.obs_running);
    assert_eq!(report.obs_icr_code, "ICR-9");
    assert_eq!(report.os_origin_server, "os-origin-server-1.example.com");
    assert_eq!(report.os_origin_ping, 7.0);
    assert_eq!(report.youtube_server, "a.rtmp.youtube.com");
    assert_eq!(report.youtube_ping, 7.0);
    assert_eq!(report.obs_stream_preview_youtube, "https://www.youtube.com/watch?v=abc");
}

#[tokio::test]
async fn client_info_is_cleared_without_broadcaster() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push_client_info"))
        .and(body_partial_json(serde_json::json!({
            "obs_running": false,
            "os_origin_server": "none",
            "youtube_server": "none",
            "obs_icr_code": "unknown"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = StaticEnv::new([("OBS_STREAMING_SERVERS", "os-origin-server-1.example.com"), ("OBS_ICR_CODE", "ICR-9")]);
    reporter(&server, env, false).report_host_snapshot(&host()).await;
}

#[tokio::test]
async fn slow_collector_does_not_stop_probe_loop() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push_ping"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(8)))
        .mount(&server)
        .await;

    let sink: Arc<dyn ReportSink> = Arc::new(reporter(&server, StaticEnv::default(), true));
    let ctx = ProbeContext {
        prober: Arc::new(FixedProber { delay: Duration::ZERO }),
        sink,
        host: HostState::new(host()),
        board: StatusBoard::default(),
        ping_interval: Duration::from_millis(10),
        client_info_every: 60,
    };
    let handle = ProbeTask::spawn(Endpoint::parse("10.0.0.1").unwrap(), ctx);

    // Each push gives up after its timeout and the loop carries on.
    assert!(wait_until(Duration::from_secs(20), || handle.probes() >= 2).await);
    assert_eq!(handle.state(), ProbeState::Running);
    handle.request_stop();
}
