//! Violation reports as seen by log pipelines.

#![allow(clippy::unwrap_used)]

use rollback_netplay::report_violation;
use rollback_netplay::telemetry::{
    CollectingObserver, TracingObserver, Violation, ViolationKind, ViolationObserver,
    ViolationSeverity,
};
use rollback_netplay::Frame;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

fn sample() -> Violation {
    Violation::new(
        ViolationSeverity::Error,
        ViolationKind::NetworkProtocol,
        "input row has 3 columns, expected 2",
        "protocol.rs:10",
    )
    .with_frame(Frame::new(42))
    .with_context("peer", "127.0.0.1:7000")
}

#[test]
fn violations_serialize_with_snake_case_tags() {
    let json = serde_json::to_value(sample()).unwrap();
    assert_eq!(json["severity"], "error");
    assert_eq!(json["kind"], "network_protocol");
    assert_eq!(json["frame"], 42);
    assert_eq!(json["context"]["peer"], "127.0.0.1:7000");
    assert_eq!(json["location"], "protocol.rs:10");
}

#[cfg(feature = "json")]
#[test]
fn to_json_matches_serde_json() {
    let violation = sample();
    assert_eq!(
        violation.to_json().unwrap(),
        serde_json::to_string(&violation).unwrap()
    );
}

#[test]
fn tracing_observer_logs_every_severity() {
    init_tracing();
    for severity in [
        ViolationSeverity::Warning,
        ViolationSeverity::Error,
        ViolationSeverity::Critical,
    ] {
        TracingObserver.on_violation(&Violation::new(
            severity,
            ViolationKind::Traversal,
            "dropping server datagram",
            "client.rs:1",
        ));
    }
    report_violation!(
        ViolationSeverity::Warning,
        ViolationKind::Configuration,
        "fps {} clamped to {}",
        0,
        1
    );
}

#[test]
fn collecting_observer_filters_by_kind() {
    let observer = CollectingObserver::new();
    observer.on_violation(&sample());
    assert!(observer.has_violation(ViolationKind::NetworkProtocol));
    assert!(!observer.has_violation(ViolationKind::Traversal));
    assert_eq!(observer.violations(), vec![sample()]);
}
