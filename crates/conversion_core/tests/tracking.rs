use chrono::{Duration, TimeZone, Utc};
use conversion_core::{
    categorize, Conversion, ErrorContext, ErrorInfo, ErrorRecord, ItemMetadata, Session,
    SessionInfo, Status, StepError, TransitionError,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn t(ms: i64) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::milliseconds(ms)
}

fn item(id: &str) -> ItemMetadata {
    ItemMetadata::new(id, "match-file", "espanso").with_grouping("base")
}

#[test]
fn steps_of_the_same_name_cannot_overlap() {
    let mut conversion = Conversion::start(uuid::Uuid::new_v4(), item("a.yml"), 10, t(0));

    conversion.start_step("parse", t(1)).unwrap();
    assert_eq!(
        conversion.start_step("parse", t(2)),
        Err(TransitionError::StepAlreadyActive("parse".into()))
    );
    // A different name may run concurrently.
    conversion.start_step("read", t(2)).unwrap();

    let step = conversion
        .complete_step("parse", Some(json!({"entries": 3})), Some(20), t(11))
        .unwrap();
    assert_eq!(step.status, Status::Completed);
    assert_eq!(step.duration_ms, Some(10));

    // Once closed, the name is free again.
    conversion.start_step("parse", t(12)).unwrap();
    assert_eq!(conversion.active_steps().count(), 2);
}

#[test]
fn completing_unknown_step_is_rejected() {
    let mut conversion = Conversion::start(uuid::Uuid::new_v4(), item("a.yml"), 0, t(0));
    let err = conversion.complete_step("write", None, None, t(1)).unwrap_err();
    assert_eq!(err, TransitionError::NoActiveStep("write".into()));
}

#[test]
fn terminal_conversions_reject_every_transition() {
    let mut conversion = Conversion::start(uuid::Uuid::new_v4(), item("a.yml"), 0, t(0));
    conversion.start_step("convert", t(1)).unwrap();
    conversion.finish(false, None, 5, t(40)).unwrap();

    assert_eq!(conversion.status, Status::Failed);
    assert_eq!(conversion.duration_ms, Some(40));
    // Dangling steps are closed as failed.
    assert_eq!(conversion.steps[0].status, Status::Failed);

    assert!(matches!(
        conversion.finish(true, None, 5, t(50)),
        Err(TransitionError::ConversionFinished(_, Status::Failed))
    ));
    assert!(conversion.start_step("again", t(60)).is_err());
    assert!(conversion.log_step("again", None, None, t(60)).is_err());
}

#[test]
fn failed_steps_keep_their_error() {
    let mut conversion = Conversion::start(uuid::Uuid::new_v4(), item("a.yml"), 0, t(0));
    conversion.start_step("write", t(0)).unwrap();
    let step = conversion
        .fail_step(
            "write",
            StepError {
                error_id: None,
                message: "disk full".into(),
            },
            Some(99),
            t(3),
        )
        .unwrap();
    assert_eq!(step.status, Status::Failed);
    assert_eq!(step.error.as_ref().unwrap().message, "disk full");
    assert_eq!(conversion.resources.peak, 99);
}

#[test]
fn summary_carries_error_categories() {
    let mut conversion = Conversion::start(uuid::Uuid::new_v4(), item("a.yml"), 0, t(0));
    let info = ErrorInfo::new("ENOENT: no such file");
    let ctx = ErrorContext::new("file-access", "read");
    conversion.attach_error(ErrorRecord::new(info.clone(), categorize(&info, &ctx), ctx));
    conversion.finish(true, None, 0, t(10)).unwrap();

    let summary = conversion.summary();
    assert!(summary.success);
    assert_eq!(summary.error_categories.len(), 1);
    assert_eq!(summary.error_categories[0].as_str(), "file-not-found");
}

#[test]
fn session_cannot_complete_with_active_children() {
    let mut session = Session::start(SessionInfo::new("batch", "espanso").expecting(2), 100, t(0));
    let mut first = Conversion::start(session.id, item("a.yml"), 100, t(1));
    let second = Conversion::start(session.id, item("b.yml"), 100, t(1));
    session.register_conversion(first.id).unwrap();
    session.register_conversion(second.id).unwrap();

    first.observe_memory(800);
    first.finish(true, None, 120, t(101)).unwrap();
    session.absorb_conversion(first).unwrap();

    assert_eq!(
        session.complete(100, t(200)),
        Err(TransitionError::ConversionsStillActive {
            session: session.id,
            active: 1
        })
    );
    assert_eq!(session.status, Status::Active);

    let mut second = second;
    second.finish(false, None, 100, t(301)).unwrap();
    session.absorb_conversion(second).unwrap();

    let summary = session.complete(100, t(400)).unwrap();
    assert_eq!(summary.total_conversions, 2);
    assert_eq!(summary.successful_conversions, 1);
    assert_eq!(summary.failed_conversions, 1);
    assert_eq!(summary.average_duration_ms, 200.0);
    assert_eq!(summary.peak_memory_bytes, 800);
    assert_eq!(summary.duration_ms, Some(400));
    assert_eq!(session.status, Status::Completed);
}

#[test]
fn session_rejects_conversions_it_does_not_own() {
    let mut session = Session::start(SessionInfo::new("batch", "espanso"), 0, t(0));
    let mut stray = Conversion::start(uuid::Uuid::new_v4(), item("x.yml"), 0, t(0));
    stray.finish(true, None, 0, t(1)).unwrap();
    assert!(matches!(
        session.absorb_conversion(stray),
        Err(TransitionError::ForeignConversion { .. })
    ));
}
