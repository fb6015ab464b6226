use utilkit_logger::{init_tracing, LoggerError};

#[test]
fn test_init_tracing_installs_once() {
    assert!(init_tracing("info").is_ok());
    tracing::info!("fmt subscriber installed");

    let err = init_tracing("debug").unwrap_err();
    assert!(matches!(err, LoggerError::Init(_)), "{err}");
}
