use serde_json::Value;
use sluice_error::{ErrorCode, ErrorContext, SluiceError};

#[test]
fn test_json_serialization() {
    let error = SluiceError::new(ErrorCode::InvalidWindow, "End row 3 precedes begin row 10")
        .with_context(ErrorContext::Window {
            begin_row: 10,
            end_row: 3,
        })
        .with_hint("Request a window with begin_row <= end_row");

    let json = error.to_json();
    let v: Value = serde_json::from_str(&json).expect("valid json");

    assert_eq!(v["code"], "SLUICE-2005");
    assert_eq!(v["message"], "End row 3 precedes begin row 10");
    assert_eq!(v["context"]["type"], "window");
    assert_eq!(v["context"]["begin_row"], 10);

    let back: SluiceError = serde_json::from_str(&json).expect("roundtrip");
    assert_eq!(back, error);
}

#[test]
fn test_error_code_parsing() {
    let code: ErrorCode = "SLUICE-4001".to_string().try_into().unwrap();
    assert_eq!(code, ErrorCode::SubmissionRejected);
}
