//! Integration tests for transfer error categorization.
//!
//! These validate that status codes and transfer errors map onto the
//! `ErrorCategory` labels the trace callback and Prometheus side-channel use.

use smoothloader::errors::ErrorCategory;

#[test]
fn test_categorize_2xx_success() {
    assert_eq!(ErrorCategory::from_status_code(200), None);
    assert_eq!(ErrorCategory::from_status_code(201), None);
    assert_eq!(ErrorCategory::from_status_code(204), None);
}

#[test]
fn test_categorize_3xx_redirection() {
    assert_eq!(ErrorCategory::from_status_code(301), None);
    assert_eq!(ErrorCategory::from_status_code(302), None);
    assert_eq!(ErrorCategory::from_status_code(304), None);
}

#[test]
fn test_categorize_4xx_client_errors() {
    assert_eq!(ErrorCategory::from_status_code(400), Some(ErrorCategory::ClientError));
    assert_eq!(ErrorCategory::from_status_code(401), Some(ErrorCategory::ClientError));
    assert_eq!(ErrorCategory::from_status_code(403), Some(ErrorCategory::ClientError));
    assert_eq!(ErrorCategory::from_status_code(404), Some(ErrorCategory::ClientError));
    assert_eq!(ErrorCategory::from_status_code(429), Some(ErrorCategory::ClientError));
}

#[test]
fn test_categorize_5xx_server_errors() {
    assert_eq!(ErrorCategory::from_status_code(500), Some(ErrorCategory::ServerError));
    assert_eq!(ErrorCategory::from_status_code(502), Some(ErrorCategory::ServerError));
    assert_eq!(ErrorCategory::from_status_code(503), Some(ErrorCategory::ServerError));
    assert_eq!(ErrorCategory::from_status_code(504), Some(ErrorCategory::ServerError));
}

#[test]
fn test_error_category_labels() {
    assert_eq!(ErrorCategory::ClientError.label(), "client_error");
    assert_eq!(ErrorCategory::ServerError.label(), "server_error");
    assert_eq!(ErrorCategory::NetworkError.label(), "network_error");
    assert_eq!(ErrorCategory::TimeoutError.label(), "timeout_error");
    assert_eq!(ErrorCategory::TlsError.label(), "tls_error");
    assert_eq!(ErrorCategory::OtherError.label(), "other_error");
}

#[test]
fn test_error_category_equality_and_hash() {
    use std::collections::HashMap;

    assert_eq!(ErrorCategory::ClientError, ErrorCategory::ClientError);
    assert_ne!(ErrorCategory::ClientError, ErrorCategory::ServerError);
    assert_ne!(ErrorCategory::NetworkError, ErrorCategory::TimeoutError);

    let mut map = HashMap::new();
    map.insert(ErrorCategory::ClientError, 10);
    map.insert(ErrorCategory::ServerError, 20);
    assert_eq!(map.get(&ErrorCategory::ClientError), Some(&10));
    assert_eq!(map.get(&ErrorCategory::ServerError), Some(&20));
}

#[test]
fn test_error_category_display_matches_label() {
    assert_eq!(ErrorCategory::TlsError.to_string(), "tls_error");
    assert_eq!(ErrorCategory::OtherError.to_string(), "other_error");
}
