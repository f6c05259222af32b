//! Map curl failures onto the download error taxonomy.

use crate::error::DownloadError;

/// Convert a curl error into a `DownloadError` for `url`.
///
/// Every transport-level failure becomes `Network` (retryable); the caller
/// handles write-callback aborts itself since only it knows whether the abort
/// came from a disk error, a bad response or cancellation.
pub(crate) fn classify_curl_error(url: &str, e: &curl::Error) -> DownloadError {
    let what = if e.is_operation_timedout() {
        "stalled or timed out"
    } else if e.is_couldnt_resolve_host() || e.is_couldnt_resolve_proxy() {
        "could not resolve host"
    } else if e.is_couldnt_connect() {
        "could not connect"
    } else if e.is_too_many_redirects() {
        "too many redirects"
    } else if e.is_partial_file() {
        "server closed the connection early"
    } else if e.is_recv_error() || e.is_read_error() || e.is_got_nothing() {
        "connection reset"
    } else if e.is_send_error() {
        "send failed"
    } else if e.is_ssl_connect_error() || e.is_peer_failed_verification() {
        "tls handshake failed"
    } else {
        "transfer failed"
    };
    DownloadError::network(url, format!("{what} ({e})"))
}

/// True when the stream broke after the transfer was under way: the server
/// or network dropped the connection rather than refusing the request.
pub(crate) fn is_interruption(e: &curl::Error) -> bool {
    e.is_partial_file() || e.is_recv_error() || e.is_got_nothing() || e.is_read_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn timeouts_are_retryable_network_errors() {
        // CURLE_OPERATION_TIMEDOUT = 28
        let e = curl::Error::new(28);
        let err = classify_curl_error("https://example.com/f", &e);
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.to_string().contains("stalled"));
        assert!(!is_interruption(&e));
    }

    #[test]
    fn partial_file_is_an_interruption() {
        // CURLE_PARTIAL_FILE = 18, CURLE_RECV_ERROR = 56
        assert!(is_interruption(&curl::Error::new(18)));
        assert!(is_interruption(&curl::Error::new(56)));
        // CURLE_COULDNT_CONNECT = 7
        assert!(!is_interruption(&curl::Error::new(7)));
    }

    #[test]
    fn connect_failure_message() {
        let err = classify_curl_error("http://127.0.0.1:1/", &curl::Error::new(7));
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.to_string().contains("could not connect"));
    }
}
