use axum::http::Request;
use metrics::counter;
use sqlx::Error as SqlxError;
use tower_http::request_id::RequestId;

pub(crate) fn request_id_from_request<B>(req: &Request<B>) -> Option<String> {
    req.extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .map(str::to_string)
}

/// Coarse cause of an internal error, used as the `kind` label.
fn store_error_kind(err: &anyhow::Error) -> Option<&'static str> {
    err.chain().find_map(|cause| {
        if let Some(db_err) = cause.downcast_ref::<SqlxError>() {
            return Some(match db_err {
                SqlxError::Database(_) => "database",
                SqlxError::Io(_) => "io",
                SqlxError::PoolTimedOut | SqlxError::PoolClosed => "pool",
                _ => "sqlx",
            });
        }
        cause
            .downcast_ref::<serde_json::Error>()
            .map(|_| "corrupt_record")
    })
}

pub(crate) fn record_internal_error_metrics(err: &anyhow::Error) {
    counter!("control_plane_internal_errors_total").increment(1);
    if let Some(kind) = store_error_kind(err) {
        counter!("control_plane_store_errors_total", "kind" => kind).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn request_id_is_read_from_extensions() {
        let mut req = Request::new(());
        assert!(request_id_from_request(&req).is_none());

        req.extensions_mut()
            .insert(RequestId::new(HeaderValue::from_static("req-123")));
        assert_eq!(request_id_from_request(&req), Some("req-123".to_string()));
    }

    #[test]
    fn store_errors_are_classified_through_context() {
        let decode = serde_json::from_str::<u64>("not json").unwrap_err();
        let err = anyhow::Error::new(decode).context("decode host record");
        assert_eq!(store_error_kind(&err), Some("corrupt_record"));

        let err = anyhow::Error::new(SqlxError::PoolTimedOut).context("load plan");
        assert_eq!(store_error_kind(&err), Some("pool"));

        assert_eq!(store_error_kind(&anyhow::anyhow!("boom")), None);
    }
}
