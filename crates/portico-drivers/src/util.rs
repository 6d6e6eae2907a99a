use bytes::Bytes;
use futures_util::{StreamExt as _, TryStreamExt as _};
use portico_driver_api::{ByteStream, DriverError};
use reqwest::StatusCode;
use url::Url;

/// Buffer an incoming stream. Drivers that must know the full payload
/// (memory, small control writes) use this; streaming drivers pass the
/// stream straight through.
pub(crate) async fn collect_stream(mut body: ByteStream) -> Result<Vec<u8>, DriverError> {
    let mut buf = Vec::new();
    while let Some(chunk) = body
        .try_next()
        .await
        .map_err(|e| DriverError::upstream_fatal(format!("read body: {e}")))?
    {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

pub(crate) fn stream_from_bytes(data: Vec<u8>) -> ByteStream {
    futures_util::stream::once(async move { Ok(Bytes::from(data)) }).boxed()
}

pub(crate) fn stream_from_response(res: reqwest::Response) -> ByteStream {
    res.bytes_stream()
        .map_err(std::io::Error::other)
        .boxed()
}

/// Map an upstream HTTP status into the driver failure taxonomy.
pub(crate) fn error_for_status(status: StatusCode, context: &str) -> DriverError {
    match status {
        StatusCode::NOT_FOUND => DriverError::not_found(format!("{context}: not found")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DriverError::permission_denied(format!("{context}: HTTP {status}"))
        }
        StatusCode::CONFLICT => DriverError::conflict(format!("{context}: conflict")),
        StatusCode::PRECONDITION_FAILED => {
            DriverError::conflict(format!("{context}: precondition failed"))
        }
        StatusCode::INSUFFICIENT_STORAGE => {
            DriverError::quota_exceeded(format!("{context}: insufficient storage"))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            DriverError::upstream_transient(format!("{context}: HTTP {status}"))
        }
        s if s.is_server_error() => {
            DriverError::upstream_transient(format!("{context}: HTTP {s}"))
        }
        s => DriverError::upstream_fatal(format!("{context}: HTTP {s}")),
    }
}

pub(crate) fn send_error(err: reqwest::Error, context: &str) -> DriverError {
    if err.is_timeout() || err.is_connect() {
        DriverError::upstream_transient(format!("{context}: {err}"))
    } else {
        DriverError::upstream_fatal(format!("{context}: {err}"))
    }
}

/// Append storage-key segments to a base URL, percent-encoding each one.
pub(crate) fn join_key(base: &Url, key: &str) -> Result<Url, DriverError> {
    let mut url = base.clone();
    {
        let mut segs = url
            .path_segments_mut()
            .map_err(|_| DriverError::invalid_input("base URL cannot be a base"))?;
        segs.pop_if_empty();
        for part in key.split('/').filter(|v| !v.is_empty()) {
            segs.push(part);
        }
    }
    Ok(url)
}

pub(crate) fn guess_content_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

pub(crate) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use url::Url;

    use portico_driver_api::ErrorKind;

    use super::{error_for_status, join_key};

    #[test]
    fn status_mapping() {
        assert_eq!(
            error_for_status(StatusCode::NOT_FOUND, "stat").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            error_for_status(StatusCode::SERVICE_UNAVAILABLE, "put").kind(),
            ErrorKind::UpstreamTransient
        );
        assert_eq!(
            error_for_status(StatusCode::BAD_REQUEST, "put").kind(),
            ErrorKind::UpstreamFatal
        );
    }

    #[test]
    fn join_key_encodes_segments() {
        let base = Url::parse("https://example.com/dav/").unwrap();
        let url = join_key(&base, "a b/c").unwrap();
        assert_eq!(url.as_str(), "https://example.com/dav/a%20b/c");
    }
}
