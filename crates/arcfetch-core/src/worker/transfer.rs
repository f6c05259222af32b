//! Blocking curl transfer for one chunk, with stall reconnects.

use std::cell::RefCell;
use std::mem;

use curl::easy::{Easy, List};

use super::response::{parse_response, HeaderLines, ResponseInfo};
use super::{CancelToken, DataSink, EventEmitter, WorkerEvent, WorkerJob, WorkerOutcome};
use crate::error::DownloadError;
use crate::retry::{classify_curl_error, is_interruption};

/// Result of one request attempt.
enum Attempt {
    Done(WorkerOutcome),
    /// No data for the stall timeout; `delivered` bytes arrived before that.
    Stalled { delivered: u64, error: curl::Error },
}

struct Stream {
    buffer: Vec<u8>,
    /// File offset of `buffer[0]`.
    buffer_offset: u64,
    received: u64,
    validated: bool,
    abort: Option<DownloadError>,
}

pub(super) fn perform<S: DataSink>(
    job: &WorkerJob,
    mut sink: S,
    cancel: &CancelToken,
    emitter: &EventEmitter,
) -> WorkerOutcome {
    let end = job.size.map(|s| job.offset + s);
    let mut position = job.offset;
    let mut stall_resets = job.settings.max_stall_resets;
    let mut response_sent = false;

    loop {
        if end.is_some_and(|end| position >= end) && response_sent {
            return WorkerOutcome::Completed;
        }
        match attempt(job, position, end, &mut sink, cancel, emitter, &mut response_sent) {
            Attempt::Done(outcome) => return outcome,
            Attempt::Stalled { delivered, error } => {
                position += delivered;
                if !job.ranged || stall_resets == 0 || cancel.is_canceled() {
                    if cancel.is_canceled() {
                        return WorkerOutcome::Canceled;
                    }
                    return WorkerOutcome::Failed(classify_curl_error(&job.url, &error));
                }
                stall_resets -= 1;
                tracing::debug!(
                    worker = job.id,
                    position,
                    resets_left = stall_resets,
                    "connection stalled, reconnecting"
                );
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn attempt<S: DataSink>(
    job: &WorkerJob,
    start: u64,
    end: Option<u64>,
    sink: &mut S,
    cancel: &CancelToken,
    emitter: &EventEmitter,
    response_sent: &mut bool,
) -> Attempt {
    let url = job.url.as_str();
    let headers = RefCell::new(HeaderLines::default());
    let stream = RefCell::new(Stream {
        buffer: Vec::with_capacity(job.settings.write_buffer_bytes.min(4 * 1024 * 1024)),
        buffer_offset: start,
        received: 0,
        validated: false,
        abort: None,
    });

    let mut easy = Easy::new();
    let result = configure(&mut easy, job, start, end).and_then(|()| {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            headers.borrow_mut().push_raw(data);
            true
        })?;
        transfer.write_function(|data| {
            if cancel.is_canceled() {
                return Ok(0);
            }
            let mut st = stream.borrow_mut();
            if !st.validated {
                st.validated = true;
                let info = parse_response(url, headers.borrow().lines());
                if let Err(e) = validate(&info, job, start) {
                    st.abort = Some(e);
                    return Ok(0);
                }
                if !*response_sent {
                    *response_sent = true;
                    emitter.emit(WorkerEvent::Response(info));
                }
            }
            let offset = start + st.received;
            st.received += data.len() as u64;
            emitter.emit(WorkerEvent::Data {
                offset,
                len: data.len() as u64,
            });
            st.buffer.extend_from_slice(data);
            if st.buffer.len() >= job.settings.write_buffer_bytes {
                if let Err(e) = flush(&mut st, sink, emitter) {
                    st.abort = Some(e);
                    return Ok(0);
                }
            }
            Ok(data.len())
        })?;
        transfer.progress_function(|_, _, _, _| !cancel.is_canceled())?;
        transfer.perform()
    });

    let mut st = stream.into_inner();
    let disk_failed = matches!(st.abort, Some(DownloadError::Disk { .. }));
    if !disk_failed && !st.buffer.is_empty() {
        if let Err(e) = flush(&mut st, sink, emitter) {
            if !cancel.is_canceled() && st.abort.is_none() {
                st.abort = Some(e);
            }
        }
    }
    if let Some(err) = st.abort {
        return Attempt::Done(WorkerOutcome::Failed(err));
    }
    if cancel.is_canceled() {
        return Attempt::Done(WorkerOutcome::Canceled);
    }

    match result {
        Ok(()) => {
            if !st.validated {
                // Empty body: the write callback never ran.
                let info = parse_response(url, headers.borrow().lines());
                if let Err(e) = validate(&info, job, start) {
                    return Attempt::Done(WorkerOutcome::Failed(e));
                }
                if !*response_sent {
                    *response_sent = true;
                    emitter.emit(WorkerEvent::Response(info));
                }
            }
            Attempt::Done(WorkerOutcome::Completed)
        }
        Err(e) if e.is_operation_timedout() => Attempt::Stalled {
            delivered: st.received,
            error: e,
        },
        Err(e) if is_interruption(&e) && st.received > 0 => {
            Attempt::Done(WorkerOutcome::Interrupted(classify_curl_error(url, &e)))
        }
        Err(e) => Attempt::Done(WorkerOutcome::Failed(classify_curl_error(url, &e))),
    }
}

fn configure(
    easy: &mut Easy,
    job: &WorkerJob,
    start: u64,
    end: Option<u64>,
) -> Result<(), curl::Error> {
    let settings = &job.settings;
    easy.url(&job.url)?;
    easy.follow_location(true)?;
    easy.max_redirections(settings.max_redirects)?;
    easy.connect_timeout(settings.connect_timeout)?;
    // Any second with less than one byte counts toward the stall timeout.
    easy.low_speed_limit(1)?;
    easy.low_speed_time(settings.stall_timeout)?;
    easy.useragent(&settings.user_agent)?;
    if let Some(referer) = &job.referer {
        easy.referer(referer)?;
    }
    if job.ranged {
        easy.range(&super::range_spec(start, end))?;
    }
    if !job.cookies.is_empty() {
        easy.cookie(&job.cookies.join("; "))?;
    }
    if !job.headers.is_empty() {
        let mut list = List::new();
        for (name, value) in &job.headers {
            list.append(&format!("{}: {}", name.trim(), value.trim()))?;
        }
        easy.http_headers(list)?;
    }
    if let Some(limit) = settings.max_recv_speed {
        easy.max_recv_speed(limit)?;
    }
    easy.progress(true)?;
    Ok(())
}

/// Reject responses that must not be written into the file.
fn validate(info: &ResponseInfo, job: &WorkerJob, start: u64) -> Result<(), DownloadError> {
    if info.status >= 400 {
        return Err(DownloadError::Http {
            url: job.url.clone(),
            status: info.status,
        });
    }
    if !(200..300).contains(&info.status) {
        return Err(DownloadError::network(
            &job.url,
            format!("unexpected HTTP status {}", info.status),
        ));
    }
    if info.is_html() {
        return Err(DownloadError::DownloadIsHtml {
            url: job.url.clone(),
        });
    }
    if job.ranged && start > 0 {
        match info.content_range {
            Some(range) if info.status == 206 && range.start == start => {}
            Some(range) if info.status == 206 => {
                return Err(DownloadError::network(
                    &job.url,
                    format!("server answered range at {} instead of {}", range.start, start),
                ));
            }
            _ => {
                return Err(DownloadError::network(&job.url, "server ignored range request"));
            }
        }
    }
    Ok(())
}

fn flush<S: DataSink>(
    st: &mut Stream,
    sink: &mut S,
    emitter: &EventEmitter,
) -> Result<(), DownloadError> {
    let data = mem::take(&mut st.buffer);
    let offset = st.buffer_offset;
    let len = data.len() as u64;
    st.buffer_offset += len;
    let synced = sink.write(offset, data)?;
    emitter.emit(WorkerEvent::Written {
        offset,
        len,
        synced,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::TransferSettings;

    fn job(ranged: bool, offset: u64) -> WorkerJob {
        WorkerJob {
            id: 1,
            url: "http://127.0.0.1/file".into(),
            offset,
            size: Some(100),
            ranged,
            headers: Vec::new(),
            cookies: Vec::new(),
            referer: None,
            settings: TransferSettings::default(),
        }
    }

    fn info(status: u32, extra: &[&str]) -> ResponseInfo {
        let mut lines = vec![format!("HTTP/1.1 {status} X")];
        lines.extend(extra.iter().map(|s| s.to_string()));
        parse_response("http://127.0.0.1/file", &lines)
    }

    #[test]
    fn validate_rejects_errors_and_html() {
        let j = job(true, 0);
        assert!(matches!(
            validate(&info(404, &[]), &j, 0),
            Err(DownloadError::Http { status: 404, .. })
        ));
        assert!(matches!(
            validate(&info(200, &["Content-Type: text/html"]), &j, 0),
            Err(DownloadError::DownloadIsHtml { .. })
        ));
        assert!(validate(&info(200, &["Content-Type: application/octet-stream"]), &j, 0).is_ok());
    }

    #[test]
    fn validate_requires_matching_range_mid_file() {
        let j = job(true, 900);
        assert!(validate(&info(200, &[]), &j, 900).is_err());
        assert!(validate(&info(206, &["Content-Range: bytes 0-99/1000"]), &j, 900).is_err());
        assert!(validate(&info(206, &["Content-Range: bytes 900-999/1000"]), &j, 900).is_ok());
    }

    #[test]
    fn unranged_request_accepts_full_body() {
        let j = job(false, 0);
        assert!(validate(&info(200, &["Content-Length: 100"]), &j, 0).is_ok());
    }

    struct VecSink(Vec<(u64, Vec<u8>)>);

    impl DataSink for VecSink {
        fn write(&mut self, offset: u64, data: Vec<u8>) -> Result<bool, DownloadError> {
            self.0.push((offset, data));
            Ok(false)
        }
    }

    #[test]
    fn flush_advances_offset_and_reports_written() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let emitter = EventEmitter::new(3, tx);
        let mut sink = VecSink(Vec::new());
        let mut st = Stream {
            buffer: b"abc".to_vec(),
            buffer_offset: 10,
            received: 3,
            validated: true,
            abort: None,
        };
        flush(&mut st, &mut sink, &emitter).unwrap();
        st.buffer.extend_from_slice(b"de");
        flush(&mut st, &mut sink, &emitter).unwrap();
        assert_eq!(sink.0, vec![(10, b"abc".to_vec()), (13, b"de".to_vec())]);
        assert!(matches!(
            rx.try_recv().unwrap().event,
            WorkerEvent::Written { offset: 10, len: 3, synced: false }
        ));
        assert!(matches!(
            rx.try_recv().unwrap().event,
            WorkerEvent::Written { offset: 13, len: 2, .. }
        ));
        emitter.finish(WorkerOutcome::Completed);
    }
}
