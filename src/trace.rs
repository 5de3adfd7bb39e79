//! Trace callback (C7): the single funnel every I/O phase of every transfer
//! passes through before it can affect statistics or logs.
//!
//! Grounded in `loader.c`'s `client_tracing_function`, which curl invokes
//! with a `curl_infotype` on every header/body/SSL/text event. This crate's
//! transfer engine (reqwest) doesn't expose libcurl's raw trace hook, so
//! [`EventKind`] is synthesized at the call sites in `transfer.rs` from the
//! request/response lifecycle reqwest does expose, preserving the same
//! event vocabulary and the same "count the first header of each phase
//! only" semantics described in §4.7 and encoded in
//! [`crate::model::FirstHeaderState`].

use crate::metrics;
use crate::model::{Client, TraceAction};
use crate::percentiles::{GLOBAL_REQUEST_PERCENTILES, GLOBAL_URL_PERCENTILES};
use crate::statistics::StatisticsAggregator;

/// The event vocabulary `client_tracing_function` dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    HeaderOut,
    DataOut,
    SslDataOut,
    HeaderIn,
    DataIn,
    SslDataIn,
    Error,
    Text,
}

/// Byte-counting and logging side effects that accompany a raw event,
/// gathered by the transfer engine and handed to [`handle_event`] in one
/// call per observed phase.
pub struct TraceEvent<'a> {
    pub kind: EventKind,
    pub byte_len: u64,
    pub status_class: Option<u8>,
    pub text: Option<&'a str>,
}

/// Single-character symbol for an event kind, used by `.log` lines.
/// Grounded loosely in curl's own verbose-trace prefixes (`>` outbound,
/// `<` inbound, `*` informational/SSL, `!` error).
pub fn event_symbol(kind: EventKind) -> &'static str {
    match kind {
        EventKind::HeaderOut | EventKind::DataOut => ">",
        EventKind::HeaderIn | EventKind::DataIn => "<",
        EventKind::SslDataOut | EventKind::SslDataIn => "*",
        EventKind::Error => "!",
        EventKind::Text => "-",
    }
}

/// Route one trace event through the client's first-header mini-FSM,
/// update byte/response counters (both the batch's delta bucket and the
/// client's own running tally), feed the Prometheus side channel, and
/// optionally emit a `.log` line.
///
/// `url_target` keys the per-URL percentile tracker (§4.4); pass `None` for
/// events that aren't associated with a URL (there are none today, but the
/// caller owns that decision).
///
/// Returns the rendered `.log` line, if this event is one §6 logs
/// (`-l`/per-URL `URL_LOG_RESP_HEADERS`/`URL_LOG_RESP_BODIES` govern which
/// event kinds are actually written by the caller).
pub fn handle_event(
    client: &mut Client,
    stats: &mut StatisticsAggregator,
    event: &TraceEvent<'_>,
    url_target: Option<&str>,
) -> Option<String> {
    let (new_state, action) = client.first_header.transition_on_event(event.kind, event.status_class);
    client.first_header = new_state;

    match event.kind {
        EventKind::DataOut | EventKind::SslDataOut => {
            stats.bucket_mut(client.is_https).data_out += event.byte_len;
            client.stats.data_out += event.byte_len;
            metrics::BYTES_OUT_TOTAL.inc_by(event.byte_len);
        }
        EventKind::DataIn | EventKind::SslDataIn => {
            stats.bucket_mut(client.is_https).data_in += event.byte_len;
            client.stats.data_in += event.byte_len;
            metrics::BYTES_IN_TOTAL.inc_by(event.byte_len);
        }
        _ => {}
    }

    match action {
        TraceAction::CountRequest => {
            stats.bucket_mut(client.is_https).requests += 1;
            client.stats.requests += 1;
            metrics::REQUESTS_TOTAL.inc();
            // The request-sent timestamp is recorded by the Adapter at the
            // moment it actually dispatches the request (§4.7); this
            // callback only counts the request, since by the time a
            // completed transfer's events are replayed here the real send
            // time has already passed.
        }
        TraceAction::CountResponseClass(class) => {
            stats.bucket_mut(client.is_https).count_response_class(class);
            client.stats.count_response_class(class);
            metrics::RESPONSE_CLASSES_TOTAL.with_label_values(&[&class.to_string()]).inc();
            // §4.7: application delay is the response-first-header timestamp
            // minus the request-sent timestamp, folded into the running mean
            // (and, for 2xx, into the 2xx-only mean as well).
            if let Some(sent) = client.req_timestamp {
                let delay_ms = sent.elapsed().as_secs_f64() * 1000.0;
                let bucket = stats.bucket_mut(client.is_https);
                bucket.appl_delay.add(delay_ms);
                client.stats.appl_delay.add(delay_ms);
                if class == 2 {
                    bucket.appl_delay_2xx.add(delay_ms);
                    client.stats.appl_delay_2xx.add(delay_ms);
                }
                let delay_ms_rounded = delay_ms.round().max(0.0) as u64;
                GLOBAL_REQUEST_PERCENTILES.record_ms(delay_ms_rounded);
                GLOBAL_URL_PERCENTILES.record(url_target.unwrap_or("unknown"), delay_ms_rounded);
            }
        }
        TraceAction::CountOtherError => {
            stats.bucket_mut(client.is_https).other_errors += 1;
            client.stats.other_errors += 1;
        }
        TraceAction::None => {}
    }

    match event.kind {
        EventKind::HeaderIn | EventKind::HeaderOut => event.text.map(|t| format!("{:?} {}", event.kind, t.trim_end())),
        EventKind::Text => event.text.map(|t| t.trim_end().to_string()),
        _ => None,
    }
}
