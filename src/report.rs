//! Report writers for the three file kinds §6 requires: `<batch>.log`
//! (trace lines), `<batch>.txt` (periodic statistics snapshots) and
//! `<batch>.ctx` (per-client end-of-run dump).
//!
//! Grounded in `loader.c`'s `rewind_logfile_above_maxsize` (log rewinding)
//! and `statistics.h`'s column layout / `client.h`'s dump fields, adapted
//! to Rust `std::fs` instead of `FILE*`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};

use tracing::warn;

use crate::model::{Client, ClientState};
use crate::statistics::{combine, StatPoint};

/// Matches `loader.c`'s megabyte-denominated `logfile_rewind_size`.
pub const DEFAULT_LOG_REWIND_BYTES: u64 = 10 * 1024 * 1024;

/// Writer for `<batch>.log`: one line per trace event that reaches it,
/// rewound in place once it exceeds [`DEFAULT_LOG_REWIND_BYTES`] so a
/// long-running batch doesn't grow the file without bound.
///
/// Per §7, "log writes are best-effort; a failure to write to the log does
/// not abort the loop" — every fallible operation here is swallowed and
/// logged via `tracing::warn!` rather than propagated.
pub struct LogWriter {
    file: BufWriter<File>,
    rewind_bytes: u64,
}

impl LogWriter {
    pub fn create(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        Ok(LogWriter { file: BufWriter::new(file), rewind_bytes: DEFAULT_LOG_REWIND_BYTES })
    }

    pub fn with_rewind_bytes(mut self, bytes: u64) -> Self {
        self.rewind_bytes = bytes;
        self
    }

    /// `<cycle> <client-name> <symbol> <message>: eff-url: <u1>, url: <u2>`
    pub fn write_line(&mut self, cycle: u64, client_name: &str, symbol: &str, message: &str, eff_url: &str, url: &str) {
        let line = format!("{cycle} {client_name} {symbol} {message}: eff-url: {eff_url}, url: {url}\n");
        if let Err(e) = self.file.write_all(line.as_bytes()) {
            warn!(error = %e, "failed to write .log line");
            return;
        }
        self.maybe_rewind();
    }

    fn maybe_rewind(&mut self) {
        let _ = self.file.flush();
        let position = match self.file.get_ref().stream_position() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to read .log file position");
                return;
            }
        };
        if position <= self.rewind_bytes {
            return;
        }
        if let Err(e) = self.file.get_mut().seek(SeekFrom::Start(0)) {
            warn!(error = %e, "failed to rewind .log file");
            return;
        }
        if let Err(e) = self.file.get_mut().set_len(0) {
            warn!(error = %e, "failed to truncate .log file after rewind");
        }
    }
}

/// Column header for `<batch>.txt`, matching §4.4 exactly.
pub const STATS_HEADER: &str = "Run-Time,Appl,Clients,Req,2xx,3xx,4xx,5xx,Err,Delay,Delay-2xx,Thr-In,Thr-Out";

/// Writer for `<batch>.txt`: a header, one row per snapshot interval per
/// protocol bucket, an all-asterisks footer row, then the final cumulative
/// rows.
pub struct StatsFileWriter {
    file: BufWriter<File>,
}

impl StatsFileWriter {
    pub fn create(path: &str) -> std::io::Result<Self> {
        let mut file = BufWriter::new(OpenOptions::new().create(true).write(true).truncate(true).open(path)?);
        writeln!(file, "{STATS_HEADER}")?;
        Ok(StatsFileWriter { file })
    }

    /// One row for one protocol bucket (`"HTTP"`, `"HTTPS"`, or `"TOTAL"`)
    /// over `interval_secs`; throughput columns are bytes/second.
    pub fn write_row(&mut self, run_time_secs: u64, appl: &str, clients: usize, point: &StatPoint, interval_secs: f64) {
        let thr_in = if interval_secs > 0.0 { point.data_in as f64 / interval_secs } else { 0.0 };
        let thr_out = if interval_secs > 0.0 { point.data_out as f64 / interval_secs } else { 0.0 };
        let errors = point.resp_4xx + point.resp_5xx + point.other_errors;
        let line = format!(
            "{run_time_secs},{appl},{clients},{req},{r2},{r3},{r4},{r5},{err},{delay:.2},{delay2:.2},{thr_in:.2},{thr_out:.2}",
            run_time_secs = run_time_secs,
            appl = appl,
            clients = clients,
            req = point.requests,
            r2 = point.resp_2xx,
            r3 = point.resp_3xx,
            r4 = point.resp_4xx,
            r5 = point.resp_5xx,
            err = errors,
            delay = point.appl_delay.mean_ms,
            delay2 = point.appl_delay_2xx.mean_ms,
            thr_in = thr_in,
            thr_out = thr_out,
        );
        if let Err(e) = writeln!(self.file, "{line}") {
            warn!(error = %e, "failed to write .txt snapshot row");
        }
    }

    /// Writes one row for the combined HTTP+HTTPS bucket, the convenience
    /// the Loading Loop calls at each snapshot tick.
    pub fn write_combined_row(&mut self, run_time_secs: u64, clients: usize, http: &StatPoint, https: &StatPoint, interval_secs: f64) {
        self.write_row(run_time_secs, "HTTP", clients, http, interval_secs);
        self.write_row(run_time_secs, "HTTPS", clients, https, interval_secs);
        let total = combine(http, https);
        self.write_row(run_time_secs, "TOTAL", clients, &total, interval_secs);
    }

    /// A footer row of all-asterisks separating per-interval rows from the
    /// final cumulative rows (§6).
    pub fn write_footer(&mut self) {
        let cols = STATS_HEADER.split(',').count();
        let footer = std::iter::repeat("*").take(cols).collect::<Vec<_>>().join(",");
        if let Err(e) = writeln!(self.file, "{footer}") {
            warn!(error = %e, "failed to write .txt footer row");
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.file.flush() {
            warn!(error = %e, "failed to flush .txt file");
        }
    }
}

fn state_label(state: &ClientState) -> &'static str {
    match state {
        ClientState::Init => "INIT",
        ClientState::Urls => "URLS",
        ClientState::Error => "ERROR",
        ClientState::FinishedOk => "FINISHED_OK",
    }
}

/// Writes `<batch>.ctx`: one comma-separated line per client, in client
/// index order, with cycles, state, bytes in/out, requests, response
/// classes and other-errors — the end-of-run dump §6 requires.
pub fn write_ctx_dump(path: &str, clients: &[Client]) -> std::io::Result<()> {
    let mut file = BufWriter::new(OpenOptions::new().create(true).write(true).truncate(true).open(path)?);
    writeln!(file, "client,cycles,state,bytes_in,bytes_out,requests,3xx,2xx,4xx,5xx,other_errors")?;
    for client in clients {
        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{},{},{}",
            client.name,
            client.cycle_num,
            state_label(&client.state),
            client.stats.data_in,
            client.stats.data_out,
            client.stats.requests,
            client.stats.resp_3xx,
            client.stats.resp_2xx,
            client.stats.resp_4xx,
            client.stats.resp_5xx,
            client.stats.other_errors,
        )?;
    }
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn log_writer_renders_the_spec_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.log");
        let mut w = LogWriter::create(path.to_str().unwrap()).unwrap();
        w.write_line(3, "client-0-10.0.0.1", "<", "HEADER_IN", "http://x/a", "http://x/a");
        drop(w);
        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "3 client-0-10.0.0.1 < HEADER_IN: eff-url: http://x/a, url: http://x/a\n");
    }

    #[test]
    fn log_writer_rewinds_once_past_the_configured_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.log");
        let mut w = LogWriter::create(path.to_str().unwrap()).unwrap().with_rewind_bytes(32);
        for _ in 0..10 {
            w.write_line(1, "c", "<", "HEADER_IN", "u", "u");
        }
        drop(w);
        let size = std::fs::metadata(&path).unwrap().len();
        assert!(size <= 64, "log file grew past its rewind cap: {size} bytes");
    }

    #[test]
    fn stats_file_has_header_rows_and_asterisk_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.txt");
        let mut w = StatsFileWriter::create(path.to_str().unwrap()).unwrap();
        let mut point = StatPoint::default();
        point.requests = 5;
        point.resp_2xx = 5;
        point.data_in = 1000;
        point.data_out = 200;
        w.write_combined_row(2, 1, &point, &StatPoint::default(), 2.0);
        w.write_footer();
        w.flush();
        drop(w);
        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], STATS_HEADER);
        assert!(lines.iter().any(|l| l.starts_with("2,HTTP,1,5,5,0,0,0,0")));
        assert!(lines.last().unwrap().chars().all(|c| c == '*' || c == ','));
    }

    #[test]
    fn ctx_dump_contains_one_line_per_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.ctx");
        let mut c0 = Client::new(0, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1);
        c0.stats.requests = 3;
        c0.stats.resp_2xx = 3;
        c0.state = ClientState::FinishedOk;
        let c1 = Client::new(1, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 1);
        write_ctx_dump(path.to_str().unwrap(), &[c0, c1]).unwrap();
        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents.lines().count(), 3); // header + 2 clients
        assert!(contents.contains("FINISHED_OK"));
    }
}
