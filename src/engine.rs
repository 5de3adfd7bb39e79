//! Loading Loop (C8): the single cooperative driver that ties every other
//! component together for one batch.
//!
//! Grounded in `user_activity_smooth`/`add_loading_clients`/
//! `mget_url_smooth` of `loader_smooth.c`: initial gradual admission of
//! `clients_initial_inc` clients per second, then a loop that keeps running
//! while any client is active, ramp-up is still pending, or the timer
//! queue is non-empty.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::address_planner::AddressPlanner;
use crate::client::ClientConfig;
use crate::fsm::{advance, Scheduling};
use crate::model::{Batch, Client, ClientState};
use crate::statistics::StatisticsAggregator;
use crate::timer_queue::{Disposition, TimerQueue, TimerTag, MIN_TIMER_PERIOD_MS};
use crate::metrics;
use crate::report::{LogWriter, StatsFileWriter};
use crate::trace::{event_symbol, handle_event};
use crate::transfer::{synthesize_trace_events, TransferEngine, TransferHandle};

/// Periodic housekeeping intervals (§4.8), all subject to the 20ms floor.
const LOG_REWIND_PERIOD_MS: u64 = 60_000;
const SCREEN_INPUT_PERIOD_MS: u64 = 500;
const RAMP_UP_PERIOD_MS: u64 = 1_000;
const SNAPSHOT_PERIOD_MS: u64 = 2_000;

/// A clonable handle used to request a cooperative shutdown (SIGINT per
/// §9's explicit config + shared atomic flag redesign, replacing a module
/// global).
#[derive(Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic milliseconds since the loop started (the unit every timer
/// deadline and client bookkeeping field is expressed in).
fn now_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

pub struct LoadingLoop {
    batch: Batch,
    clients: Vec<Client>,
    timers: TimerQueue,
    stats: StatisticsAggregator,
    transfer: TransferEngine,
    stop: StopFlag,
    clients_initial_running_num: usize,
    do_client_num_gradual_increase: bool,
    start: Instant,
    log_writer: Option<LogWriter>,
    stats_writer: Option<StatsFileWriter>,
    snapshot_interval_ms: u64,
    log_urls: bool,
}

impl LoadingLoop {
    pub fn new(batch: Batch, client_config: ClientConfig, stop: StopFlag) -> Result<Self, crate::errors::LoaderError> {
        batch.validate()?;
        let planner = AddressPlanner::new(batch.ip_addr_min, batch.ip_addr_max, batch.ip_shared_num)?;
        let addresses = planner.plan(batch.client_num_max)?;
        let clients = addresses
            .into_iter()
            .enumerate()
            .map(|(i, ip)| new_client(i, ip, batch.urls.len()))
            .collect();

        let stats = StatisticsAggregator::new(batch.urls.len());
        let transfer = TransferEngine::init(client_config)?;

        Ok(LoadingLoop {
            batch,
            clients,
            timers: TimerQueue::new(),
            stats,
            transfer,
            stop,
            clients_initial_running_num: 0,
            do_client_num_gradual_increase: true,
            start: Instant::now(),
            log_writer: None,
            stats_writer: None,
            snapshot_interval_ms: SNAPSHOT_PERIOD_MS,
            log_urls: true,
        })
    }

    /// Attach the `<batch>.log` trace writer (§6). Best-effort by design:
    /// a batch with no writer attached simply skips trace-line logging.
    pub fn with_log_writer(mut self, writer: LogWriter) -> Self {
        self.log_writer = Some(writer);
        self
    }

    /// Whether `eff-url`/`url` fields in `.log` lines carry the real
    /// target or a redacted placeholder (the `-u` flag, §6).
    pub fn with_log_urls(mut self, log_urls: bool) -> Self {
        self.log_urls = log_urls;
        self
    }

    /// Attach the `<batch>.txt` statistics snapshot writer (§6).
    pub fn with_stats_writer(mut self, writer: StatsFileWriter) -> Self {
        self.stats_writer = Some(writer);
        self
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    pub fn batch_name(&self) -> &str {
        &self.batch.name
    }

    /// `run()`: drives the batch to completion (every client `FINISHED_OK`
    /// or `ERROR`-terminal, the ramp-up complete, and the timer queue
    /// drained), or until the stop flag is set.
    pub async fn run(&mut self) -> Result<(), crate::errors::LoaderError> {
        self.install_housekeeping_timers();
        self.add_loading_clients()?;

        while self.active_clients() > 0 || self.do_client_num_gradual_increase || !self.timers.empty() {
            if self.stop.is_stopped() {
                info!("stop requested, aborting in-flight transfers");
                self.transfer.shutdown();
                break;
            }

            if self.active_clients() == 0 && self.do_client_num_gradual_increase {
                self.add_loading_clients_cont()?;
            }

            self.drive_once().await?;
        }

        self.stats.merge_delta_into_total();
        self.write_final_snapshot();
        Ok(())
    }

    /// Writes the last delta snapshot, the asterisk footer, and the
    /// cumulative total rows §6's `<batch>.txt` ends with.
    fn write_final_snapshot(&mut self) {
        let Some(writer) = self.stats_writer.as_mut() else { return };
        let run_time_secs = self.start.elapsed().as_secs();
        let clients = self.active_clients();
        writer.write_footer();
        writer.write_combined_row(run_time_secs, clients, &self.stats.http_total, &self.stats.https_total, run_time_secs.max(1) as f64);
        writer.flush();
    }

    fn active_clients(&self) -> usize {
        self.clients
            .iter()
            .filter(|c| !matches!(c.state, ClientState::FinishedOk))
            .count()
    }

    fn install_housekeeping_timers(&mut self) {
        let _ = self.timers.schedule(LOG_REWIND_PERIOD_MS, LOG_REWIND_PERIOD_MS, TimerTag::LogRewind);
        let _ = self.timers.schedule(SCREEN_INPUT_PERIOD_MS, SCREEN_INPUT_PERIOD_MS, TimerTag::ScreenInput);
        let _ = self.timers.schedule(RAMP_UP_PERIOD_MS, RAMP_UP_PERIOD_MS, TimerTag::RampUp);
        debug_assert!(MIN_TIMER_PERIOD_MS <= SCREEN_INPUT_PERIOD_MS);
    }

    /// `add_loading_clients()`: admit the next batch of clients into
    /// `ClientState::Urls`, sized by `clients_initial_inc` (0 means admit
    /// everyone at once).
    fn add_loading_clients(&mut self) -> Result<(), crate::errors::LoaderError> {
        if self.batch.client_num_max <= self.clients_initial_running_num {
            self.do_client_num_gradual_increase = false;
            return Ok(());
        }

        let clients_sched = if self.batch.clients_initial_inc > 0 {
            self.batch
                .clients_initial_inc
                .min(self.batch.client_num_max - self.clients_initial_running_num)
        } else {
            self.batch.client_num_max
        };

        self.do_client_num_gradual_increase = false;

        for i in self.clients_initial_running_num..self.clients_initial_running_num + clients_sched {
            self.admit_client(i)?;
        }

        if self.batch.clients_initial_inc > 0 {
            self.clients_initial_running_num += clients_sched;
            if self.clients_initial_running_num < self.batch.client_num_max {
                self.do_client_num_gradual_increase = true;
            }
        }

        Ok(())
    }

    /// `add_loading_clients_cont()`: called once the ramp-up timer fires
    /// (driven by [`TimerTag::RampUp`] in [`dispatch_timers`]).
    fn add_loading_clients_cont(&mut self) -> Result<(), crate::errors::LoaderError> {
        self.add_loading_clients()
    }

    fn admit_client(&mut self, index: usize) -> Result<(), crate::errors::LoaderError> {
        let now = now_ms(self.start);
        let client = &mut self.clients[index];
        let sched = advance(&self.batch, client);
        self.stats.op_init_count_inc(client.url_index);
        self.dispatch_scheduling(index, sched, now)
    }

    fn dispatch_scheduling(&mut self, client_index: usize, sched: Scheduling, now: u64) -> Result<(), crate::errors::LoaderError> {
        match sched {
            Scheduling::Now => self.attach_client(client_index),
            Scheduling::After { delay_ms } => {
                let id = self.timers.schedule(now + delay_ms, 0, TimerTag::ClientInterleave { client_index })?;
                self.clients[client_index].timer_id = Some(id);
                Ok(())
            }
            Scheduling::Terminal => Ok(()),
        }
    }

    fn attach_client(&mut self, client_index: usize) -> Result<(), crate::errors::LoaderError> {
        let client = &self.clients[client_index];
        if matches!(client.state, ClientState::FinishedOk) {
            return Ok(());
        }
        let url_index = client.url_index;
        let Some(url) = self.batch.urls.get(url_index) else {
            return Ok(());
        };
        if !url.decide_fetch(url_index, &mut self.clients[client_index]) {
            // URL_FETCH_PROBABILITY skipped this call; advance again as if
            // it had completed successfully, without attaching a transfer.
            let now = now_ms(self.start);
            let sched = advance(&self.batch, &mut self.clients[client_index]);
            return self.dispatch_scheduling(client_index, sched, now);
        }
        let source_ip = client.source_ip;
        let is_https = url.appl_type.is_https();
        let completion_deadline_ms = url.completion_time_ms.sample();
        self.clients[client_index].is_https = is_https;
        self.clients[client_index].req_timestamp = Some(Instant::now());
        self.clients[client_index].transfer_generation += 1;
        let generation = self.clients[client_index].transfer_generation;
        let handle = TransferHandle { client_index, url_index, generation };
        self.transfer.attach(handle, url, source_ip);
        metrics::CONCURRENT_CLIENTS.inc();

        if completion_deadline_ms > 0 {
            let now = now_ms(self.start);
            let id = self
                .timers
                .schedule(now + completion_deadline_ms, 0, TimerTag::UrlDeadline { client_index })?;
            self.clients[client_index].deadline_timer_id = Some(id);
        }
        Ok(())
    }

    /// `drive_once()`: one pass of dispatching due timers, progressing
    /// in-flight transfers, and snapshotting statistics. Per §9 Resolved
    /// Open Question (c), timers are dispatched *before* completions are
    /// drained in the same tick, so a URL whose deadline and whose
    /// completion land in the same tick is resolved as a timeout rather
    /// than a late success.
    async fn drive_once(&mut self) -> Result<(), crate::errors::LoaderError> {
        let now = now_ms(self.start);
        self.dispatch_timers(now)?;

        let wait = self.compute_wait_bound();
        if let Some(outcome) = self.transfer.wait_for_next(wait).await {
            self.handle_completion(outcome)?;
        }
        for outcome in self.transfer.collect_completions().await {
            self.handle_completion(outcome)?;
        }

        let now = now_ms(self.start);
        if now.saturating_sub(self.stats.last_snapshot_ms) >= self.snapshot_interval_ms {
            let interval_secs = (now.saturating_sub(self.stats.last_snapshot_ms)).max(1) as f64 / 1000.0;
            if let Some(writer) = self.stats_writer.as_mut() {
                let run_time_secs = now / 1000;
                let clients = self.active_clients();
                writer.write_combined_row(run_time_secs, clients, &self.stats.http_delta, &self.stats.https_delta, interval_secs);
                writer.flush();
            }
            self.stats.merge_delta_into_total();
            self.stats.last_snapshot_ms = now;
        }

        Ok(())
    }

    /// The bounded wait §4.8 describes: never block longer than the
    /// nearest timer deadline, and never less than the timer resolution
    /// floor so housekeeping timers don't starve the transfer engine.
    fn compute_wait_bound(&self) -> Duration {
        let now = now_ms(self.start);
        match self.timers.ms_to_nearest() {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(now);
                Duration::from_millis(remaining.max(1))
            }
            None => Duration::from_millis(MIN_TIMER_PERIOD_MS),
        }
    }

    fn handle_completion(&mut self, outcome: crate::transfer::TransferOutcome) -> Result<(), crate::errors::LoaderError> {
        let client_index = outcome.handle.client_index;
        let Some(client) = self.clients.get_mut(client_index) else {
            return Ok(());
        };
        if outcome.handle.generation != client.transfer_generation {
            // Arrived after its own deadline already fired and moved the
            // client on (or after the client was reattached for a newer
            // URL); §9 Resolved Open Question (c) treats the deadline as
            // authoritative, so this stale result is dropped.
            return Ok(());
        }
        if let Some(id) = client.deadline_timer_id.take() {
            let _ = self.timers.cancel(id);
        }
        metrics::CONCURRENT_CLIENTS.dec();

        if let Some(err) = &outcome.error {
            let category = match err {
                crate::errors::LoaderError::Timeout(_) => "timeout_error",
                crate::errors::LoaderError::Transfer(_) => "network_error",
                _ => "other_error",
            };
            metrics::TRANSFER_ERRORS_TOTAL.with_label_values(&[category]).inc();
        }

        let url_target = self.batch.urls.get(outcome.handle.url_index).map(|u| u.target.as_str()).unwrap_or("");
        let logged_url = if self.log_urls { url_target } else { "-" };
        let cycle_num = client.cycle_num;
        let client_name = client.name.clone();
        for event in synthesize_trace_events(&outcome) {
            let symbol = event_symbol(event.kind);
            if let Some(message) = handle_event(client, &mut self.stats, &event, Some(url_target)) {
                if let Some(writer) = self.log_writer.as_mut() {
                    writer.write_line(cycle_num, &client_name, symbol, &message, logged_url, logged_url);
                }
            }
        }

        let prev_state = client.state.clone();
        let prev_url_index = client.url_index;

        let status_is_error = match outcome.status_code {
            Some(code) => self
                .batch
                .urls
                .get(outcome.handle.url_index)
                .map(|u| u.status_errors.is_error(code))
                .unwrap_or(false),
            None => false,
        };

        if outcome.error.is_some() || status_is_error {
            client.state = ClientState::Error;
            client.errors_num += 1;
        }

        let sched = advance(&self.batch, client);
        self.stats.op_update(&prev_state, &client.state, prev_url_index);

        let now = now_ms(self.start);
        self.dispatch_scheduling(client_index, sched, now)
    }

    fn dispatch_timers(&mut self, now: u64) -> Result<(), crate::errors::LoaderError> {
        let mut to_attach = Vec::new();
        let mut to_timeout = Vec::new();
        let mut ramp_up_due = false;

        self.timers.dispatch_due(now, |node| {
            match node.tag {
                TimerTag::ClientInterleave { client_index } => to_attach.push(client_index),
                TimerTag::UrlDeadline { client_index } => to_timeout.push(client_index),
                TimerTag::RampUp => ramp_up_due = true,
                TimerTag::LogRewind => {
                    debug!("log rewind tick");
                }
                TimerTag::ScreenInput => {}
            }
            Disposition::Continue
        });

        for client_index in to_timeout {
            self.handle_url_timeout(client_index)?;
        }

        for client_index in to_attach {
            self.attach_client(client_index)?;
        }

        if ramp_up_due && self.do_client_num_gradual_increase {
            self.add_loading_clients_cont()?;
        }

        Ok(())
    }

    /// A URL-completion deadline fired before the transfer completed:
    /// treat it as a timeout error and advance the client immediately, so
    /// a same-tick completion arriving afterwards is recognized as stale
    /// by its now-outdated `transfer_generation` (§9 Resolved Open
    /// Question (c)).
    fn handle_url_timeout(&mut self, client_index: usize) -> Result<(), crate::errors::LoaderError> {
        let Some(client) = self.clients.get_mut(client_index) else {
            return Ok(());
        };
        client.deadline_timer_id = None;
        client.transfer_generation += 1;
        client.errors_num += 1;
        metrics::CONCURRENT_CLIENTS.dec();
        metrics::TRANSFER_ERRORS_TOTAL.with_label_values(&["timeout_error"]).inc();

        let prev_state = client.state.clone();
        let prev_url_index = client.url_index;
        client.state = ClientState::Error;

        let sched = advance(&self.batch, client);
        self.stats.op_update(&prev_state, &client.state, prev_url_index);

        let now = now_ms(self.start);
        self.dispatch_scheduling(client_index, sched, now)
    }

    pub fn stats(&self) -> &StatisticsAggregator {
        &self.stats
    }
}

fn new_client(index: usize, source_ip: IpAddr, url_count: usize) -> Client {
    Client::new(index, source_ip, url_count)
}
