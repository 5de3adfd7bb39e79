//! The data model shared by every component of the loading engine: batches,
//! URL descriptors, clients and their running statistics.
//!
//! Grounded in `batch.h`, `url.h`, `client.h` and `statistics.h` of the
//! original engine, adapted to Rust ownership (no intrusive pointers, no
//! manual buffer sizing).

use std::net::IpAddr;
use std::time::Instant;

/// Application protocol of a URL, derived from its scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplType {
    Http,
    Https,
    Ftp,
    Ftps,
}

impl ApplType {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(ApplType::Http),
            "https" => Some(ApplType::Https),
            "ftp" => Some(ApplType::Ftp),
            "ftps" => Some(ApplType::Ftps),
            _ => None,
        }
    }

    pub fn is_https(self) -> bool {
        matches!(self, ApplType::Https | ApplType::Ftps)
    }

    /// Whether the transfer engine in this crate (reqwest) can actually
    /// drive this scheme. FTP/FTPS are accepted by the config loader and
    /// address-planned like any other URL but surface as a transfer error
    /// when fetched — see SPEC_FULL.md's data-model supplement.
    pub fn is_engine_supported(self) -> bool {
        matches!(self, ApplType::Http | ApplType::Https)
    }
}

/// HTTP method a URL descriptor fetches with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Post,
    Put,
}

/// The five `form_str` substitution strategies for POST bodies.
#[derive(Debug, Clone)]
pub enum FormUsage {
    UniqueUsersAndPasswords { user_base: String, password_base: String },
    UniqueUsersSamePassword { user_base: String, password: String },
    SingleUser { user: String, password: String },
    RecordsFromFile { path: String, random: bool, max_records: Option<usize> },
    AsIs,
}

/// An inclusive millisecond range; `low == high` for a fixed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsRange {
    pub low: u64,
    pub high: u64,
}

impl MsRange {
    pub fn fixed(ms: u64) -> Self {
        MsRange { low: ms, high: ms }
    }

    /// Sample a value uniformly from `[low, high]`.
    pub fn sample(&self) -> u64 {
        if self.low >= self.high {
            self.low
        } else {
            rand::Rng::gen_range(&mut rand::thread_rng(), self.low..=self.high)
        }
    }
}

/// Per-URL override of the default "4xx/5xx are errors" status table.
/// `None` entries fall back to the default (all 4xx/5xx are errors except
/// 401 and 407).
#[derive(Debug, Clone)]
pub struct StatusErrorTable {
    overrides: std::collections::HashMap<u16, bool>,
}

impl Default for StatusErrorTable {
    fn default() -> Self {
        StatusErrorTable { overrides: std::collections::HashMap::new() }
    }
}

impl StatusErrorTable {
    /// `+CODE` marks a status as an error, `-CODE` marks it as not an error.
    pub fn apply_directive(&mut self, directive: &str) -> Result<(), String> {
        let directive = directive.trim();
        if directive.is_empty() {
            return Ok(());
        }
        let (sign, rest) = directive.split_at(1);
        let code: u16 = rest
            .parse()
            .map_err(|_| format!("invalid status code in RESPONSE_STATUS_ERRORS directive '{directive}'"))?;
        match sign {
            "+" => self.overrides.insert(code, true),
            "-" => self.overrides.insert(code, false),
            _ => return Err(format!("RESPONSE_STATUS_ERRORS directive must start with + or -: '{directive}'")),
        };
        Ok(())
    }

    /// Whether `status` counts as an application error (§4.7 / §7).
    pub fn is_error(&self, status: u16) -> bool {
        if let Some(v) = self.overrides.get(&status) {
            return *v;
        }
        if status == 401 || status == 407 {
            return false;
        }
        (400..600).contains(&status)
    }
}

/// An immutable-after-load description of one URL to fetch (§3).
#[derive(Debug, Clone)]
pub struct UrlDescriptor {
    pub target: String,
    pub appl_type: ApplType,
    pub method: RequestMethod,
    pub headers: Vec<(String, String)>,
    pub form: Option<FormUsage>,
    pub form_template: Option<String>,
    pub upload_file: Option<String>,
    pub upload_size: Option<u64>,
    pub web_auth: Option<(String, String)>,
    pub proxy_auth: Option<(String, String)>,
    pub fresh_connect: bool,
    pub connect_timeout_ms: u64,
    pub completion_time_ms: MsRange,
    pub interleave_ms: MsRange,
    pub dont_cycle: bool,
    pub use_current: bool,
    pub status_errors: StatusErrorTable,
    pub transfer_limit_rate: Option<u64>,
    pub fetch_probability: u8,
    pub fetch_probability_once: bool,
    pub ftp_active: bool,
    pub log_resp_headers: bool,
    pub log_resp_bodies: bool,
}

impl UrlDescriptor {
    /// Whether this URL should be fetched at all for this call, consulting
    /// (and possibly populating) the client's per-URL decision table.
    pub fn decide_fetch(&self, url_index: usize, client: &mut Client) -> bool {
        if self.fetch_probability >= 100 {
            return true;
        }
        if self.fetch_probability_once {
            let decisions = client.url_decisions.get_or_insert_with(|| vec![-1i8; client.url_decisions_len]);
            if let Some(slot) = decisions.get_mut(url_index) {
                if *slot >= 0 {
                    return *slot == 1;
                }
                let draw = rand::Rng::gen_range(&mut rand::thread_rng(), 1..=100u8);
                let fetch = draw <= self.fetch_probability;
                *slot = fetch as i8;
                return fetch;
            }
        }
        let draw = rand::Rng::gen_range(&mut rand::thread_rng(), 1..=100u8);
        draw <= self.fetch_probability
    }
}

/// One simulated end user (§3 *Client*).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Urls,
    Error,
    FinishedOk,
}

/// The 5-state mini-FSM replacing the original's four `hdrs_*` counters
/// (§9 design note): tracks which "first header" of the current
/// request/response phase has already been observed, so each phase
/// contributes at most one counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstHeaderState {
    /// Waiting for the first outbound request header.
    AwaitingRequest,
    /// Request header seen and counted; waiting for the response.
    AwaitingResponse,
    /// A response of a given class has already been counted.
    ResponseCounted(u8),
}

impl FirstHeaderState {
    /// Advance the mini-FSM on a trace event (§4.7 / §9).
    pub fn transition_on_event(self, event: crate::trace::EventKind, status_class: Option<u8>) -> (Self, TraceAction) {
        use crate::trace::EventKind::*;
        match event {
            HeaderOut => {
                if matches!(self, FirstHeaderState::AwaitingRequest) {
                    (FirstHeaderState::AwaitingResponse, TraceAction::CountRequest)
                } else {
                    (self, TraceAction::None)
                }
            }
            DataOut | SslDataOut => (FirstHeaderState::AwaitingRequest.with_response_pending(self), TraceAction::None),
            HeaderIn => {
                let class = status_class.unwrap_or(0);
                if matches!(self, FirstHeaderState::ResponseCounted(c) if c == class) {
                    (self, TraceAction::None)
                } else {
                    (FirstHeaderState::ResponseCounted(class), TraceAction::CountResponseClass(class))
                }
            }
            DataIn | SslDataIn => (self, TraceAction::None),
            Error => (FirstHeaderState::AwaitingRequest, TraceAction::CountOtherError),
            Text => (self, TraceAction::None),
        }
    }

    /// `DATA_OUT`/`SSL_DATA_OUT` clear first-header flags but, unlike a
    /// fresh transfer, must not forget that a request has already been
    /// sent (a response is still pending).
    fn with_response_pending(self, prior: FirstHeaderState) -> Self {
        if matches!(prior, FirstHeaderState::AwaitingRequest) {
            FirstHeaderState::AwaitingRequest
        } else {
            FirstHeaderState::AwaitingResponse
        }
    }
}

/// What the trace callback should do with a statistics aggregator as a
/// result of a first-header transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceAction {
    None,
    CountRequest,
    CountResponseClass(u8),
    CountOtherError,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub index: usize,
    pub source_ip: IpAddr,
    pub name: String,
    pub cycle_num: u64,
    pub url_index: usize,
    pub state: ClientState,
    pub is_https: bool,
    pub first_header: FirstHeaderState,
    pub req_timestamp: Option<Instant>,
    pub errors_num: u64,
    pub url_decisions: Option<Vec<i8>>,
    pub url_decisions_len: usize,
    pub timer_id: Option<u64>,
    /// The URL-completion-deadline timer (§4.3) for the transfer currently
    /// attached, if any; cancelled on an in-time completion, consumed on
    /// its own firing.
    pub deadline_timer_id: Option<u64>,
    /// Bumped every time a new transfer is attached for this client, so a
    /// completion that arrives after its own deadline has already fired
    /// (and the client has moved on) can be recognized as stale and
    /// ignored — see §9 Resolved Open Question (c).
    pub transfer_generation: u64,
    pub stats: crate::statistics::StatPoint,
}

impl Client {
    pub fn new(index: usize, source_ip: IpAddr, url_count: usize) -> Self {
        Client {
            index,
            name: format!("client-{index}-{source_ip}"),
            source_ip,
            cycle_num: 0,
            url_index: 0,
            state: ClientState::Init,
            is_https: false,
            first_header: FirstHeaderState::AwaitingRequest,
            req_timestamp: None,
            errors_num: 0,
            url_decisions: None,
            url_decisions_len: url_count,
            timer_id: None,
            deadline_timer_id: None,
            transfer_generation: 0,
            stats: crate::statistics::StatPoint::default(),
        }
    }
}

/// A configuration-coherent group of simulated clients (§3 *Batch*).
pub struct Batch {
    pub name: String,
    pub client_num_max: usize,
    pub client_num_start: usize,
    pub clients_initial_inc: usize,
    pub interface: String,
    pub ipv6: bool,
    pub ip_addr_min: IpAddr,
    pub ip_addr_max: IpAddr,
    pub cidr_netmask: u8,
    pub ip_shared_num: usize,
    pub cycles_num: u64,
    pub user_agent: String,
    pub urls: Vec<UrlDescriptor>,
    pub first_cycling: Option<usize>,
    pub last_cycling: Option<usize>,
    pub error_recovery_client: bool,
}

impl Batch {
    /// Validate the cycling-region contiguity and `use_current` placement
    /// invariants from §4.5 / §6.
    pub fn validate(&self) -> Result<(), crate::errors::LoaderError> {
        if self.urls.is_empty() {
            return Err(crate::errors::LoaderError::Configuration(
                "batch has no URLs configured".into(),
            ));
        }
        if self.urls[0].use_current {
            return Err(crate::errors::LoaderError::Configuration(
                "the first URL may not have URL_USE_CURRENT set".into(),
            ));
        }
        let mut transitions = 0;
        let mut cycling_now = !self.urls[0].dont_cycle;
        for u in &self.urls[1..] {
            let cycling = !u.dont_cycle;
            if cycling != cycling_now {
                transitions += 1;
                cycling_now = cycling;
            }
        }
        if transitions > 2 {
            return Err(crate::errors::LoaderError::Configuration(
                "URL cycling region must be contiguous (at most one non-cycling\\u2192cycling and one cycling\\u2192non-cycling transition)".into(),
            ));
        }
        Ok(())
    }

    /// Compute (and cache) the `[first_cycling, last_cycling]` indices.
    pub fn cycling_region(&self) -> (Option<usize>, Option<usize>) {
        let mut first = None;
        let mut last = None;
        for (i, u) in self.urls.iter().enumerate() {
            if !u.dont_cycle {
                if first.is_none() {
                    first = Some(i);
                }
                last = Some(i);
            }
        }
        (first, last)
    }
}
