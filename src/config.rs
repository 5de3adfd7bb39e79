//! Config Loader (§4.10): parses the `KEY=VALUE` batch configuration file
//! into the `Batch`/`UrlDescriptor` data model the rest of the engine
//! consumes.
//!
//! Grounded in the teacher's `Config::from_env`/`Config::validate`/
//! `Config::print_summary` shape (validate-then-summarize), adapted to
//! read a file line-by-line instead of the environment, per §6's
//! external-interface contract. Unknown keys are logged via
//! `tracing::warn!` and ignored, matching the original parser's tolerance
//! for unrecognized directives in later format revisions.

use std::fs;
use std::net::IpAddr;

use thiserror::Error;
use tracing::warn;

use crate::model::{ApplType, Batch, FormUsage, MsRange, RequestMethod, StatusErrorTable, UrlDescriptor};

/// Errors raised while reading and validating a batch configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("line {line}: missing required key {key}")]
    MissingKey { line: usize, key: String },

    #[error("line {line}: invalid value for {key}: {message}")]
    InvalidValue { line: usize, key: String, message: String },

    #[error("batch is missing required key {0}")]
    MissingBatchKey(String),

    #[error(transparent)]
    Loader(#[from] crate::errors::LoaderError),
}

/// One `KEY=VALUE` line, with comments stripped and quoted values unwrapped.
struct Line {
    number: usize,
    key: String,
    value: String,
}

fn parse_lines(contents: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    for (idx, raw) in contents.lines().enumerate() {
        let number = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(eq_pos) = trimmed.find('=') else { continue };
        let key = trimmed[..eq_pos].trim().to_ascii_uppercase();
        let rest = trimmed[eq_pos + 1..].trim();
        let value = strip_value(rest);
        if key.is_empty() {
            continue;
        }
        lines.push(Line { number, key, value });
    }
    lines
}

/// Quoted values (`"..."`) preserve inner whitespace and `#`; unquoted
/// values are cut at the first `#` (a trailing comment) and trimmed.
fn strip_value(rest: &str) -> String {
    if let Some(stripped) = rest.strip_prefix('"') {
        if let Some(end) = stripped.find('"') {
            return stripped[..end].to_string();
        }
        return stripped.to_string();
    }
    match rest.find('#') {
        Some(pos) => rest[..pos].trim().to_string(),
        None => rest.trim().to_string(),
    }
}

/// Builder for one URL section, accumulating `HEADER`/`RESPONSE_STATUS_ERRORS`
/// repeats before being finalized into a [`UrlDescriptor`].
#[derive(Default)]
struct RawUrl {
    target: Option<String>,
    dont_cycle: bool,
    use_current: bool,
    headers: Vec<(String, String)>,
    method: Option<RequestMethod>,
    username: Option<String>,
    password: Option<String>,
    form_usage_type: Option<String>,
    form_string: Option<String>,
    form_records_file: Option<String>,
    form_records_random: bool,
    form_records_file_max_num: Option<usize>,
    upload_file: Option<String>,
    web_auth: Option<(String, String)>,
    proxy_auth: Option<(String, String)>,
    fresh_connect: bool,
    connect_timeout_ms: u64,
    completion_time_ms: Option<MsRange>,
    interleave_ms: Option<MsRange>,
    ftp_active: bool,
    log_resp_headers: bool,
    log_resp_bodies: bool,
    status_error_directives: Vec<String>,
    transfer_limit_rate: Option<u64>,
    fetch_probability: u8,
    fetch_probability_once: bool,
}

impl RawUrl {
    fn finish(self, line: usize) -> Result<UrlDescriptor, ConfigError> {
        let target = self.target.ok_or(ConfigError::MissingKey { line, key: "URL".into() })?;
        let scheme = target.split("://").next().unwrap_or("");
        let appl_type = ApplType::from_scheme(scheme).ok_or_else(|| ConfigError::InvalidValue {
            line,
            key: "URL".into(),
            message: format!("unrecognized scheme in '{target}'"),
        })?;

        let mut status_errors = StatusErrorTable::default();
        for directive in &self.status_error_directives {
            status_errors
                .apply_directive(directive)
                .map_err(|message| ConfigError::InvalidValue { line, key: "RESPONSE_STATUS_ERRORS".into(), message })?;
        }

        let form = self.form_usage_type.as_deref().map(|kind| match kind {
            "UNIQUE_USERS_AND_PASSWORDS" => FormUsage::UniqueUsersAndPasswords {
                user_base: self.username.clone().unwrap_or_default(),
                password_base: self.password.clone().unwrap_or_default(),
            },
            "UNIQUE_USERS_SAME_PASSWORD" => FormUsage::UniqueUsersSamePassword {
                user_base: self.username.clone().unwrap_or_default(),
                password: self.password.clone().unwrap_or_default(),
            },
            "RECORDS_FROM_FILE" => FormUsage::RecordsFromFile {
                path: self.form_records_file.clone().unwrap_or_default(),
                random: self.form_records_random,
                max_records: self.form_records_file_max_num,
            },
            "AS_IS" => FormUsage::AsIs,
            _ => FormUsage::SingleUser {
                user: self.username.clone().unwrap_or_default(),
                password: self.password.clone().unwrap_or_default(),
            },
        });

        Ok(UrlDescriptor {
            target,
            appl_type,
            method: self.method.unwrap_or(RequestMethod::Get),
            headers: self.headers,
            form,
            form_template: self.form_string,
            upload_file: self.upload_file,
            upload_size: None,
            web_auth: self.web_auth,
            proxy_auth: self.proxy_auth,
            fresh_connect: self.fresh_connect,
            connect_timeout_ms: if self.connect_timeout_ms > 0 { self.connect_timeout_ms } else { 30_000 },
            completion_time_ms: self.completion_time_ms.unwrap_or(MsRange::fixed(0)),
            interleave_ms: self.interleave_ms.unwrap_or(MsRange::fixed(0)),
            dont_cycle: self.dont_cycle,
            use_current: self.use_current,
            status_errors,
            transfer_limit_rate: self.transfer_limit_rate,
            fetch_probability: if self.fetch_probability > 0 { self.fetch_probability } else { 100 },
            fetch_probability_once: self.fetch_probability_once,
            ftp_active: self.ftp_active,
            log_resp_headers: self.log_resp_headers,
            log_resp_bodies: self.log_resp_bodies,
        })
    }
}

/// Parses a millisecond value or a `low-high` millisecond range.
fn parse_ms_range(line: usize, key: &str, value: &str) -> Result<MsRange, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue { line, key: key.into(), message };
    if let Some((low, high)) = value.split_once('-') {
        let low: u64 = low.trim().parse().map_err(|_| invalid(format!("invalid low bound '{low}'")))?;
        let high: u64 = high.trim().parse().map_err(|_| invalid(format!("invalid high bound '{high}'")))?;
        if low > high {
            return Err(invalid(format!("low bound {low} exceeds high bound {high}")));
        }
        Ok(MsRange { low, high })
    } else {
        let ms: u64 = value.parse().map_err(|_| invalid(format!("'{value}' is not a number or a range")))?;
        Ok(MsRange::fixed(ms))
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_uppercase().as_str(), "1" | "TRUE" | "YES" | "ON")
}

/// `load(path) -> Result<Batch, ConfigError>`. Reads the general section
/// and every `URL` block in file order, validating cross-field invariants
/// via [`Batch::validate`].
pub fn load(path: &str) -> Result<Batch, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.into(), source })?;
    let lines = parse_lines(&contents);

    let mut name: Option<String> = None;
    let mut client_num_max: Option<usize> = None;
    let mut client_num_start: Option<usize> = None;
    let mut clients_initial_inc: usize = 0;
    let mut interface: Option<String> = None;
    let mut netmask: u8 = 32;
    let mut ip_addr_min: Option<IpAddr> = None;
    let mut ip_addr_max: Option<IpAddr> = None;
    let mut ip_shared_num: usize = 1;
    let mut cycles_num: u64 = 1;
    let mut user_agent = "smoothloader/0.1".to_string();
    let mut error_recovery_client = false;

    let mut urls: Vec<UrlDescriptor> = Vec::new();
    let mut current: Option<(RawUrl, usize)> = None;

    for line in &lines {
        match line.key.as_str() {
            "BATCH_NAME" => name = Some(line.value.clone()),
            "CLIENTS_NUM_MAX" => {
                client_num_max = Some(line.value.parse().map_err(|_| ConfigError::InvalidValue {
                    line: line.number,
                    key: line.key.clone(),
                    message: "expected a positive integer".into(),
                })?)
            }
            "CLIENTS_NUM_START" => {
                client_num_start = Some(line.value.parse().map_err(|_| ConfigError::InvalidValue {
                    line: line.number,
                    key: line.key.clone(),
                    message: "expected a positive integer".into(),
                })?)
            }
            "CLIENTS_RAMPUP_INC" => {
                clients_initial_inc = line.value.parse().map_err(|_| ConfigError::InvalidValue {
                    line: line.number,
                    key: line.key.clone(),
                    message: "expected a non-negative integer".into(),
                })?
            }
            "INTERFACE" => interface = Some(line.value.clone()),
            "NETMASK" => netmask = parse_netmask(line.number, &line.value)?,
            "IP_ADDR_MIN" => {
                ip_addr_min = Some(line.value.parse().map_err(|_| ConfigError::InvalidValue {
                    line: line.number,
                    key: line.key.clone(),
                    message: format!("'{}' is not a valid IP address", line.value),
                })?)
            }
            "IP_ADDR_MAX" => {
                ip_addr_max = Some(line.value.parse().map_err(|_| ConfigError::InvalidValue {
                    line: line.number,
                    key: line.key.clone(),
                    message: format!("'{}' is not a valid IP address", line.value),
                })?)
            }
            "IP_SHARED_NUM" => {
                ip_shared_num = line.value.parse().map_err(|_| ConfigError::InvalidValue {
                    line: line.number,
                    key: line.key.clone(),
                    message: "expected a positive integer".into(),
                })?
            }
            "CYCLES_NUM" => {
                let raw: i64 = line.value.parse().map_err(|_| ConfigError::InvalidValue {
                    line: line.number,
                    key: line.key.clone(),
                    message: "expected an integer".into(),
                })?;
                // §6: zero or negative means effectively unbounded.
                cycles_num = if raw <= 0 { 0 } else { raw as u64 };
            }
            "USER_AGENT" => user_agent = line.value.clone(),
            "URLS_NUM" => {} // advisory only; the loader counts URL blocks itself
            "ERROR_RECOVERY_CLIENT" => error_recovery_client = parse_bool(&line.value),

            "URL" => {
                if let Some((raw, prev_line)) = current.take() {
                    urls.push(raw.finish(prev_line)?);
                }
                current = Some((RawUrl { target: Some(line.value.clone()), ..RawUrl::default() }, line.number));
            }
            "URL_SHORT_NAME" => {} // cosmetic only; not part of the data model
            "URL_USE_CURRENT" => with_current(&mut current, line, |raw, v| raw.use_current = parse_bool(v)),
            "URL_DONT_CYCLE" => with_current(&mut current, line, |raw, v| raw.dont_cycle = parse_bool(v)),
            "HEADER" => with_current(&mut current, line, |raw, v| {
                if let Some((name, value)) = v.split_once(':') {
                    raw.headers.push((name.trim().to_string(), value.trim().to_string()));
                }
            }),
            "REQUEST_TYPE" => with_current(&mut current, line, |raw, v| {
                raw.method = Some(match v.to_ascii_uppercase().as_str() {
                    "POST" => RequestMethod::Post,
                    "PUT" => RequestMethod::Put,
                    _ => RequestMethod::Get,
                });
            }),
            "USERNAME" => with_current(&mut current, line, |raw, v| raw.username = Some(v.to_string())),
            "PASSWORD" => with_current(&mut current, line, |raw, v| raw.password = Some(v.to_string())),
            "FORM_USAGE_TYPE" => with_current(&mut current, line, |raw, v| raw.form_usage_type = Some(v.to_ascii_uppercase())),
            "FORM_STRING" => with_current(&mut current, line, |raw, v| raw.form_string = Some(v.to_string())),
            "FORM_RECORDS_FILE" => with_current(&mut current, line, |raw, v| raw.form_records_file = Some(v.to_string())),
            "FORM_RECORDS_RANDOM" => with_current(&mut current, line, |raw, v| raw.form_records_random = parse_bool(v)),
            "FORM_RECORDS_FILE_MAX_NUM" => with_current(&mut current, line, |raw, v| raw.form_records_file_max_num = v.parse().ok()),
            "UPLOAD_FILE" => with_current(&mut current, line, |raw, v| raw.upload_file = Some(v.to_string())),
            "MULTIPART_FORM_DATA" => {} // multipart body construction is not implemented by this transfer engine
            "WEB_AUTH_METHOD" => {} // only Basic auth is implemented; credentials carry the method implicitly
            "WEB_AUTH_CREDENTIALS" => with_current(&mut current, line, |raw, v| raw.web_auth = split_credentials(v)),
            "PROXY_AUTH_METHOD" => {}
            "PROXY_AUTH_CREDENTIALS" => with_current(&mut current, line, |raw, v| raw.proxy_auth = split_credentials(v)),
            "FRESH_CONNECT" => with_current(&mut current, line, |raw, v| raw.fresh_connect = parse_bool(v)),
            "TIMER_TCP_CONN_SETUP" => {
                if let Some((raw, _)) = current.as_mut() {
                    let range = parse_ms_range(line.number, &line.key, &line.value)?;
                    raw.connect_timeout_ms = range.high;
                }
            }
            "TIMER_URL_COMPLETION" => {
                if let Some((raw, _)) = current.as_mut() {
                    raw.completion_time_ms = Some(parse_ms_range(line.number, &line.key, &line.value)?);
                }
            }
            "TIMER_AFTER_URL_SLEEP" => {
                if let Some((raw, _)) = current.as_mut() {
                    raw.interleave_ms = Some(parse_ms_range(line.number, &line.key, &line.value)?);
                }
            }
            "FTP_ACTIVE" => with_current(&mut current, line, |raw, v| raw.ftp_active = parse_bool(v)),
            "LOG_RESP_HEADERS" => with_current(&mut current, line, |raw, v| raw.log_resp_headers = parse_bool(v)),
            "LOG_RESP_BODIES" => with_current(&mut current, line, |raw, v| raw.log_resp_bodies = parse_bool(v)),
            "RESPONSE_STATUS_ERRORS" => with_current(&mut current, line, |raw, v| {
                raw.status_error_directives.extend(v.split(',').map(|d| d.trim().to_string()).filter(|d| !d.is_empty()));
            }),
            "TRANSFER_LIMIT_RATE" => with_current(&mut current, line, |raw, v| raw.transfer_limit_rate = v.parse().ok()),
            "FETCH_PROBABILITY" => {
                if let Some((raw, _)) = current.as_mut() {
                    raw.fetch_probability = line.value.parse().map_err(|_| ConfigError::InvalidValue {
                        line: line.number,
                        key: line.key.clone(),
                        message: "expected an integer percentage 0-100".into(),
                    })?;
                }
            }
            "FETCH_PROBABILITY_ONCE" => with_current(&mut current, line, |raw, v| raw.fetch_probability_once = parse_bool(v)),

            other => warn!(line = line.number, key = other, "ignoring unknown configuration key"),
        }
    }

    if let Some((raw, prev_line)) = current.take() {
        urls.push(raw.finish(prev_line)?);
    }

    let name = name.ok_or(ConfigError::MissingBatchKey("BATCH_NAME".into()))?;
    let client_num_max = client_num_max.ok_or(ConfigError::MissingBatchKey("CLIENTS_NUM_MAX".into()))?;
    let interface = interface.ok_or(ConfigError::MissingBatchKey("INTERFACE".into()))?;
    let ip_addr_min = ip_addr_min.ok_or(ConfigError::MissingBatchKey("IP_ADDR_MIN".into()))?;
    let ip_addr_max = ip_addr_max.ok_or(ConfigError::MissingBatchKey("IP_ADDR_MAX".into()))?;
    let ipv6 = ip_addr_min.is_ipv6();

    let mut batch = Batch {
        name,
        client_num_max,
        client_num_start: client_num_start.unwrap_or(client_num_max),
        clients_initial_inc,
        interface,
        ipv6,
        ip_addr_min,
        ip_addr_max,
        cidr_netmask: netmask,
        ip_shared_num,
        cycles_num,
        user_agent,
        urls,
        first_cycling: None,
        last_cycling: None,
        error_recovery_client,
    };
    let (first, last) = batch.cycling_region();
    batch.first_cycling = first;
    batch.last_cycling = last;
    batch.validate()?;
    Ok(batch)
}

fn with_current(current: &mut Option<(RawUrl, usize)>, line: &Line, f: impl FnOnce(&mut RawUrl, &str)) {
    match current.as_mut() {
        Some((raw, _)) => f(raw, &line.value),
        None => warn!(line = line.number, key = %line.key, "URL-section key appeared before any URL= line; ignoring"),
    }
}

fn split_credentials(value: &str) -> Option<(String, String)> {
    value.split_once(':').map(|(u, p)| (u.to_string(), p.to_string()))
}

fn parse_netmask(line: usize, value: &str) -> Result<u8, ConfigError> {
    if let Ok(cidr) = value.parse::<u8>() {
        return Ok(cidr);
    }
    // Dotted-decimal form, e.g. 255.255.255.0: count the leading one-bits.
    let octets: Vec<u8> = value.split('.').map(|p| p.parse::<u8>()).collect::<Result<_, _>>().map_err(|_| {
        ConfigError::InvalidValue {
            line,
            key: "NETMASK".into(),
            message: format!("'{value}' is neither a CIDR number nor a dotted mask"),
        }
    })?;
    if octets.len() != 4 {
        return Err(ConfigError::InvalidValue {
            line,
            key: "NETMASK".into(),
            message: format!("'{value}' is not a dotted IPv4 mask"),
        });
    }
    let mask: u32 = octets.iter().fold(0u32, |acc, &o| (acc << 8) | o as u32);
    Ok(mask.count_ones() as u8)
}
