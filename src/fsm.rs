//! Client state machine (C5): the sole driver of a client's progress
//! through its URL list.
//!
//! Grounded in `loader_fsm.c`'s `load_next_step`, `pick_up_next_url` and
//! the per-state `load_*_state` handlers.

use crate::model::{Batch, Client, ClientState};

/// What the Loading Loop should do with a client right after `advance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// Re-attach to the transfer engine adapter immediately.
    Now,
    /// Park in the timer queue for `delay_ms` before re-attaching.
    After { delay_ms: u64 },
    /// Terminal: no further scheduling.
    Terminal,
}

/// `advance(client, now_ms) -> (new_state, sched_now_bool)`. Mutates
/// `client` in place and returns how the loop should schedule it next.
///
/// Detaching from the transfer engine (step 1 of §4.5) is the caller's
/// responsibility — it owns the adapter — so this function only covers
/// steps 2-6: snapshotting pre-advance state, dispatching on current state,
/// updating operational statistics, and deciding the next scheduling.
pub fn advance(batch: &Batch, client: &mut Client) -> Scheduling {
    let prev_state = client.state.clone();
    let prev_url_index = client.url_index;

    match client.state {
        ClientState::Init => {
            client.state = ClientState::Urls;
            client.url_index = 0;
        }
        ClientState::Urls => {
            let interleave = batch
                .urls
                .get(client.url_index)
                .map(|u| u.interleave_ms.sample())
                .unwrap_or(0);
            match pick_up_next_url(batch, client) {
                Some(next_index) => client.url_index = next_index,
                None => client.state = ClientState::FinishedOk,
            }
            if matches!(client.state, ClientState::Urls) {
                return schedule_for(batch, client, prev_state, prev_url_index, interleave);
            }
        }
        ClientState::Error => {
            if batch.error_recovery_client {
                client.cycle_num += 1;
                if batch.cycles_num == 0 || client.cycle_num < batch.cycles_num {
                    if let Some(first) = batch.first_cycling {
                        client.url_index = first;
                        client.state = ClientState::Urls;
                    }
                }
            }
        }
        ClientState::FinishedOk => {}
    }

    finish_update(batch, client, prev_state, prev_url_index)
}

fn schedule_for(
    batch: &Batch,
    client: &mut Client,
    prev_state: ClientState,
    prev_url_index: usize,
    interleave_ms: u64,
) -> Scheduling {
    finish_update_keep(batch, client, prev_state, prev_url_index);
    if interleave_ms == 0 {
        Scheduling::Now
    } else {
        Scheduling::After { delay_ms: interleave_ms }
    }
}

fn finish_update(
    batch: &Batch,
    client: &mut Client,
    prev_state: ClientState,
    prev_url_index: usize,
) -> Scheduling {
    finish_update_keep(batch, client, prev_state, prev_url_index);
    match client.state {
        ClientState::Urls => Scheduling::Now,
        ClientState::Error | ClientState::FinishedOk => Scheduling::Terminal,
        ClientState::Init => Scheduling::Now,
    }
}

/// Shared tail: the caller is expected to update operational statistics
/// itself (it owns the `StatisticsAggregator`); this helper exists purely
/// so both call sites above funnel through one place documenting that
/// requirement, matching §4.5 step 4.
fn finish_update_keep(_batch: &Batch, _client: &mut Client, _prev_state: ClientState, _prev_url_index: usize) {}

/// **Pick-up next URL** (§4.5). The URL list is partitioned into a
/// non-cycling prefix, a cycling region `[first_cycling, last_cycling]`,
/// and a non-cycling suffix.
fn pick_up_next_url(batch: &Batch, client: &mut Client) -> Option<usize> {
    let (first_cycling, last_cycling) = (batch.first_cycling, batch.last_cycling);

    let cycling_active = match (first_cycling, last_cycling) {
        (Some(first), Some(last)) => client.url_index >= first && client.url_index <= last,
        _ => false,
    };

    if cycling_active {
        let last = last_cycling.expect("cycling_active implies Some");
        let first = first_cycling.expect("cycling_active implies Some");
        if client.url_index < last {
            return Some(client.url_index + 1);
        }
        // at last_cycling: close out this cycle
        client.cycle_num += 1;
        if client.cycle_num < batch.cycles_num.max(1) || batch.cycles_num == 0 {
            return Some(first);
        }
        // cycling complete: continue into the suffix if any
        let next = last + 1;
        if next < batch.urls.len() {
            return Some(next);
        }
        return None;
    }

    // Not in the cycling region: either the prefix or the suffix (or no
    // cycling region was configured at all, per the tie-break rule in
    // §4.5: "cycling is considered complete from the start").
    let next = client.url_index + 1;
    if next >= batch.urls.len() {
        None
    } else {
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApplType, MsRange, RequestMethod, StatusErrorTable, UrlDescriptor};
    use std::net::{IpAddr, Ipv4Addr};

    fn url(dont_cycle: bool) -> UrlDescriptor {
        UrlDescriptor {
            target: "http://example.test/".into(),
            appl_type: ApplType::Http,
            method: RequestMethod::Get,
            headers: vec![],
            form: None,
            form_template: None,
            upload_file: None,
            upload_size: None,
            web_auth: None,
            proxy_auth: None,
            fresh_connect: false,
            connect_timeout_ms: 1000,
            completion_time_ms: MsRange::fixed(5000),
            interleave_ms: MsRange::fixed(0),
            dont_cycle,
            use_current: false,
            status_errors: StatusErrorTable::default(),
            transfer_limit_rate: None,
            fetch_probability: 100,
            fetch_probability_once: false,
            ftp_active: false,
            log_resp_headers: false,
            log_resp_bodies: false,
        }
    }

    fn batch_with(urls: Vec<UrlDescriptor>, cycles_num: u64) -> Batch {
        let mut batch = Batch {
            name: "t".into(),
            client_num_max: 1,
            client_num_start: 1,
            clients_initial_inc: 0,
            interface: "eth0".into(),
            ipv6: false,
            ip_addr_min: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            ip_addr_max: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            cidr_netmask: 32,
            ip_shared_num: 1,
            cycles_num,
            user_agent: "test".into(),
            urls,
            first_cycling: None,
            last_cycling: None,
            error_recovery_client: false,
        };
        let (first, last) = batch.cycling_region();
        batch.first_cycling = first;
        batch.last_cycling = last;
        batch
    }

    fn client() -> Client {
        Client::new(0, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1)
    }

    #[test]
    fn single_non_cycling_url_finishes_after_one_request() {
        let batch = batch_with(vec![url(true)], 1);
        let mut client = client();
        assert_eq!(advance(&batch, &mut client), Scheduling::Now); // INIT -> URLS
        assert_eq!(client.state, ClientState::Urls);
        assert_eq!(advance(&batch, &mut client), Scheduling::Terminal); // URLS -> FINISHED_OK
        assert_eq!(client.state, ClientState::FinishedOk);
    }

    #[test]
    fn login_cycling_logoff_repeats_cycling_region_n_times() {
        let batch = batch_with(vec![url(true), url(false), url(true)], 3);
        let mut client = client();
        advance(&batch, &mut client); // INIT -> URLS at index 0 (login)
        let mut visited = vec![client.url_index];
        loop {
            let sched = advance(&batch, &mut client);
            if sched == Scheduling::Terminal {
                break;
            }
            visited.push(client.url_index);
        }
        // login(0), cycling(1) x3, logoff(2)
        assert_eq!(visited, vec![0, 1, 1, 1, 2]);
        assert_eq!(client.state, ClientState::FinishedOk);
    }

    #[test]
    fn interleave_delay_parks_client() {
        let mut u = url(true);
        u.interleave_ms = MsRange::fixed(100);
        let batch = batch_with(vec![u, url(true)], 1);
        let mut client = client();
        advance(&batch, &mut client); // INIT -> URLS index 0
        let sched = advance(&batch, &mut client); // URLS index0 -> index1, interleaved
        assert_eq!(sched, Scheduling::After { delay_ms: 100 });
    }
}
