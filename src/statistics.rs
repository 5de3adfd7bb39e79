//! Statistics aggregator (C4): per-batch delta and total counters for HTTP
//! and HTTPS, plus the operational per-URL success/failure/CAPS counters.
//!
//! Grounded in `statistics.h` / `statistics.c`'s `stat_point` struct and
//! `dump_intermediate_and_advance_total_statistics`, adapted to an
//! incremental-mean tracker instead of C's hand-rolled running sums.

use crate::model::ClientState;

/// One running-average tracker (§4.4's incremental mean:
/// `avg' = (avg*n + sample)/(n+1)`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningMean {
    pub mean_ms: f64,
    pub samples: u64,
}

impl RunningMean {
    pub fn add(&mut self, sample_ms: f64) {
        self.mean_ms = (self.mean_ms * self.samples as f64 + sample_ms) / (self.samples as f64 + 1.0);
        self.samples += 1;
    }

    /// Combine two means so that the combined mean is the sample-weighted
    /// mean of the two — required by §8's `T_k = T_{k-1} + s_k` property.
    pub fn merge(&mut self, other: &RunningMean) {
        let total = self.samples + other.samples;
        if total == 0 {
            return;
        }
        self.mean_ms = (self.mean_ms * self.samples as f64 + other.mean_ms * other.samples as f64) / total as f64;
        self.samples = total;
    }
}

/// Per-client / per-batch-bucket counters (§3 *Statistics counters*).
#[derive(Debug, Clone, Copy, Default)]
pub struct StatPoint {
    pub data_in: u64,
    pub data_out: u64,
    pub requests: u64,
    pub resp_1xx: u64,
    pub resp_2xx: u64,
    pub resp_3xx: u64,
    pub resp_4xx: u64,
    pub resp_5xx: u64,
    pub other_errors: u64,
    pub appl_delay: RunningMean,
    pub appl_delay_2xx: RunningMean,
}

impl StatPoint {
    pub fn reset(&mut self) {
        *self = StatPoint::default();
    }

    pub fn add(&mut self, other: &StatPoint) {
        self.data_in += other.data_in;
        self.data_out += other.data_out;
        self.requests += other.requests;
        self.resp_1xx += other.resp_1xx;
        self.resp_2xx += other.resp_2xx;
        self.resp_3xx += other.resp_3xx;
        self.resp_4xx += other.resp_4xx;
        self.resp_5xx += other.resp_5xx;
        self.other_errors += other.other_errors;
        self.appl_delay.merge(&other.appl_delay);
        self.appl_delay_2xx.merge(&other.appl_delay_2xx);
    }

    pub fn count_response_class(&mut self, class: u8) {
        match class {
            1 => self.resp_1xx += 1,
            2 => self.resp_2xx += 1,
            3 => self.resp_3xx += 1,
            4 => self.resp_4xx += 1,
            5 => self.resp_5xx += 1,
            _ => self.other_errors += 1,
        }
    }
}

/// Per-URL success/failure tally plus a call-init counter for CAPS (§3, §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct OpStatPoint {
    pub successes: u64,
    pub failures: u64,
    pub call_init_count: u64,
}

/// Delta + total HTTP/HTTPS statistics for one batch, plus operational
/// per-URL counters.
pub struct StatisticsAggregator {
    pub http_delta: StatPoint,
    pub http_total: StatPoint,
    pub https_delta: StatPoint,
    pub https_total: StatPoint,
    pub op_delta: Vec<OpStatPoint>,
    pub op_total: Vec<OpStatPoint>,
    pub last_snapshot_ms: u64,
}

impl StatisticsAggregator {
    pub fn new(url_count: usize) -> Self {
        StatisticsAggregator {
            http_delta: StatPoint::default(),
            http_total: StatPoint::default(),
            https_delta: StatPoint::default(),
            https_total: StatPoint::default(),
            op_delta: vec![OpStatPoint::default(); url_count],
            op_total: vec![OpStatPoint::default(); url_count],
            last_snapshot_ms: 0,
        }
    }

    pub fn bucket_mut(&mut self, is_https: bool) -> &mut StatPoint {
        if is_https {
            &mut self.https_delta
        } else {
            &mut self.http_delta
        }
    }

    /// `merge_delta_into_total(batch)`.
    pub fn merge_delta_into_total(&mut self) {
        let http_delta = std::mem::take(&mut self.http_delta);
        self.http_total.add(&http_delta);
        let https_delta = std::mem::take(&mut self.https_delta);
        self.https_total.add(&https_delta);
        for (delta, total) in self.op_delta.iter_mut().zip(self.op_total.iter_mut()) {
            total.successes += delta.successes;
            total.failures += delta.failures;
            total.call_init_count += delta.call_init_count;
            *delta = OpStatPoint::default();
        }
    }

    /// `op_update(client_prev_state, client_current_state, prev_url_index, current_url_index)`.
    /// Per §7: op-stat updates key on the *pre-advance* state, so a
    /// recovered error is still recorded as one failure of the URL that
    /// caused it.
    pub fn op_update(&mut self, prev_state: &ClientState, current_state: &ClientState, prev_url_index: usize) {
        if let Some(op) = self.op_delta.get_mut(prev_url_index) {
            match prev_state {
                ClientState::Urls => {
                    if matches!(current_state, ClientState::Error) {
                        op.failures += 1;
                    } else {
                        op.successes += 1;
                    }
                }
                ClientState::Error if matches!(current_state, ClientState::Urls) => {
                    // Recovery into a new cycle: still a failure of the
                    // URL that caused the error, per §7.
                    op.failures += 1;
                }
                _ => {}
            }
        }
    }

    pub fn op_init_count_inc(&mut self, url_index: usize) {
        if let Some(op) = self.op_delta.get_mut(url_index) {
            op.call_init_count += 1;
        }
    }

    /// CAPS (call attempts per second) over an interval.
    pub fn caps(&self, url_index: usize, interval_secs: f64) -> f64 {
        if interval_secs <= 0.0 {
            return 0.0;
        }
        self.op_total
            .get(url_index)
            .map(|op| op.call_init_count as f64 / interval_secs)
            .unwrap_or(0.0)
    }
}

/// The `.txt` snapshot columns (§6) report HTTP and HTTPS combined; this is
/// the combine step the report writer uses.
pub fn combine(a: &StatPoint, b: &StatPoint) -> StatPoint {
    let mut out = *a;
    out.add(b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_matches_incremental_formula() {
        let mut mean = RunningMean::default();
        mean.add(10.0);
        mean.add(20.0);
        mean.add(30.0);
        assert!((mean.mean_ms - 20.0).abs() < 1e-9);
        assert_eq!(mean.samples, 3);
    }

    #[test]
    fn merged_totals_are_sample_weighted_means_of_snapshots() {
        let mut total = RunningMean::default();
        let mut s1 = RunningMean::default();
        s1.add(100.0);
        s1.add(200.0);
        let mut s2 = RunningMean::default();
        s2.add(50.0);
        total.merge(&s1);
        total.merge(&s2);
        let expected = (100.0 + 200.0 + 50.0) / 3.0;
        assert!((total.mean_ms - expected).abs() < 1e-9);
    }

    #[test]
    fn merge_delta_into_total_accumulates_and_resets_delta() {
        let mut agg = StatisticsAggregator::new(1);
        agg.http_delta.requests = 5;
        agg.http_delta.resp_2xx = 5;
        agg.merge_delta_into_total();
        assert_eq!(agg.http_total.requests, 5);
        assert_eq!(agg.http_delta.requests, 0);
        agg.http_delta.requests = 3;
        agg.merge_delta_into_total();
        assert_eq!(agg.http_total.requests, 8);
    }

    #[test]
    fn op_update_attributes_failure_to_pre_advance_url_even_on_recovery() {
        let mut agg = StatisticsAggregator::new(2);
        agg.op_update(&ClientState::Urls, &ClientState::Error, 1);
        assert_eq!(agg.op_delta[1].failures, 1);
        agg.op_update(&ClientState::Error, &ClientState::Urls, 1);
        assert_eq!(agg.op_delta[1].failures, 2);
    }
}
