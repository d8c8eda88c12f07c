//! Birth-death queueing model of a single replica.
//!
//! State `n` is occupancy (requests in service plus queued), bounded
//! by `max_queue_size + max_batch_size`. The service rate is
//! state-dependent — supplied by the caller as a per-concurrency total
//! service time (the analyzer owns the prefill/decode formulas that
//! produce it) — and is held flat once concurrency saturates the
//! batch.

/// Probabilities below this are treated as numerically zero.
pub const PROB_FLOOR: f64 = 1e-30;

/// `pi` must sum to 1 within this tolerance for a solution to be valid.
const NORMALIZATION_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solution {
    pub throughput: f64,
    pub avg_resp_time: f64,
    pub avg_wait_time: f64,
    pub avg_service_time: f64,
    pub avg_num_in_serv: f64,
    pub rho: f64,
}

/// A solved birth-death chain is only meaningful if its load factor
/// sits below this ceiling (never fully saturating the batch).
pub fn rho_max(epsilon: f64) -> f64 {
    1.0 - epsilon
}

/// A state-dependent M/M/1-style model of one replica.
///
/// `service_time_ms` returns the total per-request service time (msec)
/// at a given concurrency in `[1, max_batch_size]`; the model holds it
/// flat beyond `max_batch_size`.
pub struct QueueingModel<'a> {
    pub max_batch_size: u32,
    pub max_queue_size: u32,
    service_time_ms: &'a dyn Fn(u32) -> f64,
}

impl<'a> QueueingModel<'a> {
    pub fn new(
        max_batch_size: u32,
        max_queue_size: u32,
        service_time_ms: &'a dyn Fn(u32) -> f64,
    ) -> Self {
        Self {
            max_batch_size,
            max_queue_size,
            service_time_ms,
        }
    }

    fn occupancy_bound(&self) -> u32 {
        self.max_queue_size + self.max_batch_size
    }

    /// Service rate at occupancy `n` (requests/msec).
    pub fn mu(&self, n: u32) -> f64 {
        let served = n.clamp(1, self.max_batch_size);
        let t = (self.service_time_ms)(served);
        if t <= 0.0 {
            return 0.0;
        }
        served as f64 / t
    }

    /// `Solve(lambda, mu_base)`: the `mu_base` argument names the
    /// service-rate model this instance already carries (`self`); it
    /// is accepted for signature parity but has no independent value
    /// here, since the model and its solver are one type.
    pub fn solve(&self, lambda_per_ms: f64, epsilon: f64) -> Option<Solution> {
        if lambda_per_ms < 0.0 || self.mu(1) <= 0.0 {
            return None;
        }
        let n_max = self.occupancy_bound();
        let mut pi = vec![0.0f32; (n_max + 1) as usize];
        pi[0] = 1.0;
        // pi(n) = pi(0) * prod_{k=1}^{n} lambda / mu(k), single precision.
        let mut running = 1.0f32;
        for n in 1..=n_max {
            let ratio = (lambda_per_ms / self.mu(n)) as f32;
            running *= ratio;
            pi[n as usize] = if running.abs() < PROB_FLOOR as f32 {
                0.0
            } else {
                running
            };
        }
        let sum: f32 = pi.iter().sum();
        if sum <= 0.0 {
            return None;
        }
        for p in pi.iter_mut() {
            *p /= sum;
        }
        let renormalized: f32 = pi.iter().sum();
        if (renormalized - 1.0).abs() > NORMALIZATION_TOLERANCE as f32 {
            return None;
        }

        let mut l_total = 0.0f64;
        let mut l_service = 0.0f64;
        for (n, &p) in pi.iter().enumerate() {
            let p = p as f64;
            l_total += n as f64 * p;
            l_service += (n as u32).min(self.max_batch_size) as f64 * p;
        }
        let blocked = pi[n_max as usize] as f64;
        let throughput = lambda_per_ms * (1.0 - blocked);
        if throughput <= 0.0 {
            return None;
        }
        let avg_resp_time = l_total / throughput;
        let avg_service_time = l_service / throughput;
        let avg_wait_time = avg_resp_time - avg_service_time;
        let rho = l_service / self.max_batch_size as f64;

        if !(0.0..rho_max(epsilon)).contains(&rho) {
            return None;
        }

        Some(Solution {
            throughput,
            avg_resp_time,
            avg_wait_time,
            avg_service_time,
            avg_num_in_serv: l_service,
            rho,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_service_time(_b: u32) -> f64 {
        10.0
    }

    #[test]
    fn solve_rejects_negative_lambda() {
        let model = QueueingModel::new(4, 4, &flat_service_time);
        assert!(model.solve(-1.0, 0.001).is_none());
    }

    #[test]
    fn solve_produces_normalized_distribution_and_bounded_rho() {
        let model = QueueingModel::new(4, 4, &flat_service_time);
        // mu(n) = n/10 req/ms; pick lambda well inside the stable range.
        let sol = model.solve(0.1, 0.001).expect("solvable");
        assert!(sol.rho >= 0.0 && sol.rho < 1.0);
        assert!(sol.throughput > 0.0);
        assert!(sol.avg_wait_time >= -1e-9);
    }

    #[test]
    fn solve_rejects_near_saturating_load() {
        let model = QueueingModel::new(2, 0, &flat_service_time);
        // Lambda far above mu(2) drives the chain to pi(2) ~= 1, rho ~= 1.
        assert!(model.solve(1000.0, 0.001).is_none());
    }
}
