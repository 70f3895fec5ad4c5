//! RPROP weight updater with per-tag L1/L2/frequency regularization and
//! orthant projection (spec component 8, spec.md §4.7).

use std::sync::atomic::Ordering;

use crate::atomic_f64::{load_f64, store_f64};
use crate::model::{Model, NUM_TAGS};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct RpropConfig {
    pub stpinc: f64,
    pub stpdec: f64,
    pub stpmin: f64,
    pub stpmax: f64,
    /// `None` means "not set for this tag"; [`RpropConfig::rho_for`] falls
    /// back to tag 0, then to 0.0.
    pub rho1: [Option<f64>; NUM_TAGS],
    pub rho2: [Option<f64>; NUM_TAGS],
    pub rho3: [Option<f64>; NUM_TAGS],
}

impl Default for RpropConfig {
    fn default() -> Self {
        Self {
            stpinc: 1.2,
            stpdec: 0.5,
            stpmin: 1e-8,
            stpmax: 50.0,
            rho1: [None; NUM_TAGS],
            rho2: [None; NUM_TAGS],
            rho3: [None; NUM_TAGS],
        }
    }
}

impl RpropConfig {
    /// Tag-specific rho, falling back to tag 0 when the tag itself was
    /// never set, then to 0.0 when tag 0 was never set either.
    fn rho_for(&self, tag: u8) -> (f64, f64, f64) {
        let t = tag as usize;
        let pick = |arr: &[Option<f64>; NUM_TAGS]| arr[t].or(arr[0]).unwrap_or(0.0);
        (pick(&self.rho1), pick(&self.rho2), pick(&self.rho3))
    }
}

/// Sweep every feature once, applying the seven-step RPROP update. Returns
/// the number of features remaining in the table and the accumulated
/// regularization term added to the objective.
pub fn sweep(model: &Model, cfg: &RpropConfig) -> (usize, f64) {
    let iteration = model.iteration();
    let mut objective = 0.0;
    let mut remaining = 0usize;
    let mut to_remove = Vec::new();

    for (key, f) in model.table.iter() {
        let tag = f.tag();
        let x = f.x();

        // 1. Pruning checks, in order.
        if x == 0.0 && iteration >= model.rem[tag as usize] {
            to_remove.push(key);
            continue;
        }
        let frq = f.frq.load(Ordering::Relaxed);
        if frq < model.min_freq {
            to_remove.push(key);
            continue;
        }
        if iteration < model.stt[tag as usize] {
            remaining += 1;
            continue;
        }

        // 2. Step-size initialization.
        let mut stp = load_f64(&f.stp);
        if stp == 0.0 {
            stp = 0.1;
        }

        // 3. Regularization.
        let (rho1, rho2, rho3) = cfg.rho_for(tag);
        let mut g = f.g();
        g += rho2 * x;
        objective += rho2 * x * x / 2.0 + rho1 * x.abs() + rho3 * (frq as f64) * x.abs();

        // 4. Orthant-projected gradient.
        let a = rho1 + rho3 * frq as f64;
        let pg = if a == 0.0 {
            g
        } else if x < -EPS {
            g - a
        } else if x > EPS {
            g + a
        } else if g < -a {
            g + a
        } else if g > a {
            g - a
        } else {
            0.0
        };

        // 5. Step adaptation.
        let g_prev = load_f64(&f.g_prev);
        let s = g_prev * pg;
        if s < -EPS {
            stp = (stp * cfg.stpdec).max(cfg.stpmin);
        } else if s > EPS {
            stp = (stp * cfg.stpinc).min(cfg.stpmax);
        }

        // 6. Weight update.
        let mut new_x = x;
        if s < 0.0 {
            let last_delta = load_f64(&f.last_delta);
            new_x -= last_delta;
            g = 0.0;
        } else {
            let mut delta = if pg.abs() <= EPS { 0.0 } else { -pg.signum() * stp };
            if rho1 != 0.0 && delta * pg >= 0.0 {
                delta = 0.0;
            }
            new_x += delta;
            store_f64(&f.last_delta, delta);
        }
        store_f64(&f.x, new_x);

        // 7. Bookkeeping.
        f.frq.store(0, Ordering::Relaxed);
        store_f64(&f.g_prev, g);
        store_f64(&f.g, 0.0);
        store_f64(&f.stp, stp);

        remaining += 1;
    }

    for key in &to_remove {
        model.table.remove(*key);
    }

    (remaining, objective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic_f64::store_f64;

    #[test]
    fn zero_weight_feature_past_rem_is_pruned() {
        let mut model = Model::new(0);
        model.rem[0] = 0;
        model.set_iteration(0);
        model.add_feature(0, &[1], false);
        sweep(&model, &RpropConfig::default());
        assert_eq!(model.table.len(), 0);
    }

    #[test]
    fn low_frequency_feature_is_pruned() {
        let model = Model::new(5);
        let f = model.add_feature(0, &[1], false).unwrap();
        f.frq.store(1, Ordering::Relaxed);
        store_f64(&f.x, 1.0);
        sweep(&model, &RpropConfig::default());
        assert_eq!(model.table.len(), 0);
    }

    #[test]
    fn below_activation_start_is_skipped_without_removal() {
        let mut model = Model::new(0);
        model.stt[0] = 10;
        model.set_iteration(0);
        let f = model.add_feature(0, &[1], false).unwrap();
        f.frq.store(1, Ordering::Relaxed);
        store_f64(&f.x, 1.0);
        let before = f.x();
        sweep(&model, &RpropConfig::default());
        assert_eq!(model.table.len(), 1);
        assert_eq!(f.x(), before);
    }

    #[test]
    fn positive_gradient_decreases_weight() {
        let model = Model::new(0);
        let f = model.add_feature(0, &[1], false).unwrap();
        f.frq.store(1, Ordering::Relaxed);
        f.add_g(1.0);
        sweep(&model, &RpropConfig::default());
        assert!(f.x() < 0.0);
    }

    #[test]
    fn step_size_grows_on_agreeing_gradient_sign() {
        let model = Model::new(0);
        let f = model.add_feature(0, &[1], false).unwrap();
        f.frq.store(1, Ordering::Relaxed);
        f.add_g(1.0);
        sweep(&model, &RpropConfig::default());
        let stp_after_first = load_f64(&f.stp);
        f.frq.store(1, Ordering::Relaxed);
        f.add_g(1.0);
        sweep(&model, &RpropConfig::default());
        assert!(load_f64(&f.stp) >= stp_after_first);
    }
}
