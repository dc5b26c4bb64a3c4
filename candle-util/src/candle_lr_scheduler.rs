use log::info;

/// Reduce the learning rate when a monitored loss stops improving
///
/// A loss counts as an improvement if `loss < best * (1 - threshold)`.
/// After more than `patience` epochs without improvement the rate is
/// multiplied by `factor`.
#[derive(Clone, Debug)]
pub struct ReduceLrOnPlateau {
    lr: f64,
    factor: f64,
    patience: usize,
    threshold: f64,
    best: f64,
    num_bad_epochs: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(initial_lr: f64, factor: f64, patience: usize) -> Self {
        Self {
            lr: initial_lr,
            factor,
            patience,
            threshold: 1e-4,
            best: f64::INFINITY,
            num_bad_epochs: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Take a new loss value; returns the new learning rate if it has
    /// just been reduced.
    pub fn step(&mut self, loss: f64) -> Option<f64> {
        if loss < self.best * (1. - self.threshold) {
            self.best = loss;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs > self.patience {
            self.num_bad_epochs = 0;
            let new_lr = self.lr * self.factor;
            info!("reducing learning rate {:.3e} -> {:.3e}", self.lr, new_lr);
            self.lr = new_lr;
            return Some(new_lr);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduces_after_patience_runs_out() {
        let mut sched = ReduceLrOnPlateau::new(1e-3, 0.1, 2);
        assert_eq!(sched.step(1.0), None);
        assert_eq!(sched.step(1.0), None);
        assert_eq!(sched.step(1.0), None);
        let lr = sched.step(1.0).expect("reduced");
        approx::assert_relative_eq!(lr, 1e-4, max_relative = 1e-9);
        // counter restarts after a reduction
        assert_eq!(sched.step(1.0), None);
    }

    #[test]
    fn improvement_resets_counter() {
        let mut sched = ReduceLrOnPlateau::new(1e-2, 0.5, 1);
        sched.step(1.0);
        sched.step(1.0);
        assert_eq!(sched.step(0.5), None);
        assert_eq!(sched.step(0.5), None);
        assert!(sched.step(0.5).is_some());
    }
}
