/// Training configuration shared by the model trainers
#[derive(Clone, Debug)]
pub struct TrainConfig {
    pub learning_rate: f32,
    pub weight_decay: f32,
    /// weight of the KL terms
    pub beta: f32,
    pub num_message_passing: usize,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// early stopping window in epochs
    pub early_stop: usize,
    /// evaluate on the test split every `eval_freq` epochs
    pub eval_freq: usize,
    pub lr_patience: usize,
    pub lr_factor: f32,
    pub device: candle_core::Device,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            weight_decay: 0.,
            beta: 1.,
            num_message_passing: 3,
            batch_size: 32,
            num_epochs: 500,
            early_stop: 50,
            eval_freq: 5,
            lr_patience: 20,
            lr_factor: 0.1,
            device: candle_core::Device::Cpu,
            show_progress: true,
            verbose: false,
        }
    }
}

impl TrainConfig {
    /// number of evaluation checkpoints without improvement
    /// before training stops
    pub fn early_stop_lag(&self) -> usize {
        self.early_stop / self.eval_freq.max(1)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.eval_freq == 0 {
            anyhow::bail!("eval_freq must be positive");
        }
        if self.early_stop < self.eval_freq {
            anyhow::bail!(
                "early stopping window {} shorter than evaluation interval {}",
                self.early_stop,
                self.eval_freq
            );
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if !(self.learning_rate > 0.) {
            anyhow::bail!("learning rate must be positive: {}", self.learning_rate);
        }
        if !(self.lr_factor > 0. && self.lr_factor < 1.) {
            anyhow::bail!("lr_factor must be in (0, 1): {}", self.lr_factor);
        }
        if self.beta < 0. {
            anyhow::bail!("beta must be non-negative: {}", self.beta);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lag_and_validation() {
        let config = TrainConfig {
            early_stop: 30,
            eval_freq: 5,
            ..Default::default()
        };
        assert_eq!(config.early_stop_lag(), 6);
        assert!(config.validate().is_ok());

        let bad = TrainConfig {
            eval_freq: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let short = TrainConfig {
            early_stop: 2,
            eval_freq: 5,
            ..Default::default()
        };
        assert!(short.validate().is_err());
    }
}
