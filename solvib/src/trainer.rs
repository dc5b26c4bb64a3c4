use crate::evaluator::{evaluate_split, Evaluator, SplitMetrics};
use crate::model::GibModel;
use crate::pair_data::{PairBatch, PairDataset};
use crate::stats_writer::ScalarSink;

use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_loss_functions::mse_loss;
use candle_util::candle_lr_scheduler::ReduceLrOnPlateau;
use candle_util::candle_model_traits::GraphEncoderT;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

/// Host copies of everything one training step reports
#[derive(Clone, Copy, Debug, Default)]
pub struct StepLoss {
    pub total: f32,
    pub clean_mse: f32,
    pub bottleneck_mse: f32,
    pub solute_kl: f32,
    pub solvent_kl: f32,
    pub solute_preserve_rate: f32,
    pub solvent_preserve_rate: f32,
}

/// Per-epoch averages over the training minibatches
#[derive(Clone, Copy, Debug, Default)]
pub struct EpochStats {
    pub mean_loss: f32,
    pub solute_preservation: f32,
    pub solvent_preservation: f32,
    pub num_batches: usize,
}

impl EpochStats {
    pub fn from_steps(steps: &[StepLoss]) -> Self {
        let n = steps.len();
        if n == 0 {
            return Self::default();
        }
        let denom = n as f32;
        Self {
            mean_loss: steps.iter().map(|s| s.total).sum::<f32>() / denom,
            solute_preservation: steps.iter().map(|s| s.solute_preserve_rate).sum::<f32>() / denom,
            solvent_preservation: steps.iter().map(|s| s.solvent_preserve_rate).sum::<f32>() / denom,
            num_batches: n,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpochState {
    Training(usize),
    Evaluating(usize),
    Scheduling(usize),
    Continue(usize),
    EarlyStop(usize),
    Done(usize),
}

/// The pieces of an epoch that `run_epochs` sequences
pub trait EpochRunner {
    /// one pass over the training minibatches
    fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<EpochStats>;

    /// validation loss of the current parameters, with checkpoint
    /// bookkeeping on evaluation epochs
    fn evaluate(&mut self, epoch: usize) -> anyhow::Result<f32>;

    /// learning-rate update and per-epoch logging
    fn schedule(&mut self, epoch: usize, stats: &EpochStats, val_loss: f32) -> anyhow::Result<()>;

    fn should_stop(&self) -> bool;

    /// final evaluation pass and cleanup
    fn finish(&mut self, last_epoch: usize, early_stopped: bool) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochLoopOutcome {
    pub epochs_run: usize,
    pub early_stopped: bool,
}

/// Drive `runner` through
/// `Training -> Evaluating -> Scheduling -> {Continue, EarlyStop, Done}`
/// for at most `num_epochs` epochs (counted from 1).
pub fn run_epochs<R>(runner: &mut R, num_epochs: usize) -> anyhow::Result<EpochLoopOutcome>
where
    R: EpochRunner + ?Sized,
{
    let mut state = if num_epochs > 0 {
        EpochState::Training(1)
    } else {
        EpochState::Done(0)
    };
    let mut stats = EpochStats::default();
    let mut val_loss = f32::INFINITY;

    loop {
        state = match state {
            EpochState::Training(epoch) => {
                stats = runner.train_epoch(epoch)?;
                EpochState::Evaluating(epoch)
            }
            EpochState::Evaluating(epoch) => {
                val_loss = runner.evaluate(epoch)?;
                EpochState::Scheduling(epoch)
            }
            EpochState::Scheduling(epoch) => {
                runner.schedule(epoch, &stats, val_loss)?;
                if runner.should_stop() {
                    EpochState::EarlyStop(epoch)
                } else if epoch >= num_epochs {
                    EpochState::Done(epoch)
                } else {
                    EpochState::Continue(epoch)
                }
            }
            EpochState::Continue(epoch) => EpochState::Training(epoch + 1),
            EpochState::EarlyStop(epoch) => {
                info!("early stopping at epoch {}", epoch);
                runner.finish(epoch, true)?;
                return Ok(EpochLoopOutcome {
                    epochs_run: epoch,
                    early_stopped: true,
                });
            }
            EpochState::Done(epoch) => {
                runner.finish(epoch, false)?;
                return Ok(EpochLoopOutcome {
                    epochs_run: epoch,
                    early_stopped: false,
                });
            }
        };
    }
}

/// Training, validation and test splits; evaluation splits are
/// collated once
pub struct TrainingData {
    pub train: PairDataset,
    pub valid: Vec<PairBatch>,
    pub test: Vec<PairBatch>,
}

impl TrainingData {
    pub fn new(
        train: PairDataset,
        mut valid: PairDataset,
        mut test: PairDataset,
        batch_size: usize,
        device: &candle_core::Device,
    ) -> anyhow::Result<Self> {
        valid.ordered_minibatch(batch_size);
        test.ordered_minibatch(batch_size);
        Ok(Self {
            valid: valid.collate_minibatches(device)?,
            test: test.collate_minibatches(device)?,
            train,
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TrainSummary {
    pub best_epoch: usize,
    pub best_val_loss: f32,
    pub best_test_loss: f32,
    pub best_test_mae: f32,
    pub epochs_run: usize,
    pub early_stopped: bool,
    pub final_learning_rate: f64,
}

/// Two-pass trainer of a `GibModel`
///
/// Every step runs the plain forward and the bottleneck forward on the
/// same minibatch and minimizes
/// `mse(plain) + mse(bottleneck) + beta * (KL_solute + KL_solvent)`.
pub struct GibTrainer<'a, Enc>
where
    Enc: GraphEncoderT,
{
    model: &'a GibModel<Enc>,
    varmap: &'a VarMap,
    config: &'a TrainConfig,
    optimizer: AdamW,
    scheduler: ReduceLrOnPlateau,
    evaluator: Evaluator,
}

impl<'a, Enc> GibTrainer<'a, Enc>
where
    Enc: GraphEncoderT,
{
    /// * `model` - parameters must live in `varmap`
    /// * `config` - checked by `TrainConfig::validate`
    pub fn new(model: &'a GibModel<Enc>, varmap: &'a VarMap, config: &'a TrainConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let lr = config.learning_rate as f64;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr,
                weight_decay: config.weight_decay as f64,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            varmap,
            config,
            optimizer,
            scheduler: ReduceLrOnPlateau::new(lr, config.lr_factor as f64, config.lr_patience),
            evaluator: Evaluator::new(config.eval_freq, config.early_stop_lag()),
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// One optimizer step on `batch`
    pub fn train_step(&mut self, batch: &PairBatch) -> anyhow::Result<StepLoss> {
        let beta = self.config.beta as f64;

        let plain = self.model.forward_plain(batch, true, false)?;
        let clean_mse = mse_loss(&plain.prediction, &batch.target)?;

        let ib = self.model.forward_bottleneck(batch, true)?;
        let bottleneck_mse = mse_loss(&ib.prediction, &batch.target)?;

        let loss = clean_mse
            .add(&bottleneck_mse)?
            .add(&(&ib.solute_kl * beta)?)?
            .add(&(&ib.solvent_kl * beta)?)?;

        self.optimizer.backward_step(&loss)?;

        Ok(StepLoss {
            total: loss.to_scalar::<f32>()?,
            clean_mse: clean_mse.to_scalar::<f32>()?,
            bottleneck_mse: bottleneck_mse.to_scalar::<f32>()?,
            solute_kl: ib.solute_kl.to_scalar::<f32>()?,
            solvent_kl: ib.solvent_kl.to_scalar::<f32>()?,
            solute_preserve_rate: ib.solute_preserve_rate.to_scalar::<f32>()?,
            solvent_preserve_rate: ib.solvent_preserve_rate.to_scalar::<f32>()?,
        })
    }

    /// Train until the epoch budget runs out or validation stalls,
    /// then restore the best checkpoint.
    ///
    /// * `data` - training minibatches are reshuffled every epoch
    /// * `sink` - receives the per-epoch scalars and is closed at the end
    /// * `seed` - minibatch shuffling
    pub fn fit<S>(&mut self, data: &mut TrainingData, sink: &mut S, seed: u64) -> anyhow::Result<TrainSummary>
    where
        S: ScalarSink,
    {
        let pb = ProgressBar::new(self.config.num_epochs as u64);
        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let num_epochs = self.config.num_epochs;
        let mut runner = FitRunner {
            trainer: &mut *self,
            data,
            sink,
            rng: StdRng::seed_from_u64(seed),
            pb: &pb,
        };
        let outcome = run_epochs(&mut runner, num_epochs)?;
        pb.finish_and_clear();

        let best_test = self.evaluator.best_test().ok_or(anyhow::anyhow!(
            "no evaluation checkpoint improved the validation loss"
        ))?;

        Ok(TrainSummary {
            best_epoch: self.evaluator.best_epoch(),
            best_val_loss: self.evaluator.best_val_loss(),
            best_test_loss: best_test.mse,
            best_test_mae: best_test.mae,
            epochs_run: outcome.epochs_run,
            early_stopped: outcome.early_stopped,
            final_learning_rate: self.learning_rate(),
        })
    }

    fn checkpoint(&mut self, epoch: usize, val_loss: f32, test: &[PairBatch]) -> anyhow::Result<SplitMetrics> {
        let test = evaluate_split(self.model, test)?;
        self.evaluator.checkpoint(epoch, val_loss, test, self.varmap)?;
        Ok(test)
    }
}

struct FitRunner<'r, 'a, Enc, S>
where
    Enc: GraphEncoderT,
    S: ScalarSink,
{
    trainer: &'r mut GibTrainer<'a, Enc>,
    data: &'r mut TrainingData,
    sink: &'r mut S,
    rng: StdRng,
    pb: &'r ProgressBar,
}

impl<Enc, S> EpochRunner for FitRunner<'_, '_, Enc, S>
where
    Enc: GraphEncoderT,
    S: ScalarSink,
{
    fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<EpochStats> {
        let config = self.trainer.config;
        self.data
            .train
            .shuffle_minibatch(config.batch_size, &mut self.rng);
        let batches = self.data.train.collate_minibatches(&config.device)?;

        let mut steps = Vec::with_capacity(batches.len());
        for batch in batches.iter() {
            steps.push(self.trainer.train_step(batch)?);
        }
        let stats = EpochStats::from_steps(&steps);

        if config.verbose {
            info!(
                "[{}] train loss {:.4} over {} batches",
                epoch, stats.mean_loss, stats.num_batches
            );
        }
        Ok(stats)
    }

    fn evaluate(&mut self, epoch: usize) -> anyhow::Result<f32> {
        let val_loss = evaluate_split(self.trainer.model, &self.data.valid)?.mse;

        if self.trainer.evaluator.is_checkpoint(epoch) {
            let test = self.trainer.checkpoint(epoch, val_loss, &self.data.test)?;
            self.sink.record_scalar("loss/test", test.mse, epoch)?;
            self.sink.record_scalar("mae/test", test.mae, epoch)?;
        }
        Ok(val_loss)
    }

    fn schedule(&mut self, epoch: usize, stats: &EpochStats, val_loss: f32) -> anyhow::Result<()> {
        if let Some(lr) = self.trainer.scheduler.step(val_loss as f64) {
            self.trainer.optimizer.set_learning_rate(lr);
        }

        let lr = self.trainer.learning_rate();
        self.sink.record_scalar("loss/train", stats.mean_loss, epoch)?;
        self.sink.record_scalar("loss/valid", val_loss, epoch)?;
        self.sink
            .record_scalar("stats/solute_preservation", stats.solute_preservation, epoch)?;
        self.sink
            .record_scalar("stats/solvent_preservation", stats.solvent_preservation, epoch)?;
        self.sink.record_scalar("lr", lr as f32, epoch)?;

        self.pb.inc(1);
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.trainer.evaluator.should_stop()
    }

    fn finish(&mut self, last_epoch: usize, _early_stopped: bool) -> anyhow::Result<()> {
        let val_loss = evaluate_split(self.trainer.model, &self.data.valid)?.mse;
        let test = self.trainer.checkpoint(last_epoch, val_loss, &self.data.test)?;
        self.sink.record_scalar("loss/test", test.mse, last_epoch)?;
        self.sink.record_scalar("mae/test", test.mae, last_epoch)?;

        self.trainer.evaluator.restore_best(self.trainer.varmap)?;
        self.sink.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EarlyStopping;

    /// feeds a fixed validation curve through a real `EarlyStopping`
    struct CurveRunner {
        curve: Vec<f32>,
        eval_freq: usize,
        best: f32,
        early: EarlyStopping,
        trained: Vec<usize>,
        finished: Option<(usize, bool)>,
    }

    impl CurveRunner {
        fn new(curve: Vec<f32>, early_stop: usize, eval_freq: usize) -> Self {
            Self {
                curve,
                eval_freq,
                best: f32::INFINITY,
                early: EarlyStopping::new(
                    TrainConfig {
                        early_stop,
                        eval_freq,
                        ..Default::default()
                    }
                    .early_stop_lag(),
                ),
                trained: vec![],
                finished: None,
            }
        }
    }

    impl EpochRunner for CurveRunner {
        fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<EpochStats> {
            self.trained.push(epoch);
            Ok(EpochStats::default())
        }

        fn evaluate(&mut self, epoch: usize) -> anyhow::Result<f32> {
            let val = self.curve[epoch - 1];
            if epoch % self.eval_freq == 0 {
                self.best = self.best.min(val);
                self.early.push(self.best);
            }
            Ok(val)
        }

        fn schedule(&mut self, _: usize, _: &EpochStats, _: f32) -> anyhow::Result<()> {
            Ok(())
        }

        fn should_stop(&self) -> bool {
            self.early.should_stop()
        }

        fn finish(&mut self, last_epoch: usize, early_stopped: bool) -> anyhow::Result<()> {
            self.finished = Some((last_epoch, early_stopped));
            Ok(())
        }
    }

    #[test]
    fn flat_curve_stops_after_lag_plus_one_checkpoints() -> anyhow::Result<()> {
        // lag = 3 checkpoints, one per epoch
        let mut runner = CurveRunner::new(vec![1.0; 20], 3, 1);
        let outcome = run_epochs(&mut runner, 20)?;
        assert_eq!(
            outcome,
            EpochLoopOutcome {
                epochs_run: 4,
                early_stopped: true
            }
        );
        assert_eq!(runner.trained, vec![1, 2, 3, 4]);
        assert_eq!(runner.finished, Some((4, true)));
        Ok(())
    }

    #[test]
    fn sparse_checkpoints_scale_the_lag() -> anyhow::Result<()> {
        // lag = 10 / 5 = 2 checkpoints at epochs 5, 10, 15
        let mut runner = CurveRunner::new(vec![2.0; 40], 10, 5);
        let outcome = run_epochs(&mut runner, 40)?;
        assert_eq!(outcome.epochs_run, 15);
        assert!(outcome.early_stopped);
        Ok(())
    }

    #[test]
    fn improving_curve_runs_to_the_budget() -> anyhow::Result<()> {
        let curve: Vec<f32> = (0..8).map(|i| 1.0 / (i + 1) as f32).collect();
        let mut runner = CurveRunner::new(curve, 2, 1);
        let outcome = run_epochs(&mut runner, 8)?;
        assert_eq!(outcome.epochs_run, 8);
        assert!(!outcome.early_stopped);
        assert_eq!(runner.finished, Some((8, false)));
        Ok(())
    }

    #[test]
    fn zero_budget_only_finishes() -> anyhow::Result<()> {
        let mut runner = CurveRunner::new(vec![], 2, 1);
        let outcome = run_epochs(&mut runner, 0)?;
        assert_eq!(outcome.epochs_run, 0);
        assert!(runner.trained.is_empty());
        assert_eq!(runner.finished, Some((0, false)));
        Ok(())
    }

    #[test]
    fn epoch_stats_average_over_batches() {
        let steps = [
            StepLoss {
                total: 2.,
                solute_preserve_rate: 1.,
                solvent_preserve_rate: 0.5,
                ..Default::default()
            },
            StepLoss {
                total: 4.,
                solute_preserve_rate: 0.,
                solvent_preserve_rate: 0.5,
                ..Default::default()
            },
        ];
        let stats = EpochStats::from_steps(&steps);
        assert_eq!(stats.mean_loss, 3.);
        assert_eq!(stats.solute_preservation, 0.5);
        assert_eq!(stats.solvent_preservation, 0.5);
        assert_eq!(stats.num_batches, 2);
    }
}
