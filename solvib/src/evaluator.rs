use crate::model::GibModel;
use crate::pair_data::PairBatch;

use candle_core::Tensor;
use candle_nn::VarMap;
use candle_util::candle_loss_functions::{sae, sse};
use candle_util::candle_model_traits::GraphEncoderT;
use log::info;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
pub struct SplitMetrics {
    pub mse: f32,
    pub mae: f32,
}

/// Plain-mode MSE and MAE over all pairs of `batches`
pub fn evaluate_split<Enc>(model: &GibModel<Enc>, batches: &[PairBatch]) -> anyhow::Result<SplitMetrics>
where
    Enc: GraphEncoderT,
{
    let mut sq_tot = 0f32;
    let mut abs_tot = 0f32;
    let mut ntot = 0usize;

    for batch in batches {
        let out = model.forward_plain(batch, false, false)?;
        sq_tot += sse(&out.prediction, &batch.target)?.to_scalar::<f32>()?;
        abs_tot += sae(&out.prediction, &batch.target)?.to_scalar::<f32>()?;
        ntot += batch.num_pairs();
    }

    if ntot == 0 {
        return Err(anyhow::anyhow!("nothing to evaluate"));
    }

    Ok(SplitMetrics {
        mse: sq_tot / ntot as f32,
        mae: abs_tot / ntot as f32,
    })
}

/// Deep copy of every variable in a `VarMap`
pub struct ParamSnapshot {
    params: HashMap<String, Tensor>,
}

impl ParamSnapshot {
    pub fn capture(varmap: &VarMap) -> anyhow::Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("variable map lock: {}", e))?;

        let mut params = HashMap::with_capacity(data.len());
        for (name, var) in data.iter() {
            params.insert(name.clone(), var.as_tensor().detach().copy()?);
        }
        Ok(Self { params })
    }

    /// Write the stored values back into the variables of `varmap`
    pub fn restore(&self, varmap: &VarMap) -> anyhow::Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("variable map lock: {}", e))?;

        for (name, var) in data.iter() {
            let saved = self
                .params
                .get(name)
                .ok_or(anyhow::anyhow!("{} is missing in the snapshot", name))?;
            var.set(saved)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Stop once the best validation loss has not moved for `lag`
/// evaluation checkpoints.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    lag: usize,
    best_val_losses: Vec<f32>,
}

impl EarlyStopping {
    /// * `lag` - evaluation checkpoints without improvement
    ///   before stopping
    pub fn new(lag: usize) -> Self {
        Self {
            lag,
            best_val_losses: vec![],
        }
    }

    pub fn lag(&self) -> usize {
        self.lag
    }

    pub fn push(&mut self, best_val_loss: f32) {
        self.best_val_losses.push(best_val_loss);
    }

    pub fn best_val_losses(&self) -> &[f32] {
        &self.best_val_losses
    }

    /// `seq[last] == seq[last - lag]` with more than `lag` entries
    pub fn should_stop(&self) -> bool {
        let n = self.best_val_losses.len();
        self.lag > 0 && n > self.lag && self.best_val_losses[n - 1] == self.best_val_losses[n - 1 - self.lag]
    }
}

/// Best-checkpoint bookkeeping over the epochs
pub struct Evaluator {
    eval_freq: usize,
    best_epoch: usize,
    best_val_loss: f32,
    best_test: Option<SplitMetrics>,
    snapshot: Option<ParamSnapshot>,
    early_stopping: EarlyStopping,
}

impl Evaluator {
    /// * `eval_freq` - epochs between evaluation checkpoints
    /// * `early_stop_lag` - see `TrainConfig::early_stop_lag`
    pub fn new(eval_freq: usize, early_stop_lag: usize) -> Self {
        Self {
            eval_freq: eval_freq.max(1),
            best_epoch: 0,
            best_val_loss: f32::INFINITY,
            best_test: None,
            snapshot: None,
            early_stopping: EarlyStopping::new(early_stop_lag),
        }
    }

    /// epochs are counted from 1
    pub fn is_checkpoint(&self, epoch: usize) -> bool {
        epoch % self.eval_freq == 0
    }

    /// Remember `epoch` if its validation loss is the lowest so far
    /// and extend the early-stopping sequence.
    ///
    /// # Returns whether the validation loss improved
    pub fn checkpoint(
        &mut self,
        epoch: usize,
        val_loss: f32,
        test: SplitMetrics,
        varmap: &VarMap,
    ) -> anyhow::Result<bool> {
        let improved = val_loss < self.best_val_loss;
        if improved {
            self.best_epoch = epoch;
            self.best_val_loss = val_loss;
            self.best_test = Some(test);
            self.snapshot = Some(ParamSnapshot::capture(varmap)?);
            info!(
                "[{}] best validation {:.4}, test mse {:.4}, mae {:.4}",
                epoch, val_loss, test.mse, test.mae
            );
        }
        self.early_stopping.push(self.best_val_loss);
        Ok(improved)
    }

    pub fn should_stop(&self) -> bool {
        self.early_stopping.should_stop()
    }

    /// Put the best parameters back; `false` if nothing was recorded
    pub fn restore_best(&self, varmap: &VarMap) -> anyhow::Result<bool> {
        match self.snapshot.as_ref() {
            Some(snapshot) => {
                snapshot.restore(varmap)?;
                info!("restored parameters of epoch {}", self.best_epoch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn best_val_loss(&self) -> f32 {
        self.best_val_loss
    }

    pub fn best_test(&self) -> Option<SplitMetrics> {
        self.best_test
    }

    pub fn early_stopping(&self) -> &EarlyStopping {
        &self.early_stopping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn early_stopping_compares_lagged_entry() {
        let mut es = EarlyStopping::new(3);
        assert_eq!(es.lag(), 3);
        for v in [3., 2., 2.] {
            es.push(v);
            assert!(!es.should_stop());
        }
        // [3, 2, 2, 2]: last vs. first differ
        es.push(2.);
        assert!(!es.should_stop());
        // [3, 2, 2, 2, 2]: no change over three checkpoints
        es.push(2.);
        assert!(es.should_stop());
    }

    #[test]
    fn snapshot_restores_values() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let w = vb.get_with_hints((2, 2), "w", Init::Const(1.))?;

        let snapshot = ParamSnapshot::capture(&varmap)?;
        assert_eq!(snapshot.len(), 1);

        {
            let data = varmap.data().lock().unwrap();
            data["w"].set(&Tensor::zeros((2, 2), DType::F32, &dev)?)?;
        }
        assert_eq!(w.sum_all()?.to_scalar::<f32>()?, 0.);

        snapshot.restore(&varmap)?;
        assert_eq!(w.sum_all()?.to_scalar::<f32>()?, 4.);
        Ok(())
    }

    #[test]
    fn evaluator_keeps_the_best_epoch() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut eval = Evaluator::new(2, 2);
        assert!(!eval.is_checkpoint(1));
        assert!(eval.is_checkpoint(2));

        let m = |x: f32| SplitMetrics { mse: x, mae: x };
        assert!(eval.checkpoint(2, 1.0, m(0.9), &varmap)?);
        assert!(!eval.checkpoint(4, 1.5, m(0.1), &varmap)?);
        assert_eq!(eval.best_epoch(), 2);
        assert_eq!(eval.best_test(), Some(m(0.9)));
        assert!(!eval.should_stop());
        eval.checkpoint(6, 1.2, m(0.5), &varmap)?;
        assert!(eval.should_stop());
        Ok(())
    }
}
