use crate::common_io::open_buf_writer;
use crate::model::GibModel;
use crate::pair_data::PairBatch;

use candle_util::candle_model_traits::GraphEncoderT;
use std::io::Write;

/// One scored atom
#[derive(Clone, Debug, PartialEq)]
pub struct AtomImportance {
    pub pair: usize,
    pub side: &'static str,
    pub atom: usize,
    pub logit: f32,
    pub gate: f32,
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

fn score_side(
    logits: &candle_core::Tensor,
    sizes: &[usize],
    pair_offset: usize,
    side: &'static str,
    out: &mut Vec<AtomImportance>,
) -> anyhow::Result<()> {
    let logits: Vec<f32> = logits.flatten_all()?.to_vec1()?;
    let mut cursor = 0;
    for (g, &n) in sizes.iter().enumerate() {
        for atom in 0..n {
            let logit = *logits
                .get(cursor)
                .ok_or(anyhow::anyhow!("{} logits shorter than the atoms", side))?;
            out.push(AtomImportance {
                pair: pair_offset + g,
                side,
                atom,
                logit,
                gate: sigmoid(logit),
            });
            cursor += 1;
        }
    }
    Ok(())
}

/// Compressor logits of every atom in `batches`, taken from a plain
/// introspection pass; pairs are numbered across batches
pub fn score_atoms<Enc>(model: &GibModel<Enc>, batches: &[PairBatch]) -> anyhow::Result<Vec<AtomImportance>>
where
    Enc: GraphEncoderT,
{
    let mut ret = vec![];
    let mut offset = 0;
    for batch in batches {
        let ckpt = model.forward_plain(batch, false, true)?.into_checkpoints()?;
        score_side(&ckpt.solute_importance, &batch.solute.sizes, offset, "solute", &mut ret)?;
        score_side(&ckpt.solvent_importance, &batch.solvent.sizes, offset, "solvent", &mut ret)?;
        offset += batch.num_pairs();
    }
    Ok(ret)
}

pub fn write_importance(scores: &[AtomImportance], output_file: &str) -> anyhow::Result<()> {
    let mut writer = open_buf_writer(output_file)?;
    writeln!(writer, "pair\tside\tatom\tlogit\tgate")?;
    for s in scores {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}",
            s.pair, s.side, s.atom, s.logit, s.gate
        )?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn atoms_are_numbered_within_pairs() -> anyhow::Result<()> {
        let logits = Tensor::new(&[[0f32], [1.], [-1.], [2.], [3.]], &Device::Cpu)?;
        let mut out = vec![];
        score_side(&logits, &[2, 3], 4, "solvent", &mut out)?;

        assert_eq!(out.len(), 5);
        assert_eq!((out[1].pair, out[1].atom), (4, 1));
        assert_eq!((out[2].pair, out[2].atom), (5, 0));
        approx::assert_abs_diff_eq!(out[0].gate, 0.5, epsilon = 1e-6);

        assert!(score_side(&logits, &[4, 4], 0, "solute", &mut vec![]).is_err());
        Ok(())
    }
}
