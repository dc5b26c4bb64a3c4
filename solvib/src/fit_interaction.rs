use crate::importance::{score_atoms, write_importance};
use crate::model::{GibModel, GibModelArgs};
use crate::pair_data::{infer_graph_dims, read_pairs_jsonl, PairDataset};
use crate::stats_writer::TsvScalarWriter;
use crate::trainer::{GibTrainer, TrainingData};

use candle_util::candle_inference::TrainConfig;
use clap::{Args, ValueEnum};
use log::info;
use std::io::Write;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        long,
        required = true,
        help = "Training pairs",
        long_help = "Training pairs in JSON lines (optionally gzipped).\n\
		     One record per line:\n\
		     {\"solute\": G, \"solvent\": G, \"target\": y}\n\
		     G = {\"nodes\": [[..]], \"edges\": [[u, v]], \"edge_features\": [[..]]}"
    )]
    train: Box<str>,

    #[arg(
        long,
        required = true,
        help = "Validation pairs",
        long_help = "Validation pairs in the same format as the training pairs.\n\
		     Drives the learning-rate schedule and checkpoint selection."
    )]
    valid: Box<str>,

    #[arg(
        long,
        required = true,
        help = "Test pairs",
        long_help = "Test pairs in the same format as the training pairs.\n\
		     Reported at every evaluation checkpoint."
    )]
    test: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.stats.tsv.gz\n\
		     - {out}.summary.json\n\
		     - {out}.importance.tsv.gz (with --importance)\n"
    )]
    out: Box<str>,

    #[arg(
        long,
        default_value_t = 52,
        help = "Hidden dimension of atom embeddings",
        long_help = "Width of the message passing encoders.\n\
		     Graph embeddings are four times as wide."
    )]
    hidden_dim: usize,

    #[arg(
        long,
        default_value_t = 3,
        help = "Number of message passing steps"
    )]
    message_passing: usize,

    #[arg(long, default_value_t = 2, help = "Number of Set2Set attention steps")]
    set2set_steps: usize,

    #[arg(
        long,
        default_value_t = 1.0,
        help = "KL weight",
        long_help = "Weight of the solute and solvent KL terms (beta).\n\
		     Larger values squeeze more atoms out of the representation."
    )]
    beta: f32,

    #[arg(long, default_value_t = 1e-3, help = "Learning rate")]
    learning_rate: f32,

    #[arg(
        long,
        default_value_t = 0.0,
        help = "Weight decay",
        long_help = "Decoupled weight decay of the AdamW optimizer."
    )]
    weight_decay: f32,

    #[arg(long, default_value_t = 32, help = "Minibatch size")]
    minibatch_size: usize,

    #[arg(long, short = 'i', default_value_t = 500, help = "Number of training epochs")]
    epochs: usize,

    #[arg(
        long,
        default_value_t = 50,
        help = "Early stopping patience (epochs)",
        long_help = "Stop when the best validation loss has not improved\n\
		     for this many epochs (checked at evaluation checkpoints)."
    )]
    early_stop: usize,

    #[arg(
        long,
        default_value_t = 5,
        help = "Evaluation interval (epochs)",
        long_help = "Evaluate on the test pairs and update the best checkpoint\n\
		     every this many epochs."
    )]
    eval_freq: usize,

    #[arg(
        long,
        default_value_t = 20,
        help = "Learning rate patience (epochs)",
        long_help = "Multiply the learning rate by --lr-factor after the\n\
		     validation loss stalls for more than this many epochs."
    )]
    lr_patience: usize,

    #[arg(long, default_value_t = 0.1, help = "Learning rate decay factor")]
    lr_factor: f32,

    #[arg(
        long,
        default_value_t = false,
        help = "Dump per-atom importance",
        long_help = "Score every test atom with the compressors of the best\n\
		     checkpoint and write {out}.importance.tsv.gz"
    )]
    importance: bool,

    #[arg(long, default_value_t = 42, help = "Random seed for minibatch shuffling")]
    seed: u64,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or metal, we may want to choose a different device."
    )]
    device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

impl TrainArgs {
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

pub fn fit_interaction_model(args: &TrainArgs) -> anyhow::Result<()> {
    let dev = match args.device {
        ComputeDevice::Metal => candle_core::Device::new_metal(args.device_no)?,
        ComputeDevice::Cuda => candle_core::Device::new_cuda(args.device_no)?,
        _ => candle_core::Device::Cpu,
    };

    let config = TrainConfig {
        learning_rate: args.learning_rate,
        weight_decay: args.weight_decay,
        beta: args.beta,
        num_message_passing: args.message_passing,
        batch_size: args.minibatch_size,
        num_epochs: args.epochs,
        early_stop: args.early_stop,
        eval_freq: args.eval_freq,
        lr_patience: args.lr_patience,
        lr_factor: args.lr_factor,
        device: dev.clone(),
        show_progress: true,
        verbose: args.verbose,
    };
    config.validate()?;

    // 1. Read the three splits, feature widths come from training
    let train_pairs = read_pairs_jsonl(&args.train)?;
    let dims = infer_graph_dims(&train_pairs)?;
    info!("atom features: {}, bond features: {}", dims.node, dims.edge);

    let train = PairDataset::new(train_pairs, dims)?;
    let valid = PairDataset::from_jsonl(&args.valid, dims)?;
    let test = PairDataset::from_jsonl(&args.test, dims)?;
    let mut data = TrainingData::new(train, valid, test, config.batch_size, &dev)?;

    // 2. Build the model
    let parameters = candle_nn::VarMap::new();
    let param_builder =
        candle_nn::VarBuilder::from_varmap(&parameters, candle_core::DType::F32, &dev);

    let model = GibModel::new(
        &GibModelArgs {
            n_node_features: dims.node,
            n_edge_features: dims.edge,
            n_hidden: args.hidden_dim,
            num_message_passing: config.num_message_passing,
            num_set2set_steps: args.set2set_steps,
        },
        param_builder,
    )?;
    info!("{} dense layers", model.dense_layers().len());

    // 3. Train with early stopping
    let mut sink = TsvScalarWriter::create(&(args.out.to_string() + ".stats.tsv.gz"))?;
    let mut trainer = GibTrainer::new(&model, &parameters, &config)?;
    let summary = trainer.fit(&mut data, &mut sink, args.seed)?;

    info!(
        "best epoch {}: valid {:.4}, test mse {:.4}, mae {:.4}",
        summary.best_epoch, summary.best_val_loss, summary.best_test_loss, summary.best_test_mae
    );

    let summary_file = args.out.to_string() + ".summary.json";
    let mut writer = crate::common_io::open_buf_writer(&summary_file)?;
    serde_json::to_writer_pretty(&mut writer, &summary)?;
    writeln!(writer)?;
    writer.flush()?;

    // 4. Score atoms with the restored parameters
    if args.importance {
        let scores = score_atoms(&model, &data.test)?;
        let outfile = args.out.to_string() + ".importance.tsv.gz";
        write_importance(&scores, &outfile)?;
        info!("wrote {} atom scores to {}", scores.len(), outfile);
    }

    Ok(())
}
