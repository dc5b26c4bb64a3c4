use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Activation, Module, VarBuilder, VarMap};

use candle_util::candle_aux_layers::xavier_stack;
use candle_util::candle_model_traits::SetPoolT;
use candle_util::candle_scatter::membership_from_sizes;
use candle_util::candle_set2set::Set2Set;

#[test]
fn xavier_stack_forward_test() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let fc = xavier_stack(16, &[8, 4, 1], Activation::Relu, vb.pp("head"))?;
    assert_eq!(fc.len(), 3);

    for layer in fc.layers() {
        let bias = layer.bias().expect("dense layers carry a bias");
        assert_eq!(bias.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
    }

    let y = fc.forward(&Tensor::randn(0f32, 1f32, (5, 16), &dev)?)?;
    assert_eq!(y.dims(), &[5, 1]);
    Ok(())
}

#[test]
fn set2set_output_per_graph_test() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let left = Set2Set::new(10, 2, vb.pp("left"))?;
    let right = Set2Set::new(10, 2, vb.pp("right"))?;

    // separate instances own separate parameters
    let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
    assert!(names.iter().any(|n| n.starts_with("left.")));
    assert!(names.iter().any(|n| n.starts_with("right.")));

    let memb = membership_from_sizes(&[3, 2], &dev)?;
    let x = Tensor::randn(0f32, 1f32, (5, 10), &dev)?;
    assert_eq!(left.pool(&x, &memb)?.dims(), &[2, 20]);
    assert_eq!(right.pool(&x, &memb)?.dims(), &[2, 20]);
    Ok(())
}
