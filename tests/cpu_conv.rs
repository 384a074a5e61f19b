use briny_conv::config::ConvOptions;
use briny_conv::conv::{convolution_selection, convolution_with};
use briny_conv::descriptor::{OperandRole, OperationNode};
use briny_conv::dtype::DataType;
use briny_conv::engine::HeuristicMode;
use briny_conv::error::ConvError;
use briny_conv::graph::OperationGraph;
use briny_conv::plan::{Bindings, PlanBackend, execute_first_viable};
use briny_conv::runtime::Runtime;
use briny_conv::runtime::cpu::{CpuContext, CpuEngine, CpuRuntime};
use briny_conv::shape::ConvParams;
use briny_conv::tensor::{DeviceId, MemoryFormat, Storage, Tensor, strides_for};
use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random(len: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

fn tensor_f32(shape: &[usize], seed: u64) -> Tensor {
    let data = random(shape.iter().product(), seed).into_iter().map(|v| v as f32).collect::<Vec<_>>();
    Tensor::from_vec(shape.to_vec(), data)
}

fn tensor_f64(shape: &[usize], seed: u64) -> Tensor {
    Tensor::from_vec(shape.to_vec(), random(shape.iter().product(), seed))
}

fn tensor_f16(shape: &[usize], seed: u64) -> Tensor {
    let data = random(shape.iter().product(), seed).into_iter().map(f16::from_f64).collect::<Vec<_>>();
    Tensor::from_vec(shape.to_vec(), data)
}

fn indices(shape: &[usize]) -> Vec<Vec<usize>> {
    let mut all = vec![Vec::new()];
    for &d in shape {
        all = all.into_iter().flat_map(|prefix| (0..d).map(move |i| [prefix.clone(), vec![i]].concat())).collect();
    }
    all
}

/// Textbook cross-correlation over logical indices.
fn reference(x: &Tensor, w: &Tensor, p: &ConvParams) -> (Vec<usize>, Vec<f64>) {
    let (xs, ws) = (x.shape(), w.shape());
    let spatial = xs.len() - 2;
    let mut shape = vec![xs[0], ws[0]];
    for d in 0..spatial {
        let span = p.dilation[d] * (ws[d + 2] - 1) + 1;
        shape.push((xs[d + 2] + 2 * p.padding[d] - span) / p.stride[d] + 1);
    }

    let cpg = ws[1];
    let kpg = ws[0] / p.groups;
    let kernel = indices(&ws[2..]);
    let values = indices(&shape)
        .into_iter()
        .map(|idx| {
            let (n, co) = (idx[0], idx[1]);
            let first = (co / kpg) * cpg;
            let mut acc = 0.0;
            for ci in 0..cpg {
                'points: for k in &kernel {
                    let mut xi = vec![n, first + ci];
                    for d in 0..spatial {
                        let pos = (idx[d + 2] * p.stride[d] + k[d] * p.dilation[d]) as isize - p.padding[d] as isize;
                        if pos < 0 || pos as usize >= xs[d + 2] {
                            continue 'points;
                        }
                        xi.push(pos as usize);
                    }
                    let wi = [vec![co, ci], k.clone()].concat();
                    acc += x.get(&xi).unwrap() * w.get(&wi).unwrap();
                }
            }
            acc
        })
        .collect();
    (shape, values)
}

fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol * (1.0 + e.abs()), "element {i}: {a} vs {e}");
    }
}

fn check(x: &Tensor, w: &Tensor, p: &ConvParams, options: ConvOptions, tol: f64) -> &'static str {
    let (y, selection) = convolution_selection(&CpuRuntime::new(), x, w, p, &options).unwrap();
    let (shape, expected) = reference(x, w, p);
    assert_eq!(y.shape(), &shape[..]);
    assert_eq!(y.data_type(), x.data_type());
    assert_close(&y.to_vec_f64(), &expected, tol);
    selection.unwrap().engine.name
}

fn graph_for(x: &Tensor, w: &Tensor, y_shape: &[usize], p: &ConvParams) -> OperationGraph<CpuContext> {
    let y = Tensor::zeros(y_shape.to_vec(), x.data_type(), DeviceId(0), MemoryFormat::Contiguous);
    let node = OperationNode::conv_forward(x, &y, w, p).unwrap();
    let ctx = CpuRuntime::new().context(DeviceId(0)).unwrap();
    OperationGraph::builder().context(ctx).operation(node).build().unwrap()
}

#[test]
fn float_2d_matches_reference_via_im2col() {
    let x = tensor_f32(&[2, 3, 7, 6], 1);
    let w = tensor_f32(&[4, 3, 3, 3], 2);
    let p = ConvParams::new(2).padding([1, 2]).stride([2, 1]).dilation([1, 2]);
    assert_eq!(check(&x, &w, &p, ConvOptions::default(), 1e-5), "im2col_gemm");
}

#[test]
fn grouped_convolution_skips_im2col() {
    let x = tensor_f32(&[1, 4, 5, 5], 3);
    let w = tensor_f32(&[6, 2, 3, 3], 4);
    let p = ConvParams::new(2).padding([1, 1]).groups(2);
    assert_eq!(check(&x, &w, &p, ConvOptions::default(), 1e-5), "split_reduce");
    assert_eq!(check(&x, &w, &p, ConvOptions::default().deterministic(true), 1e-5), "direct");
}

#[test]
fn depthwise_convolution() {
    let x = tensor_f64(&[2, 3, 6, 6], 5);
    let w = tensor_f64(&[3, 1, 3, 3], 6);
    let p = ConvParams::new(2).groups(3).stride([2, 2]);
    check(&x, &w, &p, ConvOptions::default(), 1e-12);
}

#[test]
fn workspace_limit_falls_through_to_next_engine() {
    let x = tensor_f32(&[1, 2, 6, 6], 7);
    let w = tensor_f32(&[2, 2, 3, 3], 8);
    let p = ConvParams::new(2);
    let rt = CpuRuntime::new().with_workspace_limit(64);
    let (y, selection) = convolution_selection(&rt, &x, &w, &p, &ConvOptions::default()).unwrap();
    let selection = selection.unwrap();
    assert_eq!(selection.engine.name, "split_reduce");
    assert_eq!(selection.attempts, 2);
    assert_close(&y.to_vec_f64(), &reference(&x, &w, &p).1, 1e-5);
}

#[test]
fn long_reductions_prefer_split_reduce() {
    let x = tensor_f32(&[1, 512, 3, 3], 9);
    let w = tensor_f32(&[2, 512, 3, 3], 10);
    let p = ConvParams::new(2);
    assert_eq!(check(&x, &w, &p, ConvOptions::default(), 1e-4), "split_reduce");
    assert_eq!(check(&x, &w, &p, ConvOptions::default().deterministic(true), 1e-4), "im2col_gemm");
}

#[test]
fn one_and_three_dimensional_convolutions() {
    let x = tensor_f32(&[2, 2, 11], 11);
    let w = tensor_f32(&[3, 2, 4], 12);
    check(&x, &w, &ConvParams::new(1).padding([2]).stride([3]).dilation([2]), ConvOptions::default(), 1e-5);

    let x = tensor_f64(&[1, 2, 4, 5, 3], 13);
    let w = tensor_f64(&[2, 2, 2, 3, 2], 14);
    check(&x, &w, &ConvParams::new(3).padding([1, 0, 1]), ConvOptions::default(), 1e-12);
}

#[test]
fn half_precision_is_narrowed_once() {
    let x = tensor_f16(&[1, 3, 5, 5], 15);
    let w = tensor_f16(&[2, 3, 3, 3], 16);
    assert_eq!(check(&x, &w, &ConvParams::new(2).padding([1, 1]), ConvOptions::default(), 2e-3), "im2col_gemm");
}

#[test]
fn channels_last_operands_produce_channels_last_output() {
    let x = tensor_f32(&[2, 3, 5, 4], 17).contiguous(MemoryFormat::ChannelsLast);
    let w = tensor_f32(&[4, 3, 2, 2], 18);
    let p = ConvParams::new(2).padding([1, 0]);
    let y = convolution_with(&CpuRuntime::new(), &x, &w, &p, &ConvOptions::default()).unwrap();
    let (shape, expected) = reference(&x, &w, &p);
    assert_eq!(y.strides(), &strides_for(&shape, MemoryFormat::ChannelsLast)[..]);
    assert_eq!(y.suggest_memory_format(), MemoryFormat::ChannelsLast);
    assert_close(&y.to_vec_f64(), &expected, 1e-5);
}

#[test]
fn strided_input_is_made_contiguous() {
    // [1, 1, 3, 3] view over every other element of an 18-element buffer
    let storage = Storage::from((0..18).map(|v| v as f32).collect::<Vec<_>>());
    let x = Tensor::with_strides(vec![1, 1, 3, 3], vec![18, 18, 6, 2], storage).unwrap();
    let w = Tensor::from_vec(vec![1, 1, 2, 2], vec![1.0f32, 0.0, 0.0, 1.0]);
    let y = convolution_with(&CpuRuntime::new(), &x, &w, &ConvParams::new(2), &ConvOptions::default()).unwrap();
    assert_eq!(y.to_vec_f64(), vec![8.0, 12.0, 20.0, 24.0]);
}

#[test]
fn integer_operands_are_rejected() {
    let x = Tensor::from_vec(vec![1, 1, 3, 3], vec![1i32; 9]);
    let w = Tensor::from_vec(vec![1, 1, 2, 2], vec![1i32; 4]);
    let err = convolution_with(&CpuRuntime::new(), &x, &w, &ConvParams::new(2), &ConvOptions::default()).unwrap_err();
    assert!(matches!(err, ConvError::UnsupportedDataType(DataType::Int32)));
}

#[test]
fn invalid_arguments_are_reported() {
    let rt = CpuRuntime::new();
    let opts = ConvOptions::default();
    let x = tensor_f32(&[1, 2, 3, 3], 19);

    let oversized = tensor_f32(&[1, 2, 5, 5], 20);
    assert!(matches!(convolution_with(&rt, &x, &oversized, &ConvParams::new(2), &opts), Err(ConvError::InvalidArgument(_))));

    let wrong_channels = tensor_f32(&[1, 3, 2, 2], 21);
    assert!(matches!(convolution_with(&rt, &x, &wrong_channels, &ConvParams::new(2), &opts), Err(ConvError::InvalidArgument(_))));

    let w = tensor_f32(&[1, 2, 2, 2], 22);
    assert!(matches!(convolution_with(&rt, &x, &w, &ConvParams::new(1), &opts), Err(ConvError::InvalidArgument(_))));
    assert!(matches!(convolution_with(&rt, &x, &w, &ConvParams::new(2).stride([0, 1]), &opts), Err(ConvError::InvalidArgument(_))));
    assert!(matches!(convolution_with(&rt, &x, &w, &ConvParams::new(2), &opts.benchmark(true)), Err(ConvError::BenchmarkUnsupported)));
}

#[test]
fn heuristic_ranking_per_data_type() {
    let rt = CpuRuntime::new();
    let p = ConvParams::new(2);
    let names = |g: &OperationGraph<CpuContext>| -> Vec<&'static str> {
        rt.engine_configs(g, HeuristicMode::Instant).iter().map(|c| c.name).collect()
    };

    let g = graph_for(&tensor_f64(&[1, 2, 4, 4], 23), &tensor_f64(&[1, 2, 3, 3], 24), &[1, 1, 2, 2], &p);
    assert_eq!(names(&g), vec!["im2col_gemm", "split_reduce", "direct", "down_convert"]);

    let g = graph_for(&tensor_f16(&[1, 2, 4, 4], 25), &tensor_f16(&[1, 2, 3, 3], 26), &[1, 1, 2, 2], &p);
    assert_eq!(names(&g), vec!["im2col_gemm", "split_reduce", "direct"]);

    let g = graph_for(&tensor_f64(&[1, 512, 3, 3], 27), &tensor_f64(&[1, 512, 3, 3], 28), &[1, 1, 1, 1], &p);
    assert_eq!(names(&g), vec!["split_reduce", "im2col_gemm", "direct", "down_convert"]);

    let g = graph_for(&tensor_f32(&[1, 2, 4, 4], 29), &tensor_f32(&[1, 2, 3, 3], 30), &[1, 1, 2, 2], &p);
    let ranked = names(&g);
    let without_tf32: Vec<_> = ranked.iter().copied().filter(|n| *n != "tf32").collect();
    assert_eq!(without_tf32, vec!["im2col_gemm", "split_reduce", "direct", "down_convert"]);
    if g.root().min_alignment() < 16 {
        assert_eq!(ranked.last(), Some(&"tf32"));
    } else {
        assert_eq!(ranked.first(), Some(&"tf32"));
    }

    assert_eq!(rt.engine_configs(&g, HeuristicMode::Fallback).len(), 1);
}

#[test]
fn reduced_precision_engines_compile_only_where_meaningful() {
    let rt = CpuRuntime::new();
    let p = ConvParams::new(2);
    let half = graph_for(&tensor_f16(&[1, 1, 3, 3], 31), &tensor_f16(&[1, 1, 2, 2], 32), &[1, 1, 2, 2], &p);
    assert!(rt.compile(&half, &CpuEngine::DownConvert.config()).is_err());
    assert!(rt.compile(&half, &CpuEngine::Tf32.config()).is_err());

    let double = graph_for(&tensor_f64(&[1, 1, 3, 3], 33), &tensor_f64(&[1, 1, 2, 2], 34), &[1, 1, 2, 2], &p);
    assert!(rt.compile(&double, &CpuEngine::DownConvert.config()).is_ok());
    assert!(rt.compile(&double, &CpuEngine::Tf32.config()).is_err());
}

#[test]
fn down_convert_rounds_operands_through_f32() {
    let x = tensor_f64(&[1, 2, 4, 4], 35);
    let w = tensor_f64(&[2, 2, 3, 3], 36);
    let p = ConvParams::new(2);
    let g = graph_for(&x, &w, &[1, 2, 2, 2], &p);
    let mut y = Storage::zeros(DataType::Double, 8);
    let mut bindings = Bindings::new()
        .read(OperandRole::Input, x.storage())
        .read(OperandRole::Weight, w.storage())
        .write(OperandRole::Output, &mut y);

    let selection = execute_first_viable(&CpuRuntime::new(), &g, &[CpuEngine::DownConvert.config()], &mut bindings).unwrap();
    drop(bindings);
    assert_eq!(selection.engine.name, "down_convert");

    let actual: Vec<f64> = (0..8).map(|i| y.get_f64(i).unwrap()).collect();
    assert_close(&actual, &reference(&x, &w, &p).1, 1e-5);
}

#[test]
fn wrongly_typed_output_aborts_the_search() {
    let x = tensor_f32(&[1, 1, 3, 3], 37);
    let w = tensor_f32(&[1, 1, 2, 2], 38);
    let g = graph_for(&x, &w, &[1, 1, 2, 2], &ConvParams::new(2));
    let mut y = Storage::zeros(DataType::Double, 4);
    let mut bindings = Bindings::new()
        .read(OperandRole::Input, x.storage())
        .read(OperandRole::Weight, w.storage())
        .write(OperandRole::Output, &mut y);
    let configs = [CpuEngine::Direct.config(), CpuEngine::SplitReduce.config(), CpuEngine::Im2colGemm.config()];
    let err = execute_first_viable(&CpuRuntime::new(), &g, &configs, &mut bindings).unwrap_err();
    assert!(matches!(err, ConvError::Internal(_)), "{err}");
}

#[test]
fn wrongly_typed_input_aborts_the_search() {
    let x = tensor_f64(&[1, 1, 3, 3], 41);
    let w = tensor_f32(&[1, 1, 2, 2], 42);
    let g = graph_for(&tensor_f32(&[1, 1, 3, 3], 41), &w, &[1, 1, 2, 2], &ConvParams::new(2));
    let mut y = Storage::zeros(DataType::Float, 4);
    let mut bindings = Bindings::new()
        .read(OperandRole::Input, x.storage())
        .read(OperandRole::Weight, w.storage())
        .write(OperandRole::Output, &mut y);
    let err = execute_first_viable(&CpuRuntime::new(), &g, &[CpuEngine::Direct.config()], &mut bindings).unwrap_err();
    assert!(matches!(err, ConvError::Internal(_)), "{err}");
}

#[test]
fn overflowing_dilation_is_invalid() {
    let x = tensor_f32(&[1, 1, 4], 43);
    let w = tensor_f32(&[1, 1, 3], 44);
    let params = ConvParams::new(1).dilation([usize::MAX / 2 + 1]);
    let err = convolution_with(&CpuRuntime::new(), &x, &w, &params, &ConvOptions::default()).unwrap_err();
    assert!(matches!(err, ConvError::InvalidArgument(_)), "{err}");
}

#[test]
fn overflowing_padding_is_invalid() {
    let x = tensor_f32(&[1, 1, 4], 45);
    let w = tensor_f32(&[1, 1, 3], 46);
    let params = ConvParams::new(1).padding([usize::MAX / 2 + 1]);
    let err = convolution_with(&CpuRuntime::new(), &x, &w, &params, &ConvOptions::default()).unwrap_err();
    assert!(matches!(err, ConvError::InvalidArgument(_)), "{err}");
}

#[test]
fn missing_or_undersized_buffers_are_fatal() {
    let x = tensor_f32(&[1, 1, 3, 3], 39);
    let w = tensor_f32(&[1, 1, 2, 2], 40);
    let g = graph_for(&x, &w, &[1, 1, 2, 2], &ConvParams::new(2));
    let configs = [CpuEngine::Direct.config(), CpuEngine::SplitReduce.config()];

    let mut unbound = Bindings::new().read(OperandRole::Input, x.storage()).read(OperandRole::Weight, w.storage());
    let err = execute_first_viable(&CpuRuntime::new(), &g, &configs, &mut unbound).unwrap_err();
    assert!(matches!(err, ConvError::Internal(_)));

    let mut small = Storage::zeros(DataType::Float, 3);
    let mut undersized = Bindings::new()
        .read(OperandRole::Input, x.storage())
        .read(OperandRole::Weight, w.storage())
        .write(OperandRole::Output, &mut small);
    let err = execute_first_viable(&CpuRuntime::new(), &g, &configs, &mut undersized).unwrap_err();
    assert!(matches!(err, ConvError::Internal(_)));
}

#[test]
fn contexts_are_reused_per_thread() {
    let rt = CpuRuntime::new();
    let a = rt.context(DeviceId(3)).unwrap();
    let b = rt.context(DeviceId(3)).unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));

    let other = std::thread::spawn(move || CpuRuntime::new().context(DeviceId(3)).unwrap()).join().unwrap();
    assert!(!std::sync::Arc::ptr_eq(&a, &other));
    assert_eq!(other.device, DeviceId(3));
}
