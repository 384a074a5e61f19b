use briny_conv::dtype::DataType;
use briny_conv::tensor::{DeviceId, MemoryFormat, Storage, Tensor};

#[test]
fn test_tensor_creation() {
    let t = Tensor::from_vec(vec![2, 2], vec![1.0f64, 2.0, 3.0, 4.0]);
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.strides(), &[2, 1]);
    assert_eq!(t.data_type(), DataType::Double);
    assert_eq!(t.to_vec_f64(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_tensor_shape_mismatch_panics() {
    let result = std::panic::catch_unwind(|| {
        Tensor::from_vec(vec![2, 2], vec![1.0f32, 2.0, 3.0]);
    });
    assert!(result.is_err());
}

#[test]
fn test_zeros_in_channels_last() {
    let t = Tensor::zeros(vec![2, 3, 4, 5], DataType::Half, DeviceId(1), MemoryFormat::ChannelsLast);
    assert_eq!(t.strides(), &[60, 1, 15, 3]);
    assert_eq!(t.device(), DeviceId(1));
    assert_eq!(t.numel(), 120);
    assert!(t.to_vec_f64().iter().all(|&v| v == 0.0));
}

#[test]
fn test_logical_reads_follow_strides() {
    // column-major view of [[0, 1, 2], [3, 4, 5]]
    let storage = Storage::from(vec![0.0f32, 3.0, 1.0, 4.0, 2.0, 5.0]);
    let t = Tensor::with_strides(vec![2, 3], vec![1, 2], storage).unwrap();
    assert_eq!(t.get(&[1, 2]), Some(5.0));
    assert_eq!(t.get(&[2, 0]), None);
    assert_eq!(t.to_vec_f64(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    assert!(!t.is_contiguous(MemoryFormat::Contiguous));
    assert!(t.contiguous(MemoryFormat::Contiguous).is_contiguous(MemoryFormat::Contiguous));
}

#[test]
fn test_channels_last_round_trip_keeps_values() {
    let t = Tensor::from_vec(vec![1, 2, 2, 2], (0..8).map(f64::from).collect::<Vec<_>>());
    let cl = t.contiguous(MemoryFormat::ChannelsLast);
    assert_eq!(cl.suggest_memory_format(), MemoryFormat::ChannelsLast);
    assert_eq!(cl.to_vec_f64(), t.to_vec_f64());
    assert_eq!(cl.contiguous(MemoryFormat::Contiguous), t);
}
