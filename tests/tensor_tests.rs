use std::sync::Arc;

use tensor4::modelio::ModelDict;
use tensor4::tensors::{DType, ExternalBuffer, Tensor};
use tensor4::Error;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn iota(shape: &[usize]) -> Tensor<f32> {
    let len = shape.iter().product::<usize>();
    Tensor::new(shape.to_vec(), (0..len).map(|v| v as f32).collect()).unwrap()
}

#[test]
fn test_tensor_creation() {
    let t = Tensor::new(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.data(), &[1.0, 2.0, 3.0, 4.0]);
    assert!(!t.is_borrowed());

    assert!(matches!(
        Tensor::new(vec![2, 3], vec![0.0f32; 5]),
        Err(Error::SizeMismatch { expected: 6, found: 5 })
    ));
}

#[test]
fn test_reshape_and_flatten_keep_row_major_order() {
    let t = iota(&[2, 3, 4]);
    let r = t.reshape(&[4, -1]).unwrap();
    assert_eq!(r.shape(), &[4, 6]);
    assert_eq!(r.data(), t.data());
    assert!(r.shares_buffer(&t));

    let f = t.flatten(1).unwrap();
    assert_eq!(f.shape(), &[2, 12]);
    assert_eq!(f.data(), t.data());
    assert!(!f.shares_buffer(&t));

    assert!(t.reshape(&[5, -1]).is_err());
    assert!(t.reshape(&[-1, -1]).is_err());
}

#[test]
fn test_sub_views_alias_parent() {
    let t = iota(&[2, 3, 2]);
    let mut row = t.sub2(1, 2);
    assert_eq!(row.shape(), &[2]);
    assert_eq!(row.data(), &[10.0, 11.0]);

    row.fill(-1.0);
    assert_eq!(t.sub(1).data(), &[6.0, 7.0, 8.0, 9.0, -1.0, -1.0]);
    assert_eq!(t.buffer_refs(), 2);
    drop(row);
    assert_eq!(t.buffer_refs(), 1);
}

#[test]
fn test_contiguous_aliases_parent() {
    let t = iota(&[3, 2]);
    let mut c = t.sub(1).contiguous();
    assert_eq!(c.shape(), &[2]);
    assert!(c.shares_buffer(&t));
    c.fill(0.0);
    assert_eq!(t.sub(1).data(), &[0.0, 0.0]);
    assert_eq!(t.data(), &[0.0, 1.0, 0.0, 0.0, 4.0, 5.0]);
}

#[test]
#[should_panic(expected = "already borrowed")]
fn test_alias_write_during_read_panics() {
    let t = iota(&[2, 3]);
    let mut row = t.sub(0);
    let reading = t.data();
    row.fill(1.0);
    drop(reading);
}

#[test]
fn test_unsqueeze_and_expand() {
    let t = iota(&[3, 4]);
    assert_eq!(t.unsqueeze(0).unwrap().shape(), &[1, 3, 4]);
    assert_eq!(t.unsqueeze(2).unwrap().shape(), &[3, 4, 1]);
    assert!(t.unsqueeze(3).is_err());
    assert_eq!(t.expand().shape(), &[1, 3, 4]);
}

#[test]
fn test_flip_and_argsort() {
    let t = Tensor::new(vec![2, 3], vec![3.0f32, 1.0, 2.0, 0.5, 9.0, -4.0]).unwrap();
    assert_eq!(t.flip(0).unwrap().data(), &[0.5, 9.0, -4.0, 3.0, 1.0, 2.0]);
    assert_eq!(t.flip(-1).unwrap().data(), &[2.0, 1.0, 3.0, -4.0, 9.0, 0.5]);

    let order = t.argsort(1).unwrap();
    assert_eq!(order.shape(), &[2, 3]);
    assert_eq!(order.data(), &[1, 2, 0, 2, 0, 1]);
}

#[test]
fn test_display_shows_shape_and_type() {
    let t = Tensor::new(vec![2, 2], vec![1i32, 2, 3, 4]).unwrap();
    let s = t.to_string();
    assert!(s.starts_with("tensor([[1, 2],"));
    assert!(s.ends_with("shape=[2, 2], dtype=Int32)"));
}

/// A `float [8, 3, 3, 3]` record exactly as it appears on disk.
fn conv1_record(payload: &[u8]) -> Vec<u8> {
    let mut bytes = b"conv1.weight\0".to_vec();
    bytes.extend_from_slice(b"float");
    bytes.push(4);
    for dim in [8u32, 3, 3, 3] {
        bytes.extend_from_slice(&dim.to_le_bytes());
    }
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn test_load_conv_weight_record() {
    init_tracing();
    let values: Vec<f32> = (0..216).map(|i| i as f32 * 0.25 - 10.0).collect();
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(payload.len(), 864);

    let dict = ModelDict::read_from(conv1_record(&payload).as_slice()).unwrap();
    assert_eq!(dict.len(), 1);
    let record = dict.get("conv1.weight").unwrap();
    assert_eq!(record.dtype(), DType::Float32);
    assert_eq!(record.shape(), vec![8, 3, 3, 3]);
    assert_eq!(record.size(), 864);
    assert_eq!(record.bytes(), payload.as_slice());

    let weight = dict.tensor::<f32>("conv1.weight", &[8, 3, 3, 3]).unwrap();
    assert!(weight.is_borrowed());
    assert_eq!(weight.as_bytes(), payload.as_slice());
    assert_eq!(weight.data(), values.as_slice());

    assert!(matches!(
        dict.tensor::<f64>("conv1.weight", &[8, 3, 3, 3]),
        Err(Error::TypeMismatch { .. })
    ));
    assert!(matches!(
        dict.tensor::<f32>("conv1.weight", &[8, 27]),
        Err(Error::ShapeMismatch(_))
    ));
    assert!(matches!(
        dict.tensor::<f32>("conv2.weight", &[8, 3, 3, 3]),
        Err(Error::MissingRecord(_))
    ));
}

#[test]
fn test_weights_outlive_dictionary() {
    let payload = vec![0u8; 864];
    let dict = ModelDict::read_from(conv1_record(&payload).as_slice()).unwrap();
    let weight = dict.tensor::<f32>("conv1.weight", &[8, 3, 3, 3]).unwrap();
    drop(dict);
    assert!(weight.data().iter().all(|&v| v == 0.0));
}

#[test]
fn test_loaded_weights_are_copied_on_write() {
    init_tracing();
    let payload = vec![0u8; 864];
    let dict = ModelDict::read_from(conv1_record(&payload).as_slice()).unwrap();
    let shared = dict.tensor::<f32>("conv1.weight", &[8, 3, 3, 3]).unwrap();
    let mut weight = shared.clone();
    weight.data_mut()[0] = 9.0;

    assert!(!weight.is_borrowed());
    assert!(!weight.shares_buffer(&shared));
    assert_eq!(weight.data()[0], 9.0);
    assert_eq!(shared.data()[0], 0.0);
    assert_eq!(dict.get("conv1.weight").unwrap().bytes(), payload.as_slice());
}

#[test]
fn test_file_round_trip() {
    init_tracing();
    let mut dict = ModelDict::new();
    let conv = Tensor::<f32>::randn(vec![8, 3, 3, 3]).unwrap();
    let bias = Tensor::new(vec![8], (0..8).map(|v| v as f64).collect()).unwrap();
    let ids = Tensor::new(vec![2, 2], vec![1i16, -2, 3, -4]).unwrap();
    dict.insert("conv1.weight", &conv).unwrap();
    dict.insert("conv1.bias", &bias).unwrap();
    dict.insert("embed.ids", &ids).unwrap();

    let path = std::env::temp_dir().join(format!("tensor4-roundtrip-{}.bin", std::process::id()));
    dict.save(&path).unwrap();
    let loaded = ModelDict::load(&path);
    std::fs::remove_file(&path).unwrap();
    let loaded = loaded.unwrap();

    assert_eq!(loaded.names().collect::<Vec<_>>(), vec!["conv1.bias", "conv1.weight", "embed.ids"]);
    assert_eq!(loaded.tensor::<f32>("conv1.weight", &[8, 3, 3, 3]).unwrap(), conv);
    assert_eq!(loaded.tensor::<f64>("conv1.bias", &[8]).unwrap(), bias);
    assert_eq!(loaded.tensor::<i16>("embed.ids", &[2, 2]).unwrap(), ids);
}

#[test]
fn test_missing_file_is_an_open_error() {
    let path = std::env::temp_dir().join("tensor4-does-not-exist.bin");
    assert!(matches!(ModelDict::load(&path), Err(Error::Open { .. })));
}

#[test]
fn test_truncated_record_is_rejected() {
    let bytes = conv1_record(&[0u8; 864]);
    let cut = &bytes[..bytes.len() - 1];
    assert!(matches!(ModelDict::read_from(cut), Err(Error::TruncatedFile(_))));
}

struct Words(Vec<u32>);

impl ExternalBuffer for Words {
    fn as_ptr(&self) -> std::ptr::NonNull<u8> {
        std::ptr::NonNull::new(self.0.as_ptr() as *mut u8).unwrap()
    }

    fn byte_len(&self) -> usize {
        self.0.len() * 4
    }
}

#[test]
fn test_adopted_buffer_stays_alive() {
    let owner: Arc<dyn ExternalBuffer> = Arc::new(Words(vec![1, 2, 3, 4, 5, 6]));
    let t = Tensor::<i32>::adopt(vec![2, 3], owner.clone()).unwrap();
    drop(owner);
    assert!(t.is_borrowed());
    assert_eq!(t.sub(1).data(), &[4, 5, 6]);
    assert!(Tensor::<i32>::adopt(vec![7], Arc::new(Words(vec![0; 6]))).is_err());
}
