use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use candle_core::Tensor;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};
use crate::dtype::{tensor_from_raw, to_raw_encoding, torch_storage_class, StoredDType};
use crate::pickle::PickleWriter;
use crate::unpickle::{self, Object, TensorRef};
use crate::{Error, StateDict, Value};

pub const STATE_DICT_KEY: &str = "state_dict";

const ARCHIVE_NAME: &str = "archive";

/// `torch.save` pickles dict items in batches of this size.
const BATCH_SIZE: usize = 1000;

fn contiguous_stride(shape: &[usize]) -> Vec<usize> {
    let mut stride = vec![0usize; shape.len()];
    let mut s = 1usize;
    for (i, &dim) in shape.iter().enumerate().rev() {
        stride[i] = s;
        s = s.saturating_mul(dim.max(1));
    }
    stride
}

/// Directory every record of the archive lives under, taken from `data.pkl`.
fn archive_prefix<R: Read + Seek>(archive: &ZipArchive<R>) -> Result<String, Error> {
    archive
        .file_names()
        .filter_map(|name| name.strip_suffix("data.pkl"))
        .find(|prefix| prefix.is_empty() || prefix.ends_with('/'))
        .map(str::to_string)
        .ok_or_else(|| Error::Pickle("no data.pkl record in archive".to_string()))
}

fn read_record<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>, Error> {
    let mut record = archive.by_name(name)?;
    let mut buf = Vec::with_capacity(record.size() as usize);
    record.read_to_end(&mut buf)?;
    Ok(buf)
}

struct Storages<R: Read + Seek> {
    archive: ZipArchive<R>,
    prefix: String,
    cache: HashMap<String, Vec<u8>>,
}

impl<R: Read + Seek> Storages<R> {
    fn get(&mut self, key: &str) -> Result<&[u8], Error> {
        if !self.cache.contains_key(key) {
            let data = read_record(&mut self.archive, &format!("{}data/{}", self.prefix, key))?;
            self.cache.insert(key.to_string(), data);
        }
        Ok(self.cache.get(key).map(Vec::as_slice).unwrap_or_default())
    }
}

/// Copies the elements a tensor views out of its storage, in row-major order.
fn gather<'a>(name: &str, spec: &TensorRef, elem: usize, storage: &'a [u8]) -> Result<Cow<'a, [u8]>, Error> {
    let numel: usize = spec.shape.iter().product();
    let out_of_bounds = || Error::TensorOutOfBounds {
        name: name.to_string(),
        storage_bytes: storage.len(),
    };
    if numel == 0 {
        return Ok(Cow::Borrowed(&[]));
    }
    if spec.stride == contiguous_stride(&spec.shape) {
        let begin = spec.offset * elem;
        return storage
            .get(begin..begin + numel * elem)
            .map(Cow::Borrowed)
            .ok_or_else(out_of_bounds);
    }
    let mut out = Vec::with_capacity(numel * elem);
    let mut index = vec![0usize; spec.shape.len()];
    for _ in 0..numel {
        let pos = spec.offset + index.iter().zip(&spec.stride).map(|(i, s)| i * s).sum::<usize>();
        out.extend_from_slice(storage.get(pos * elem..(pos + 1) * elem).ok_or_else(out_of_bounds)?);
        for d in (0..index.len()).rev() {
            index[d] += 1;
            if index[d] < spec.shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    Ok(Cow::Owned(out))
}

fn load_tensor<R: Read + Seek>(name: &str, spec: &TensorRef, storages: &mut Storages<R>) -> Result<Tensor, Error> {
    let dtype = StoredDType::from_torch_storage(&spec.storage.class).ok_or_else(|| Error::UnsupportedDType {
        name: name.to_string(),
        dtype: spec.storage.class.clone(),
    })?;
    let storage = storages.get(&spec.storage.key)?;
    let data = gather(name, spec, dtype.size_in_bytes(), storage)?;
    tensor_from_raw(name, dtype, &spec.shape, &data)
}

/// Reads a PyTorch zip checkpoint onto the CPU, in pickle order.
///
/// The mapping under `"state_dict"` is used when the root object has one.
/// Scalar entries are kept; entries that are neither tensors nor scalars are
/// skipped.
pub fn load_pth(path: &Path) -> Result<StateDict, Error> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let prefix = archive_prefix(&archive)?;
    if let Ok(byteorder) = read_record(&mut archive, &format!("{prefix}byteorder")) {
        if byteorder.trim_ascii() != b"little" {
            return Err(Error::Pickle(format!(
                "unsupported byteorder {:?}",
                String::from_utf8_lossy(&byteorder)
            )));
        }
    }
    let pickle = read_record(&mut archive, &format!("{prefix}data.pkl"))?;
    let root = unpickle::load(&pickle)?;

    let mapping = match root.get(STATE_DICT_KEY) {
        Some(inner @ Object::Dict(_)) => inner,
        Some(other) => return Err(Error::Pickle(format!("{STATE_DICT_KEY} is not a mapping: {other:?}"))),
        None => {
            log::debug!("No {STATE_DICT_KEY} in {}, reading root object", path.display());
            root
        }
    };
    let items = match mapping {
        Object::Dict(items) => items,
        other => return Err(Error::Pickle(format!("checkpoint root is not a mapping: {other:?}"))),
    };

    let mut storages = Storages {
        archive,
        prefix,
        cache: HashMap::new(),
    };
    let mut state_dict = StateDict::new();
    for (key, value) in items.borrow().iter() {
        let Some(name) = key.as_str() else {
            log::warn!("Skipping entry with non-string key {key:?}");
            continue;
        };
        let value = match value {
            Object::Tensor(spec) => Value::Tensor(load_tensor(name, spec, &mut storages)?),
            Object::Int(v) => Value::Int(*v),
            Object::Float(v) => Value::Float(*v),
            Object::Bool(v) => Value::Bool(*v),
            Object::String(v) => Value::String(v.clone()),
            Object::None => Value::None,
            other => {
                log::warn!("Skipping non-tensor entry {name} ({other:?})");
                continue;
            }
        };
        state_dict.insert(name, value);
    }
    Ok(state_dict)
}

fn write_tensor(pickle: &mut PickleWriter, storage_key: usize, name: &str, tensor: &Tensor) -> Result<(), Error> {
    let shape = tensor.dims();
    let storage_class = torch_storage_class(name, tensor.dtype())?;
    pickle.global("torch._utils", "_rebuild_tensor_v2");
    pickle.mark();
    pickle
        .mark()
        .unicode("storage")
        .global("torch", storage_class)
        .unicode(&storage_key.to_string())
        .unicode("cpu")
        .int(tensor.elem_count() as i64)
        .tuple()
        .persistent_id();
    pickle.int(0);
    pickle.int_tuple(shape);
    pickle.int_tuple(&contiguous_stride(shape));
    pickle.bool(false);
    pickle.global("collections", "OrderedDict").empty_tuple().reduce();
    pickle.tuple().reduce();
    Ok(())
}

fn write_state_dict_pickle(pickle: &mut PickleWriter, state_dict: &StateDict) -> Result<(), Error> {
    pickle.global("collections", "OrderedDict").empty_tuple().reduce();
    let entries: Vec<_> = state_dict.iter().collect();
    let mut storage_key = 0;
    for batch in entries.chunks(BATCH_SIZE) {
        pickle.mark();
        for (name, value) in batch {
            pickle.unicode(name);
            match value {
                Value::Tensor(tensor) => {
                    write_tensor(pickle, storage_key, name, tensor)?;
                    storage_key += 1;
                }
                Value::Int(v) => {
                    pickle.int(*v);
                }
                Value::Float(v) => {
                    pickle.float(*v);
                }
                Value::Bool(v) => {
                    pickle.bool(*v);
                }
                Value::String(v) => {
                    pickle.unicode(v);
                }
                Value::None => {
                    pickle.none();
                }
            }
        }
        pickle.set_items();
    }
    Ok(())
}

/// Writes a PyTorch zip checkpoint. With `wrap_state_dict` the entries are
/// stored as `{"state_dict": OrderedDict(...)}`, otherwise as a bare
/// `OrderedDict`.
pub fn save_pth(path: &Path, state_dict: &StateDict, wrap_state_dict: bool) -> Result<(), Error> {
    let mut pickle = PickleWriter::new();
    if wrap_state_dict {
        pickle.empty_dict().mark().unicode(STATE_DICT_KEY);
        write_state_dict_pickle(&mut pickle, state_dict)?;
        pickle.set_items();
    } else {
        write_state_dict_pickle(&mut pickle, state_dict)?;
    }
    write_archive(path, pickle.finish(), state_dict)
}

pub(crate) fn write_archive(path: &Path, pickle: Vec<u8>, state_dict: &StateDict) -> Result<(), Error> {
    let mut archive = ZipWriter::new(File::create(path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    // torch derives the archive prefix from the first record
    archive.start_file(format!("{ARCHIVE_NAME}/data.pkl"), options)?;
    archive.write_all(&pickle)?;
    archive.start_file(format!("{ARCHIVE_NAME}/byteorder"), options)?;
    archive.write_all(b"little")?;

    for (storage_key, (name, tensor)) in state_dict.tensors().enumerate() {
        let data = to_raw_encoding(name, tensor)?;
        let options = options.large_file(data.len() as u64 >= u32::MAX as u64);
        archive.start_file(format!("{ARCHIVE_NAME}/data/{storage_key}"), options)?;
        archive.write_all(&data)?;
    }

    archive.start_file(format!("{ARCHIVE_NAME}/version"), options)?;
    archive.write_all(b"3\n")?;
    archive.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn sample() -> StateDict {
        let device = Device::Cpu;
        let mut state_dict = StateDict::new();
        state_dict.insert(
            "model.layer.weight",
            Tensor::arange(0f32, 6f32, &device).unwrap().reshape((2, 3)).unwrap(),
        );
        state_dict.insert("model_ema.num_updates", Tensor::new(12i64, &device).unwrap());
        state_dict.insert(
            "model.bias",
            Tensor::new(&[0.5f32, 1.5], &device).unwrap().to_dtype(DType::F16).unwrap(),
        );
        state_dict
    }

    fn as_f64(t: &Tensor) -> Vec<f64> {
        t.to_dtype(DType::F64).unwrap().flatten_all().unwrap().to_vec1::<f64>().unwrap()
    }

    fn assert_same(a: &StateDict, b: &StateDict) {
        assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
        for (name, tensor) in a.tensors() {
            let other = b.tensor(name).unwrap();
            assert_eq!(tensor.dtype(), other.dtype(), "{name}");
            assert_eq!(tensor.dims(), other.dims(), "{name}");
            assert_eq!(as_f64(tensor), as_f64(other), "{name}");
        }
    }

    struct RawTensor {
        name: &'static str,
        class: &'static str,
        key: &'static str,
        offset: usize,
        shape: Vec<usize>,
        stride: Vec<usize>,
    }

    fn raw(name: &'static str, class: &'static str, key: &'static str, offset: usize, shape: &[usize], stride: &[usize]) -> RawTensor {
        RawTensor { name, class, key, offset, shape: shape.to_vec(), stride: stride.to_vec() }
    }

    /// Pickles `{name: _rebuild_tensor_v2(storage, offset, shape, stride)}`
    /// over the given storages, bypassing the state dict writer.
    fn write_raw(path: &Path, tensors: &[RawTensor], storages: &[Vec<u8>]) {
        let mut pickle = PickleWriter::new();
        pickle.empty_dict().mark();
        for t in tensors {
            pickle.unicode(t.name).global("torch._utils", "_rebuild_tensor_v2").mark();
            pickle
                .mark()
                .unicode("storage")
                .global("torch", t.class)
                .unicode(t.key)
                .unicode("cpu")
                .int(0)
                .tuple()
                .persistent_id();
            pickle.int(t.offset as i64).int_tuple(&t.shape).int_tuple(&t.stride).bool(false);
            pickle.global("collections", "OrderedDict").empty_tuple().reduce();
            pickle.tuple().reduce();
        }
        pickle.set_items();

        let mut archive = ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        archive.start_file("m/data.pkl", options).unwrap();
        archive.write_all(&pickle.finish()).unwrap();
        for (i, data) in storages.iter().enumerate() {
            archive.start_file(format!("m/data/{i}"), options).unwrap();
            archive.write_all(data).unwrap();
        }
        archive.finish().unwrap();
    }

    #[test]
    fn stride_is_row_major() {
        assert_eq!(contiguous_stride(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_stride(&[]), Vec::<usize>::new());
        assert_eq!(contiguous_stride(&[0, 5]), vec![5, 1]);
    }

    #[test]
    fn wrapped_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapped.ckpt");
        let state_dict = sample();
        save_pth(&path, &state_dict, true).unwrap();
        assert_same(&state_dict, &load_pth(&path).unwrap());
    }

    #[test]
    fn bare_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.pth");
        let state_dict = sample();
        save_pth(&path, &state_dict, false).unwrap();
        assert_same(&state_dict, &load_pth(&path).unwrap());
    }

    #[test]
    fn order_survives_several_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.ckpt");
        let mut state_dict = StateDict::new();
        for i in (0..BATCH_SIZE + 5).rev() {
            state_dict.insert(format!("layer.{i}"), Tensor::new(i as f32, &Device::Cpu).unwrap());
        }
        save_pth(&path, &state_dict, true).unwrap();
        let loaded = load_pth(&path).unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), state_dict.keys().collect::<Vec<_>>());
        assert_eq!(loaded.tensor("layer.3").unwrap().to_scalar::<f32>().unwrap(), 3.0);
    }

    #[test]
    fn scalar_entries_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scalars.ckpt");
        let mut state_dict = sample();
        state_dict.insert("epoch", Value::Int(7));
        state_dict.insert("lr", Value::Float(1e-4));
        state_dict.insert("use_ema", Value::Bool(true));
        state_dict.insert("name", Value::String("v1".to_string()));
        state_dict.insert("scheduler", Value::None);
        state_dict.insert("model.tail", Tensor::new(&[2.0f32], &Device::Cpu).unwrap());
        save_pth(&path, &state_dict, true).unwrap();

        let loaded = load_pth(&path).unwrap();
        assert_same(&state_dict, &loaded);
        assert!(matches!(loaded.get("epoch"), Some(Value::Int(7))));
        assert!(matches!(loaded.get("lr"), Some(Value::Float(v)) if *v == 1e-4));
        assert!(matches!(loaded.get("use_ema"), Some(Value::Bool(true))));
        assert!(matches!(loaded.get("name"), Some(Value::String(s)) if s == "v1"));
        assert!(matches!(loaded.get("scheduler"), Some(Value::None)));
    }

    #[test]
    fn metadata_next_to_state_dict_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.ckpt");
        let state_dict = sample();

        let mut pickle = PickleWriter::new();
        pickle.empty_dict().mark();
        pickle.unicode("epoch").int(3);
        pickle.unicode("global_step").int(120_000);
        pickle.unicode(STATE_DICT_KEY);
        write_state_dict_pickle(&mut pickle, &state_dict).unwrap();
        pickle.set_items();
        write_archive(&path, pickle.finish(), &state_dict).unwrap();

        assert_same(&state_dict, &load_pth(&path).unwrap());
    }

    #[test]
    fn narrow_int_storages_are_widened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ints.ckpt");
        let ints: Vec<u8> = [1200i32, -4].iter().flat_map(|x| x.to_le_bytes()).collect();
        let shorts: Vec<u8> = [-2i16].iter().flat_map(|x| x.to_le_bytes()).collect();
        write_raw(
            &path,
            &[
                raw("model_ema.num_updates", "IntStorage", "0", 0, &[], &[]),
                raw("counts", "IntStorage", "0", 0, &[2], &[1]),
                raw("delta", "ShortStorage", "1", 0, &[1], &[1]),
                raw("mask", "BoolStorage", "2", 0, &[2], &[1]),
                raw("offsets", "CharStorage", "3", 0, &[1], &[1]),
            ],
            &[ints, shorts, vec![1, 0], vec![0xfe]],
        );

        let loaded = load_pth(&path).unwrap();
        assert_eq!(
            loaded.keys().collect::<Vec<_>>(),
            vec!["model_ema.num_updates", "counts", "delta", "mask", "offsets"]
        );
        let n = loaded.tensor("model_ema.num_updates").unwrap();
        assert_eq!(n.dtype(), DType::I64);
        assert_eq!(n.to_scalar::<i64>().unwrap(), 1200);
        assert_eq!(loaded.tensor("counts").unwrap().to_vec1::<i64>().unwrap(), vec![1200, -4]);
        assert_eq!(loaded.tensor("delta").unwrap().to_vec1::<i64>().unwrap(), vec![-2]);
        assert_eq!(loaded.tensor("mask").unwrap().to_vec1::<u8>().unwrap(), vec![1, 0]);
        assert_eq!(loaded.tensor("offsets").unwrap().to_vec1::<i64>().unwrap(), vec![-2]);
    }

    #[test]
    fn views_into_shared_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("views.ckpt");
        let floats: Vec<u8> = (0..6).flat_map(|x| (x as f32).to_le_bytes()).collect();
        write_raw(
            &path,
            &[
                raw("tail", "FloatStorage", "0", 4, &[2], &[1]),
                raw("transposed", "FloatStorage", "0", 0, &[3, 2], &[1, 3]),
            ],
            &[floats],
        );

        let loaded = load_pth(&path).unwrap();
        assert_eq!(loaded.tensor("tail").unwrap().to_vec1::<f32>().unwrap(), vec![4.0, 5.0]);
        assert_eq!(
            loaded.tensor("transposed").unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 3.0], vec![1.0, 4.0], vec![2.0, 5.0]]
        );
    }

    #[test]
    fn unknown_storage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("complex.ckpt");
        write_raw(&path, &[raw("z", "ComplexFloatStorage", "0", 0, &[1], &[1])], &[vec![0; 8]]);
        let err = load_pth(&path).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDType { ref name, ref dtype } if name == "z" && dtype == "ComplexFloatStorage"));
    }

    #[test]
    fn short_storage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.ckpt");
        write_raw(&path, &[raw("w", "FloatStorage", "0", 1, &[2], &[1])], &[vec![0; 8]]);
        assert!(matches!(load_pth(&path), Err(Error::TensorOutOfBounds { .. })));
    }

    #[test]
    fn u32_tensors_cannot_be_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ckpt");
        let mut state_dict = StateDict::new();
        state_dict.insert("ids", Tensor::new(&[1u32, 2], &Device::Cpu).unwrap());
        let err = save_pth(&path, &state_dict, true).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDType { ref name, .. } if name == "ids"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_pth(&dir.path().join("nope.ckpt")).is_err());
    }
}
