//! Stack machine for the pickle subset `torch.save` produces.
//!
//! Dicts keep their items in the order the stream sets them. Storages are
//! not loaded here; tensors come back as references into the archive.

use std::cell::RefCell;
use std::rc::Rc;
use crate::pickle::*;
use crate::Error;

#[derive(Clone, Debug)]
pub struct StorageRef {
    /// `torch.<X>Storage` class name, without the module.
    pub class: String,
    pub key: String,
    pub numel: usize,
}

#[derive(Clone, Debug)]
pub struct TensorRef {
    pub storage: StorageRef,
    pub offset: usize,
    pub shape: Vec<usize>,
    pub stride: Vec<usize>,
}

pub type Items = Rc<RefCell<Vec<(Object, Object)>>>;

#[derive(Clone, Debug)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Tuple(Vec<Object>),
    List(Rc<RefCell<Vec<Object>>>),
    Dict(Items),
    Global { module: String, name: String },
    Storage(StorageRef),
    Tensor(TensorRef),
    /// Result of a call this reader does not model, named by its callable.
    Opaque(String),
}

impl Object {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::String(s) => Some(s),
            _ => None,
        }
    }

    /// Value stored under a string key of a dict.
    pub fn get(&self, key: &str) -> Option<Object> {
        match self {
            Object::Dict(items) => items
                .borrow()
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }
}

fn err(msg: impl Into<String>) -> Error {
    Error::Pickle(msg.into())
}

fn set_item(items: &Items, key: Object, value: Object) {
    let mut items = items.borrow_mut();
    let existing = key.as_str().and_then(|k| items.iter().position(|(x, _)| x.as_str() == Some(k)));
    match existing {
        Some(i) => items[i].1 = value,
        None => items.push((key, value)),
    }
}

fn as_usize(obj: &Object) -> Result<usize, Error> {
    match obj {
        Object::Int(v) => usize::try_from(*v).map_err(|_| err(format!("expected a non-negative int, got {v}"))),
        other => Err(err(format!("expected an int, got {other:?}"))),
    }
}

fn as_usizes(obj: &Object) -> Result<Vec<usize>, Error> {
    match obj {
        Object::Tuple(items) => items.iter().map(as_usize).collect(),
        other => Err(err(format!("expected a tuple of ints, got {other:?}"))),
    }
}

struct Unpickler<'a> {
    bytes: &'a [u8],
    pos: usize,
    stack: Vec<Object>,
    marks: Vec<usize>,
    memo: Vec<Option<Object>>,
}

impl<'a> Unpickler<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).ok_or_else(|| err("length overflow"))?;
        let bytes: &'a [u8] = self.bytes;
        let slice = bytes
            .get(self.pos..end)
            .ok_or_else(|| err(format!("unexpected end of stream at {}", self.pos)))?;
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn utf8(&mut self, len: usize) -> Result<String, Error> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| err(format!("invalid UTF-8: {e}")))
    }

    fn line(&mut self) -> Result<String, Error> {
        let rest = &self.bytes[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| err("GLOBAL missing newline"))?;
        let line = self.utf8(len)?;
        self.pos += 1;
        Ok(line)
    }

    fn pop(&mut self) -> Result<Object, Error> {
        self.stack.pop().ok_or_else(|| err("pop from empty stack"))
    }

    fn pop_mark(&mut self) -> Result<Vec<Object>, Error> {
        let mark = self.marks.pop().ok_or_else(|| err("missing MARK"))?;
        if mark > self.stack.len() {
            return Err(err("MARK above stack top"));
        }
        Ok(self.stack.split_off(mark))
    }

    fn top(&self) -> Result<&Object, Error> {
        self.stack.last().ok_or_else(|| err("empty stack"))
    }

    fn memo_put(&mut self, idx: usize) -> Result<(), Error> {
        let obj = self.top()?.clone();
        if self.memo.len() <= idx {
            self.memo.resize(idx + 1, None);
        }
        self.memo[idx] = Some(obj);
        Ok(())
    }

    fn memo_get(&mut self, idx: usize) -> Result<(), Error> {
        let obj = self
            .memo
            .get(idx)
            .cloned()
            .flatten()
            .ok_or_else(|| err(format!("missing memo entry {idx}")))?;
        self.stack.push(obj);
        Ok(())
    }

    fn set_items(&mut self, pairs: Vec<Object>) -> Result<(), Error> {
        if pairs.len() % 2 != 0 {
            return Err(err("SETITEMS with an odd number of items"));
        }
        let Object::Dict(items) = self.top()?.clone() else {
            log::debug!("Ignoring items set on a non-dict object");
            return Ok(());
        };
        let mut pairs = pairs.into_iter();
        while let (Some(key), Some(value)) = (pairs.next(), pairs.next()) {
            set_item(&items, key, value);
        }
        Ok(())
    }

    fn append(&mut self, values: Vec<Object>) -> Result<(), Error> {
        if let Object::List(list) = self.top()? {
            list.borrow_mut().extend(values);
        }
        Ok(())
    }

    fn persistent_load(&self, pid: Object) -> Result<Object, Error> {
        let Object::Tuple(items) = pid else {
            return Err(err("persistent id is not a tuple"));
        };
        match items.as_slice() {
            [Object::String(kind), Object::Global { name, .. }, Object::String(key), _location, numel]
                if kind == "storage" =>
            {
                Ok(Object::Storage(StorageRef {
                    class: name.clone(),
                    key: key.clone(),
                    numel: as_usize(numel)?,
                }))
            }
            other => Err(err(format!("unsupported persistent id {other:?}"))),
        }
    }

    fn reduce(&self, callable: Object, args: Object) -> Result<Object, Error> {
        let Object::Global { module, name } = callable else {
            return Ok(Object::Opaque("<call>".to_string()));
        };
        let args = match args {
            Object::Tuple(args) => args,
            _ => vec![],
        };
        match (module.as_str(), name.as_str(), args.as_slice()) {
            ("collections", "OrderedDict", _) => Ok(Object::Dict(Items::default())),
            ("torch._utils", "_rebuild_tensor_v2" | "_rebuild_tensor", [storage, offset, shape, stride, ..]) => {
                let Object::Storage(storage) = storage else {
                    return Err(err(format!("{name} expects a storage, got {storage:?}")));
                };
                Ok(Object::Tensor(TensorRef {
                    storage: storage.clone(),
                    offset: as_usize(offset)?,
                    shape: as_usizes(shape)?,
                    stride: as_usizes(stride)?,
                }))
            }
            ("torch._utils", "_rebuild_parameter", [data, ..]) => Ok(data.clone()),
            _ => Ok(Object::Opaque(format!("{module}.{name}"))),
        }
    }

    fn run(mut self) -> Result<Object, Error> {
        loop {
            let op = self.u8()?;
            match op {
                PROTO => {
                    self.u8()?;
                }
                FRAME => {
                    self.take(8)?;
                }
                STOP => return self.pop(),
                MARK => self.marks.push(self.stack.len()),
                POP => {
                    self.pop()?;
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                EMPTY_DICT => self.stack.push(Object::Dict(Items::default())),
                EMPTY_LIST => self.stack.push(Object::List(Default::default())),
                EMPTY_TUPLE => self.stack.push(Object::Tuple(vec![])),
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Object::Tuple(items));
                }
                TUPLE1 | TUPLE2 | TUPLE3 => {
                    let n = (op - TUPLE1 + 1) as usize;
                    if self.stack.len() < n {
                        return Err(err("tuple larger than the stack"));
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(Object::Tuple(items));
                }
                BINUNICODE => {
                    let len = self.u32()? as usize;
                    let s = self.utf8(len)?;
                    self.stack.push(Object::String(s));
                }
                SHORT_BINUNICODE => {
                    let len = self.u8()? as usize;
                    let s = self.utf8(len)?;
                    self.stack.push(Object::String(s));
                }
                BINBYTES | SHORT_BINBYTES => {
                    let len = if op == BINBYTES { self.u32()? as usize } else { self.u8()? as usize };
                    self.take(len)?;
                    self.stack.push(Object::Opaque("bytes".to_string()));
                }
                BININT => {
                    let v = i32::from_le_bytes(self.take_array()?);
                    self.stack.push(Object::Int(v as i64));
                }
                BININT1 => {
                    let v = self.u8()?;
                    self.stack.push(Object::Int(v as i64));
                }
                BININT2 => {
                    let v = u16::from_le_bytes(self.take_array()?);
                    self.stack.push(Object::Int(v as i64));
                }
                LONG1 => {
                    let len = self.u8()? as usize;
                    if len > 8 {
                        return Err(err(format!("{len}-byte LONG1 does not fit in i64")));
                    }
                    let bytes = self.take(len)?;
                    let fill = if bytes.last().is_some_and(|b| b & 0x80 != 0) { 0xff } else { 0 };
                    let mut buf = [fill; 8];
                    buf[..len].copy_from_slice(bytes);
                    self.stack.push(Object::Int(i64::from_le_bytes(buf)));
                }
                BINFLOAT => {
                    let v = f64::from_be_bytes(self.take_array()?);
                    self.stack.push(Object::Float(v));
                }
                NEWTRUE => self.stack.push(Object::Bool(true)),
                NEWFALSE => self.stack.push(Object::Bool(false)),
                NONE => self.stack.push(Object::None),
                GLOBAL => {
                    let module = self.line()?;
                    let name = self.line()?;
                    self.stack.push(Object::Global { module, name });
                }
                STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Object::String(module), Object::String(name)) => {
                            self.stack.push(Object::Global { module, name })
                        }
                        _ => return Err(err("STACK_GLOBAL expects two strings")),
                    }
                }
                BINPUT => {
                    let idx = self.u8()? as usize;
                    self.memo_put(idx)?;
                }
                LONG_BINPUT => {
                    let idx = self.u32()? as usize;
                    self.memo_put(idx)?;
                }
                MEMOIZE => {
                    let idx = self.memo.len();
                    self.memo_put(idx)?;
                }
                BINGET => {
                    let idx = self.u8()? as usize;
                    self.memo_get(idx)?;
                }
                LONG_BINGET => {
                    let idx = self.u32()? as usize;
                    self.memo_get(idx)?;
                }
                BINPERSID => {
                    let pid = self.pop()?;
                    let storage = self.persistent_load(pid)?;
                    self.stack.push(storage);
                }
                REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let out = self.reduce(callable, args)?;
                    self.stack.push(out);
                }
                NEWOBJ => {
                    self.pop()?;
                    let cls = self.pop()?;
                    let name = match cls {
                        Object::Global { module, name } => format!("{module}.{name}"),
                        _ => "<object>".to_string(),
                    };
                    self.stack.push(Object::Opaque(name));
                }
                BUILD => {
                    self.pop()?;
                }
                SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items(vec![key, value])?;
                }
                SETITEMS => {
                    let pairs = self.pop_mark()?;
                    self.set_items(pairs)?;
                }
                APPEND => {
                    let value = self.pop()?;
                    self.append(vec![value])?;
                }
                APPENDS => {
                    let values = self.pop_mark()?;
                    self.append(values)?;
                }
                other => {
                    return Err(err(format!(
                        "unsupported opcode 0x{other:02x} at {}",
                        self.pos - 1
                    )))
                }
            }
        }
    }
}

/// Runs a pickle stream and returns the object it builds.
pub fn load(bytes: &[u8]) -> Result<Object, Error> {
    Unpickler {
        bytes,
        pos: 0,
        stack: vec![],
        marks: vec![],
        memo: vec![],
    }
    .run()
}
