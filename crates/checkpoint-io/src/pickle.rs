//! Minimal pickle (protocol 2) emitter, covering the opcodes `torch.save`
//! needs to describe a dict of tensors and plain values.

use std::collections::HashMap;

pub(crate) const PROTO: u8 = 0x80;
pub(crate) const FRAME: u8 = 0x95;
pub(crate) const STOP: u8 = b'.';
pub(crate) const MARK: u8 = b'(';
pub(crate) const POP: u8 = b'0';
pub(crate) const POP_MARK: u8 = b'1';
pub(crate) const EMPTY_DICT: u8 = b'}';
pub(crate) const EMPTY_LIST: u8 = b']';
pub(crate) const SETITEM: u8 = b's';
pub(crate) const SETITEMS: u8 = b'u';
pub(crate) const APPEND: u8 = b'a';
pub(crate) const APPENDS: u8 = b'e';
pub(crate) const EMPTY_TUPLE: u8 = b')';
pub(crate) const TUPLE: u8 = b't';
pub(crate) const TUPLE1: u8 = 0x85;
pub(crate) const TUPLE2: u8 = 0x86;
pub(crate) const TUPLE3: u8 = 0x87;
pub(crate) const BINUNICODE: u8 = b'X';
pub(crate) const SHORT_BINUNICODE: u8 = 0x8c;
pub(crate) const BINBYTES: u8 = b'B';
pub(crate) const SHORT_BINBYTES: u8 = b'C';
pub(crate) const BININT: u8 = b'J';
pub(crate) const BININT1: u8 = b'K';
pub(crate) const BININT2: u8 = b'M';
pub(crate) const LONG1: u8 = 0x8a;
pub(crate) const BINFLOAT: u8 = b'G';
pub(crate) const NEWTRUE: u8 = 0x88;
pub(crate) const NEWFALSE: u8 = 0x89;
pub(crate) const NONE: u8 = b'N';
pub(crate) const GLOBAL: u8 = b'c';
pub(crate) const STACK_GLOBAL: u8 = 0x93;
pub(crate) const REDUCE: u8 = b'R';
pub(crate) const NEWOBJ: u8 = 0x81;
pub(crate) const BUILD: u8 = b'b';
pub(crate) const BINPERSID: u8 = b'Q';
pub(crate) const BINPUT: u8 = b'q';
pub(crate) const LONG_BINPUT: u8 = b'r';
pub(crate) const MEMOIZE: u8 = 0x94;
pub(crate) const BINGET: u8 = b'h';
pub(crate) const LONG_BINGET: u8 = b'j';

#[derive(Default)]
pub struct PickleWriter {
    buf: Vec<u8>,
    globals: HashMap<(String, String), u32>,
}

impl PickleWriter {
    pub fn new() -> Self {
        let mut writer = Self::default();
        writer.buf.extend_from_slice(&[PROTO, 2]);
        writer
    }

    pub fn mark(&mut self) -> &mut Self {
        self.buf.push(MARK);
        self
    }

    pub fn empty_dict(&mut self) -> &mut Self {
        self.buf.push(EMPTY_DICT);
        self
    }

    /// Pops key/value pairs down to the last mark into the dict below it.
    pub fn set_items(&mut self) -> &mut Self {
        self.buf.push(SETITEMS);
        self
    }

    pub fn empty_tuple(&mut self) -> &mut Self {
        self.buf.push(EMPTY_TUPLE);
        self
    }

    /// Builds a tuple from everything above the last mark.
    pub fn tuple(&mut self) -> &mut Self {
        self.buf.push(TUPLE);
        self
    }

    pub fn unicode(&mut self, s: &str) -> &mut Self {
        self.buf.push(BINUNICODE);
        self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn int(&mut self, v: i64) -> &mut Self {
        if (0..=0xff).contains(&v) {
            self.buf.push(BININT1);
            self.buf.push(v as u8);
        } else if (0..=0xffff).contains(&v) {
            self.buf.push(BININT2);
            self.buf.extend_from_slice(&(v as u16).to_le_bytes());
        } else if i32::try_from(v).is_ok() {
            self.buf.push(BININT);
            self.buf.extend_from_slice(&(v as i32).to_le_bytes());
        } else {
            self.buf.push(LONG1);
            self.buf.push(8);
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        self
    }

    /// BINFLOAT carries a big-endian f64.
    pub fn float(&mut self, v: f64) -> &mut Self {
        self.buf.push(BINFLOAT);
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn int_tuple(&mut self, values: &[usize]) -> &mut Self {
        self.mark();
        for v in values {
            self.int(*v as i64);
        }
        self.tuple()
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(if v { NEWTRUE } else { NEWFALSE });
        self
    }

    pub fn none(&mut self) -> &mut Self {
        self.buf.push(NONE);
        self
    }

    /// Pushes `module.name`. The first use is memoized and later uses fetch
    /// it back, the way the pickler does for repeated globals.
    pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
        let key = (module.to_string(), name.to_string());
        if let Some(idx) = self.globals.get(&key).copied() {
            return self.memo_get(idx);
        }
        self.buf.push(GLOBAL);
        self.buf.extend_from_slice(module.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b'\n');
        let idx = self.globals.len() as u32;
        self.globals.insert(key, idx);
        self.memo_put(idx)
    }

    fn memo_put(&mut self, idx: u32) -> &mut Self {
        match u8::try_from(idx) {
            Ok(idx) => self.buf.extend_from_slice(&[BINPUT, idx]),
            Err(_) => {
                self.buf.push(LONG_BINPUT);
                self.buf.extend_from_slice(&idx.to_le_bytes());
            }
        }
        self
    }

    fn memo_get(&mut self, idx: u32) -> &mut Self {
        match u8::try_from(idx) {
            Ok(idx) => self.buf.extend_from_slice(&[BINGET, idx]),
            Err(_) => {
                self.buf.push(LONG_BINGET);
                self.buf.extend_from_slice(&idx.to_le_bytes());
            }
        }
        self
    }

    /// Calls the callable below the argument tuple on top of the stack.
    pub fn reduce(&mut self) -> &mut Self {
        self.buf.push(REDUCE);
        self
    }

    /// Hands the object on top of the stack to the unpickler's persistent loader.
    pub fn persistent_id(&mut self) -> &mut Self {
        self.buf.push(BINPERSID);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(STOP);
        self.buf
    }
}
