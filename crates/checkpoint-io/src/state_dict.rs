use candle_core::Tensor;
use indexmap::IndexMap;

/// One entry of a state dict. Checkpoints mostly hold tensors, but a pickled
/// state dict may carry plain scalars next to them.
#[derive(Clone, Debug)]
pub enum Value {
    Tensor(Tensor),
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    None,
}

impl Value {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::String(_) => "str",
            Value::None => "None",
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

/// Parameter name to value mapping that keeps the order entries were read in.
#[derive(Clone, Debug, Default)]
pub struct StateDict {
    entries: IndexMap<String, Value>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value; an existing key keeps its position and gets the new value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.get(name).and_then(Value::as_tensor)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|x| x.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Tensor entries only, in order.
    pub fn tensors(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.iter().filter_map(|(k, v)| v.as_tensor().map(|t| (k, t)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<S: Into<String>, V: Into<Value>> FromIterator<(S, V)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (S, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}
