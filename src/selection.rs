use std::fmt;
use std::str::FromStr;
use checkpoint_io::{StateDict, Value};
use crate::Error;

pub const EMA_PREFIX: &str = "model_ema.";

/// EMA bookkeeping entries that survive `ema-only` selection.
pub const EMA_BOOKKEEPING_KEYS: [&str; 2] = ["model_ema.num_updates", "model_ema.decay"];

/// Length of the `model.` prefix replaced by `model_ema.` when looking up a shadow weight.
const LIVE_PREFIX_LEN: usize = 6;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString, strum_macros::EnumIter)]
pub enum SelectionMode {
    #[default]
    #[strum(serialize = "full")]
    Full,
    #[strum(serialize = "ema-only")]
    EmaOnly,
    /// Same behavior as `EmaOnly`.
    #[strum(serialize = "prune")]
    Prune,
    #[strum(serialize = "no-ema")]
    NoEma,
}

impl SelectionMode {
    pub fn parse(mode: &str) -> Result<Self, Error> {
        SelectionMode::from_str(mode).map_err(|_| Error::UnknownSelectionMode(mode.to_string()))
    }

    fn keeps_ema_only(&self) -> bool {
        matches!(self, SelectionMode::EmaOnly | SelectionMode::Prune)
    }
}

/// Name of the EMA shadow of `key`: `model_ema.` followed by everything after
/// the first six characters with the dots removed. Keys shorter than six
/// characters have no shadow.
pub fn ema_key(key: &str) -> Option<String> {
    if key.chars().count() < LIVE_PREFIX_LEN {
        return None;
    }
    let rest: String = key.chars().skip(LIVE_PREFIX_LEN).filter(|c| *c != '.').collect();
    Some(format!("{EMA_PREFIX}{rest}"))
}

/// What selection did with one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectionEvent {
    Substituted { ema_key: String, key: String },
    Kept { key: String },
    Skipped { key: String },
}

impl fmt::Display for SelectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionEvent::Substituted { ema_key, key } => write!(f, "ema: {ema_key} > {key}"),
            SelectionEvent::Kept { key } => write!(f, "{key}"),
            SelectionEvent::Skipped { key } => write!(f, "skipped: {key}"),
        }
    }
}

/// Retained entries in input order, borrowing the values of the input state dict.
pub struct Selection<'a> {
    pub entries: Vec<(&'a str, &'a Value)>,
    pub events: Vec<SelectionEvent>,
}

fn select_ema<'a>(state_dict: &'a StateDict) -> Selection<'a> {
    let mut entries = vec![];
    let mut events = vec![];
    for (key, value) in state_dict.iter() {
        let shadow = ema_key(key).and_then(|ema_key| {
            state_dict.get(&ema_key).map(|ema_value| (ema_key, ema_value))
        });
        if let Some((ema_key, ema_value)) = shadow {
            entries.push((key, ema_value));
            events.push(SelectionEvent::Substituted { ema_key, key: key.to_string() });
        } else if !key.starts_with(EMA_PREFIX) || EMA_BOOKKEEPING_KEYS.contains(&key) {
            entries.push((key, value));
            events.push(SelectionEvent::Kept { key: key.to_string() });
        } else {
            events.push(SelectionEvent::Skipped { key: key.to_string() });
        }
    }
    Selection { entries, events }
}

pub fn select(state_dict: &StateDict, mode: SelectionMode) -> Selection<'_> {
    if mode.keeps_ema_only() {
        return select_ema(state_dict);
    }
    let entries = match mode {
        SelectionMode::NoEma => state_dict.iter().filter(|(k, _)| !k.contains("model_ema")).collect(),
        _ => state_dict.iter().collect(),
    };
    Selection { entries, events: vec![] }
}
