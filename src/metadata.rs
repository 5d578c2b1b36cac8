//! # Metadata Protocol
//!
//! Mappa con chiavi stringa e valori a tipizzazione dinamica passata con ogni
//! richiesta. Ogni famiglia documenta le proprie chiavi con prefisso
//! (`video.fps`, `pdf.lossy`, ...) e fallback sulla chiave senza prefisso (`fps`).
//!
//! Le chiavi sconosciute vengono ignorate. I valori vengono convertiti in modo
//! permissivo: numeri da stringhe numeriche, bool da "true"/"yes"/"1".

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(HashMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a `key=value` pair as typed on a command line.
    ///
    /// The value is read as JSON when it parses (`30`, `true`, `"x"`),
    /// otherwise it is kept as a plain string.
    pub fn parse_pair(pair: &str) -> Option<(String, Value)> {
        let (key, raw) = pair.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        let value = serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        Some((key.to_string(), value))
    }

    /// Raw lookup: `<family>.<key>` first, then the un-prefixed `<key>`.
    /// A null counts as absent at either level.
    pub fn lookup(&self, family: &str, key: &str) -> Option<&Value> {
        let present = |value: &&Value| !value.is_null();
        self.0
            .get(&format!("{}.{}", family, key))
            .filter(present)
            .or_else(|| self.0.get(key).filter(present))
    }

    pub fn get_str(&self, family: &str, key: &str) -> Option<String> {
        match self.lookup(family, key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_bool(&self, family: &str, key: &str) -> Option<bool> {
        match self.lookup(family, key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|v| v != 0.0),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get_f64(&self, family: &str, key: &str) -> Option<f64> {
        let value = match self.lookup(family, key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        value.is_finite().then_some(value)
    }

    /// Non-negative integer lookup; fractional values are rounded
    pub fn get_u32(&self, family: &str, key: &str) -> Option<u32> {
        let value = self.get_f64(family, key)?;
        if value < 0.0 || value > u32::MAX as f64 {
            return None;
        }
        Some(value.round() as u32)
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
