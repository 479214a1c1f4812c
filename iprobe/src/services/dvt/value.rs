//! Decoded DTX payload values
//!
//! Payloads and archived arguments arrive as NSKeyedArchiver objects. Once unarchived they
//! are mapped onto [`DtxValue`], a closed set of shapes, so decoders match on variants
//! instead of probing untyped plists.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Serialize, Serializer, de::DeserializeOwned, ser::SerializeMap};

use crate::IdeviceError;

#[derive(Debug, Clone, PartialEq)]
pub enum DtxValue {
    Null,
    Bool(bool),
    Integer(plist::Integer),
    Real(f64),
    String(String),
    Data(Vec<u8>),
    Date(DateTime<Utc>),
    Array(Vec<DtxValue>),
    Dictionary(IndexMap<String, DtxValue>),
    /// An unarchived object with no closer match, such as a bare UID reference
    Archived(plist::Value),
    /// An `NSError` sent in place of a result
    Error(RemoteError),
}

/// A failure object reported by the device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteError {
    pub domain: String,
    pub code: i64,
    pub message: String,
}

impl From<RemoteError> for IdeviceError {
    fn from(e: RemoteError) -> Self {
        IdeviceError::Remote {
            domain: e.domain,
            code: e.code,
            message: e.message,
        }
    }
}

impl RemoteError {
    fn from_dictionary(dict: &plist::Dictionary) -> Option<Self> {
        let domain = dict.get("NSDomain")?.as_string()?.to_string();
        let code = dict.get("NSCode").and_then(integer_of).unwrap_or_default();
        let info = dict.get("NSUserInfo").and_then(|u| u.as_dictionary());
        let message = info
            .and_then(|u| {
                ["NSLocalizedDescription", "NSLocalizedFailureReason"]
                    .iter()
                    .find_map(|k| u.get(*k).and_then(|v| v.as_string()))
            })
            .map(str::to_string)
            .unwrap_or_else(|| format!("{domain} error {code}"));
        Some(Self {
            domain,
            code,
            message,
        })
    }

    fn into_dictionary(self) -> plist::Dictionary {
        let mut info = plist::Dictionary::new();
        info.insert("NSLocalizedDescription".into(), self.message.into());
        let mut dict = plist::Dictionary::new();
        dict.insert("NSDomain".into(), self.domain.into());
        dict.insert("NSCode".into(), self.code.into());
        dict.insert("NSUserInfo".into(), info.into());
        dict
    }
}

fn integer_of(v: &plist::Value) -> Option<i64> {
    v.as_signed_integer()
        .or_else(|| v.as_unsigned_integer().map(|u| u as i64))
}

impl From<plist::Value> for DtxValue {
    fn from(v: plist::Value) -> Self {
        match v {
            plist::Value::Boolean(b) => DtxValue::Bool(b),
            plist::Value::Integer(i) => DtxValue::Integer(i),
            plist::Value::Real(f) => DtxValue::Real(f),
            plist::Value::String(s) if s == "$null" => DtxValue::Null,
            plist::Value::String(s) => DtxValue::String(s),
            plist::Value::Data(d) => DtxValue::Data(d),
            plist::Value::Date(d) => DtxValue::Date(std::time::SystemTime::from(d).into()),
            plist::Value::Array(a) => DtxValue::Array(a.into_iter().map(Into::into).collect()),
            plist::Value::Dictionary(d) => match RemoteError::from_dictionary(&d) {
                Some(e) if d.contains_key("NSCode") => DtxValue::Error(e),
                _ => DtxValue::Dictionary(d.into_iter().map(|(k, v)| (k, v.into())).collect()),
            },
            other => DtxValue::Archived(other),
        }
    }
}

impl DtxValue {
    /// Unarchives an NSKeyedArchiver blob
    pub fn from_archive(bytes: &[u8]) -> Result<Self, IdeviceError> {
        Ok(ns_keyed_archive::decode::from_bytes(bytes)?.into())
    }

    /// Converts back into a plist value; `Null` has no plist form
    pub fn into_plist(self) -> Option<plist::Value> {
        Some(match self {
            DtxValue::Null => return None,
            DtxValue::Bool(b) => b.into(),
            DtxValue::Integer(i) => plist::Value::Integer(i),
            DtxValue::Real(f) => f.into(),
            DtxValue::String(s) => s.into(),
            DtxValue::Data(d) => plist::Value::Data(d),
            DtxValue::Date(d) => plist::Value::Date(std::time::SystemTime::from(d).into()),
            DtxValue::Array(a) => {
                plist::Value::Array(a.into_iter().filter_map(DtxValue::into_plist).collect())
            }
            DtxValue::Dictionary(d) => plist::Value::Dictionary(
                d.into_iter()
                    .filter_map(|(k, v)| v.into_plist().map(|v| (k, v)))
                    .collect(),
            ),
            DtxValue::Archived(v) => v,
            DtxValue::Error(e) => e.into_dictionary().into(),
        })
    }

    /// Deserializes into a typed record through serde
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, IdeviceError> {
        match self.clone().into_plist() {
            Some(v) => Ok(plist::from_value(&v)?),
            None => Err(self.mismatch("a value")),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DtxValue::Null => "null",
            DtxValue::Bool(_) => "bool",
            DtxValue::Integer(_) => "integer",
            DtxValue::Real(_) => "real",
            DtxValue::String(_) => "string",
            DtxValue::Data(_) => "data",
            DtxValue::Date(_) => "date",
            DtxValue::Array(_) => "array",
            DtxValue::Dictionary(_) => "dictionary",
            DtxValue::Archived(_) => "archived object",
            DtxValue::Error(_) => "error",
        }
    }

    fn mismatch(&self, expected: &'static str) -> IdeviceError {
        IdeviceError::UnexpectedValue {
            expected,
            found: self.type_name().to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DtxValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DtxValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DtxValue::Integer(i) => i.as_signed().or_else(|| i.as_unsigned().map(|u| u as i64)),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DtxValue::Integer(i) => i.as_unsigned(),
            _ => None,
        }
    }

    /// Reals and integers as a float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DtxValue::Real(f) => Some(*f),
            DtxValue::Integer(_) => self.as_i64().map(|i| i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DtxValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[DtxValue]> {
        match self {
            DtxValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&IndexMap<String, DtxValue>> {
        match self {
            DtxValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&RemoteError> {
        match self {
            DtxValue::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Looks up a key when this is a dictionary
    pub fn get(&self, key: &str) -> Option<&DtxValue> {
        self.as_dictionary().and_then(|d| d.get(key))
    }

    pub fn expect_i64(&self) -> Result<i64, IdeviceError> {
        self.as_i64().ok_or_else(|| self.mismatch("integer"))
    }

    pub fn expect_bool(&self) -> Result<bool, IdeviceError> {
        self.as_bool().ok_or_else(|| self.mismatch("bool"))
    }

    pub fn expect_str(&self) -> Result<&str, IdeviceError> {
        self.as_str().ok_or_else(|| self.mismatch("string"))
    }

    pub fn expect_array(&self) -> Result<&[DtxValue], IdeviceError> {
        self.as_array().ok_or_else(|| self.mismatch("array"))
    }

    pub fn expect_dictionary(&self) -> Result<&IndexMap<String, DtxValue>, IdeviceError> {
        self.as_dictionary().ok_or_else(|| self.mismatch("dictionary"))
    }

    /// Turns an error object into `Err`, passing everything else through
    pub fn into_result(self) -> Result<DtxValue, IdeviceError> {
        match self {
            DtxValue::Error(e) => Err(e.into()),
            v => Ok(v),
        }
    }
}

impl From<&str> for DtxValue {
    fn from(s: &str) -> Self {
        DtxValue::String(s.to_string())
    }
}

impl From<i64> for DtxValue {
    fn from(i: i64) -> Self {
        DtxValue::Integer(i.into())
    }
}

impl From<f64> for DtxValue {
    fn from(f: f64) -> Self {
        DtxValue::Real(f)
    }
}

impl Serialize for DtxValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DtxValue::Null => serializer.serialize_none(),
            DtxValue::Bool(b) => serializer.serialize_bool(*b),
            DtxValue::Integer(i) => match i.as_signed() {
                Some(s) => serializer.serialize_i64(s),
                None => serializer.serialize_u64(i.as_unsigned().unwrap_or_default()),
            },
            DtxValue::Real(f) => serializer.serialize_f64(*f),
            DtxValue::String(s) => serializer.serialize_str(s),
            DtxValue::Data(d) => serializer.serialize_bytes(d),
            DtxValue::Date(d) => serializer.serialize_str(&d.to_rfc3339()),
            DtxValue::Array(a) => serializer.collect_seq(a),
            DtxValue::Dictionary(d) => {
                let mut map = serializer.serialize_map(Some(d.len()))?;
                for (k, v) in d {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            DtxValue::Archived(v) => v.serialize(serializer),
            DtxValue::Error(e) => e.serialize(serializer),
        }
    }
}
