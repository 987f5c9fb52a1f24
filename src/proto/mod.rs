//! gNMI protocol types and path helpers
//!
//! Messages are declared by hand with prost derives rather than generated,
//! since only the telemetry subset of the schema is needed.

pub mod gnmi;

use bytes::Bytes;
use prost::Message;

pub use gnmi::{
    subscribe_response, typed_value, Decimal64, Notification, Path, PathElem, ScalarArray,
    SubscribeResponse, TypedValue, Update,
};

use crate::types::{CacheError, Result};

impl Path {
    /// Set the target identifier
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Path elements, falling back to the legacy `element` strings
    pub fn elems(&self) -> Vec<PathElem> {
        if !self.elem.is_empty() || self.element.is_empty() {
            return self.elem.clone();
        }
        self.element.iter().map(PathElem::new).collect()
    }

    /// Render as an xpath string such as `/interfaces/interface[name=eth0]`
    pub fn to_xpath(&self) -> String {
        let mut out = String::new();
        if !self.origin.is_empty() {
            out.push_str(&self.origin);
            out.push(':');
        }
        for elem in self.elems() {
            out.push('/');
            out.push_str(&elem.to_string());
        }
        if out.is_empty() || out.ends_with(':') {
            out.push('/');
        }
        out
    }
}

impl PathElem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: Default::default(),
        }
    }

    /// Add a list key
    pub fn with_key(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.key.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for PathElem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in &self.key {
            write!(f, "[{}={}]", k, v)?;
        }
        Ok(())
    }
}

/// Parse an xpath string into a [`Path`]
///
/// Accepts an optional `origin:` prefix and `[key=value]` predicates. Slashes
/// inside predicates do not split elements.
pub fn parse_xpath(xpath: &str) -> Result<Path> {
    let mut path = Path::default();
    let mut rest = xpath.trim();

    if let Some(idx) = rest.find(':') {
        let head = &rest[..idx];
        if !head.is_empty() && !head.contains('/') && !head.contains('[') {
            path.origin = head.to_string();
            rest = &rest[idx + 1..];
        }
    }

    let mut segment = String::new();
    let mut depth = 0usize;
    for c in rest.chars() {
        match c {
            '[' => {
                depth += 1;
                segment.push(c);
            }
            ']' => {
                if depth == 0 {
                    return Err(CacheError::Query(format!("unbalanced ']' in {}", xpath)));
                }
                depth -= 1;
                segment.push(c);
            }
            '/' if depth == 0 => {
                if !segment.is_empty() {
                    path.elem.push(parse_elem(&segment, xpath)?);
                    segment.clear();
                }
            }
            _ => segment.push(c),
        }
    }
    if depth != 0 {
        return Err(CacheError::Query(format!("unbalanced '[' in {}", xpath)));
    }
    if !segment.is_empty() {
        path.elem.push(parse_elem(&segment, xpath)?);
    }
    Ok(path)
}

fn parse_elem(segment: &str, xpath: &str) -> Result<PathElem> {
    let (name, mut preds) = match segment.find('[') {
        Some(idx) => (&segment[..idx], &segment[idx..]),
        None => (segment, ""),
    };
    if name.is_empty() {
        return Err(CacheError::Query(format!("empty element name in {}", xpath)));
    }
    let mut elem = PathElem::new(name);
    while !preds.is_empty() {
        let end = preds
            .find(']')
            .ok_or_else(|| CacheError::Query(format!("unterminated key in {}", xpath)))?;
        let pred = &preds[1..end];
        let (k, v) = pred
            .split_once('=')
            .ok_or_else(|| CacheError::Query(format!("key without value in {}", xpath)))?;
        elem.key.insert(k.trim().to_string(), v.trim().to_string());
        preds = &preds[end + 1..];
    }
    Ok(elem)
}

impl TypedValue {
    /// Whether the value carries nothing
    pub fn is_unset(&self) -> bool {
        self.value.is_none()
    }
}

macro_rules! typed_value_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for TypedValue {
            fn from(v: $ty) -> Self {
                Self {
                    value: Some(typed_value::Value::$variant(v.into())),
                }
            }
        }
    };
}

typed_value_from!(String, StringVal);
typed_value_from!(&str, StringVal);
typed_value_from!(i64, IntVal);
typed_value_from!(u64, UintVal);
typed_value_from!(bool, BoolVal);
typed_value_from!(f64, DoubleVal);

impl Update {
    pub fn new(path: Path, val: impl Into<TypedValue>) -> Self {
        Self {
            path: Some(path),
            val: Some(val.into()),
            duplicates: 0,
        }
    }

    /// An update is stored only when it carries a value
    pub fn has_value(&self) -> bool {
        self.val.as_ref().is_some_and(|v| !v.is_unset())
    }
}

impl Notification {
    /// Target identifier from the prefix, empty when absent
    pub fn target(&self) -> &str {
        self.prefix.as_ref().map(|p| p.target.as_str()).unwrap_or("")
    }

    /// No updates and no deletes
    pub fn is_empty(&self) -> bool {
        self.update.is_empty() && self.delete.is_empty()
    }
}

impl SubscribeResponse {
    pub fn from_notification(notification: Notification) -> Self {
        Self {
            response: Some(subscribe_response::Response::Update(notification)),
        }
    }

    /// The carried notification, if this is an update response
    pub fn notification(&self) -> Option<&Notification> {
        match &self.response {
            Some(subscribe_response::Response::Update(n)) => Some(n),
            _ => None,
        }
    }
}

/// Encode a notification as a replication record
pub fn encode_record(notification: &Notification) -> Bytes {
    SubscribeResponse::from_notification(notification.clone())
        .encode_to_vec()
        .into()
}

/// Decode a replication record back into its notification
pub fn decode_record(payload: &[u8]) -> Result<Notification> {
    let response = SubscribeResponse::decode(payload)?;
    match response.response {
        Some(subscribe_response::Response::Update(n)) => Ok(n),
        Some(subscribe_response::Response::SyncResponse(_)) => Err(CacheError::Decode(
            "record carries a sync response, not a notification".into(),
        )),
        None => Err(CacheError::Decode("record carries no response".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xpath_with_keys() {
        let path = parse_xpath("/interfaces/interface[name=Ethernet1/1]/state/counters").unwrap();
        assert_eq!(path.elem.len(), 4);
        assert_eq!(path.elem[1].name, "interface");
        assert_eq!(path.elem[1].key.get("name").map(String::as_str), Some("Ethernet1/1"));
        assert_eq!(path.to_xpath(), "/interfaces/interface[name=Ethernet1/1]/state/counters");
    }

    #[test]
    fn test_parse_xpath_origin_and_multiple_keys() {
        let path = parse_xpath("openconfig:/a/b[y=2][x=1]").unwrap();
        assert_eq!(path.origin, "openconfig");
        // keys render sorted
        assert_eq!(path.to_xpath(), "openconfig:/a/b[x=1][y=2]");
    }

    #[test]
    fn test_parse_xpath_rejects_unbalanced() {
        assert!(parse_xpath("/a/b[name=x").is_err());
        assert!(parse_xpath("/a/b]").is_err());
        assert!(parse_xpath("/a/[k=v]").is_err());
    }

    #[test]
    fn test_root_path() {
        assert_eq!(Path::default().to_xpath(), "/");
        assert!(parse_xpath("/").unwrap().elem.is_empty());
    }

    #[test]
    fn test_legacy_elements() {
        let path = Path {
            element: vec!["system".into(), "hostname".into()],
            ..Default::default()
        };
        assert_eq!(path.to_xpath(), "/system/hostname");
    }

    #[test]
    fn test_record_decode_rejects_sync_response() {
        let sync = SubscribeResponse {
            response: Some(subscribe_response::Response::SyncResponse(true)),
        };
        assert!(decode_record(&sync.encode_to_vec()).is_err());
        assert!(decode_record(b"\xff\xff\xff").is_err());
    }

    #[test]
    fn test_record_wire_layout() {
        let n = Notification {
            timestamp: 1,
            ..Default::default()
        };
        // field 1 (update), length 2, then field 1 (timestamp) varint 1
        assert_eq!(encode_record(&n).as_ref(), &[0x0a, 0x02, 0x08, 0x01]);
        assert_eq!(decode_record(&encode_record(&n)).unwrap(), n);
    }
}
