//! Untyped option maps and their decoding into typed configuration.
//!
//! Drivers receive configuration as a loosely typed map of JSON values. A
//! configuration type opts into decoding by implementing [`OptionModel`],
//! which lists the keys it understands. [`decode`] rejects unknown keys and
//! reports malformed values against the key that carried them.

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{KeelError, KeelResult};

/// Untyped, wire-level option map.
pub type Options = serde_json::Map<String, Value>;

/// Well-known option labels.
pub mod labels {
    /// Opaque driver-specific configuration object.
    pub const GENERIC_DATA: &str = "io.keel.network.generic";
    /// Network-level IPv6 switch, overriding the generic data.
    pub const ENABLE_IPV6: &str = "io.keel.network.enable_ipv6";
    /// Explicit endpoint hardware address.
    pub const MAC_ADDRESS: &str = "io.keel.network.endpoint.macaddress";
    /// Requested or resolved port bindings.
    pub const PORT_MAP: &str = "io.keel.network.portmap";
    /// Ports the endpoint exposes.
    pub const EXPOSED_PORTS: &str = "io.keel.network.endpoint.exposedports";
}

/// A configuration structure that can be decoded from an [`Options`] map.
///
/// Implementors must be deserializable from a map containing any subset of
/// [`OptionModel::KEYS`], which in practice means `#[serde(default)]`.
pub trait OptionModel: DeserializeOwned {
    /// Every key the model understands.
    const KEYS: &'static [&'static str];
}

/// Decode `options` into `T`.
///
/// # Errors
///
/// Returns [`KeelError::InvalidOption`] naming the first unknown key or the
/// first key whose value does not decode.
pub fn decode<T: OptionModel>(options: &Options) -> KeelResult<T> {
    for (key, value) in options {
        if !T::KEYS.contains(&key.as_str()) {
            return Err(KeelError::InvalidOption {
                key: key.clone(),
                message: "unknown option".to_string(),
            });
        }

        // Decode the key on its own first so the error names it.
        let mut single = Options::new();
        single.insert(key.clone(), value.clone());
        if let Err(e) = serde_json::from_value::<T>(Value::Object(single)) {
            return Err(KeelError::InvalidOption {
                key: key.clone(),
                message: e.to_string(),
            });
        }
    }

    serde_json::from_value(Value::Object(options.clone())).map_err(|e| KeelError::BadRequest {
        message: e.to_string(),
    })
}

/// Build an [`Options`] map from a JSON object value.
///
/// # Errors
///
/// Returns [`KeelError::BadRequest`] if `value` is not an object.
pub fn from_json(value: Value) -> KeelResult<Options> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Options::new()),
        other => Err(KeelError::bad_request(format!(
            "options must be an object, got {other}"
        ))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flexible<T> {
    Native(T),
    Text(String),
}

/// Deserialize a boolean given natively or as a string such as `"true"`.
///
/// # Errors
///
/// Fails on strings that are not a recognized boolean spelling.
pub fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Flexible::<bool>::deserialize(deserializer)? {
        Flexible::Native(b) => Ok(b),
        Flexible::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "t" | "true" => Ok(true),
            "0" | "f" | "false" => Ok(false),
            other => Err(de::Error::custom(format!("invalid boolean '{other}'"))),
        },
    }
}

/// Deserialize an `i32` given natively or as a decimal string.
///
/// # Errors
///
/// Fails on out-of-range numbers and non-numeric strings.
pub fn flexible_i32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    match Flexible::<i32>::deserialize(deserializer)? {
        Flexible::Native(n) => Ok(n),
        Flexible::Text(s) => s
            .trim()
            .parse()
            .map_err(|e| de::Error::custom(format!("invalid integer '{s}': {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    struct Sample {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Enabled", deserialize_with = "flexible_bool")]
        enabled: bool,
        #[serde(rename = "Mtu", deserialize_with = "flexible_i32")]
        mtu: i32,
    }

    impl OptionModel for Sample {
        const KEYS: &'static [&'static str] = &["Name", "Enabled", "Mtu"];
    }

    fn opts(value: Value) -> Options {
        from_json(value).unwrap()
    }

    #[test]
    fn decodes_native_and_string_values() {
        let s: Sample = decode(&opts(json!({"Name": "br0", "Enabled": "true", "Mtu": "1500"})))
            .unwrap();
        assert_eq!(s.name, "br0");
        assert!(s.enabled);
        assert_eq!(s.mtu, 1500);

        let s: Sample = decode(&opts(json!({"Enabled": false, "Mtu": 9000}))).unwrap();
        assert!(!s.enabled);
        assert_eq!(s.mtu, 9000);
        assert_eq!(s.name, "");
    }

    #[test]
    fn unknown_key_is_named() {
        let err = decode::<Sample>(&opts(json!({"Name": "br0", "Colour": "red"}))).unwrap_err();
        match err {
            KeelError::InvalidOption { key, .. } => assert_eq!(key, "Colour"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_value_is_named() {
        let err = decode::<Sample>(&opts(json!({"Name": "br0", "Mtu": "lots"}))).unwrap_err();
        match err {
            KeelError::InvalidOption { key, message } => {
                assert_eq!(key, "Mtu");
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = decode::<Sample>(&opts(json!({"Enabled": "maybe"}))).unwrap_err();
        assert!(matches!(err, KeelError::InvalidOption { ref key, .. } if key == "Enabled"));
    }

    #[test]
    fn from_json_rejects_non_objects() {
        assert!(from_json(json!([1, 2])).is_err());
        assert!(from_json(Value::Null).unwrap().is_empty());
    }
}
