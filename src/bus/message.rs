use crate::error::BusError;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_NAME_LEN: usize = 255;

/// Error name sent back when a method call names nobody on the bus.
pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
/// Error name sent back when a method handler fails without replying.
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

/// A well-known (`org.satlink.Power`) or unique (`:1.4`) bus name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusName(ArrayString<MAX_NAME_LEN>);

impl BusName {
    pub fn parse(name: &str) -> Result<Self, BusError> {
        let invalid = || BusError::InvalidName(name.to_string());

        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(invalid());
        }
        let (unique, body) = match name.strip_prefix(':') {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        if !body.contains('.') {
            return Err(invalid());
        }
        for element in body.split('.') {
            let Some(first) = element.chars().next() else {
                return Err(invalid());
            };
            if !unique && first.is_ascii_digit() {
                return Err(invalid());
            }
            if !element.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(invalid());
            }
        }

        ArrayString::from(name).map(BusName).map_err(|_| invalid())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_unique(&self) -> bool {
        self.0.starts_with(':')
    }
}

impl TryFrom<String> for BusName {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BusName::parse(&value)
    }
}

impl From<BusName> for String {
    fn from(name: BusName) -> Self {
        name.0.to_string()
    }
}

impl fmt::Display for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Signal,
    MethodCall,
    MethodReturn,
    Error,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Signal => "signal",
            MessageKind::MethodCall => "method_call",
            MessageKind::MethodReturn => "method_return",
            MessageKind::Error => "error",
        }
    }
}

/// One typed message argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusValue {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    Double(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl BusValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            BusValue::Bool(_) => "bool",
            BusValue::Byte(_) => "byte",
            BusValue::Int16(_) => "int16",
            BusValue::UInt16(_) => "uint16",
            BusValue::Int32(_) => "int32",
            BusValue::UInt32(_) => "uint32",
            BusValue::Int64(_) => "int64",
            BusValue::Double(_) => "double",
            BusValue::Str(_) => "string",
            BusValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BusValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! bus_value_conversions {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for BusValue {
                fn from(value: $ty) -> Self {
                    BusValue::$variant(value)
                }
            }

            impl TryFrom<&BusValue> for $ty {
                type Error = BusError;

                fn try_from(value: &BusValue) -> Result<Self, Self::Error> {
                    match value.clone() {
                        BusValue::$variant(v) => Ok(v),
                        other => Err(BusError::Handler(format!(
                            "expected {}, found {}",
                            stringify!($variant),
                            other.type_name()
                        ))),
                    }
                }
            }
        )*
    };
}

bus_value_conversions! {
    Bool => bool,
    Byte => u8,
    Int16 => i16,
    UInt16 => u16,
    Int32 => i32,
    UInt32 => u32,
    Int64 => i64,
    Double => f64,
    Str => String,
    Bytes => Vec<u8>,
}

impl From<&str> for BusValue {
    fn from(value: &str) -> Self {
        BusValue::Str(value.to_string())
    }
}

/// A message on the session bus.
///
/// `serial` and `sender` are stamped by the bus connection when the message
/// is sent; values set before that are overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    kind: MessageKind,
    serial: u32,
    reply_serial: Option<u32>,
    sender: Option<BusName>,
    destination: Option<BusName>,
    path: String,
    interface: String,
    member: String,
    error_name: Option<String>,
    args: Vec<BusValue>,
}

impl BusMessage {
    fn new(kind: MessageKind, path: &str, interface: &str, member: &str) -> Self {
        Self {
            kind,
            serial: 0,
            reply_serial: None,
            sender: None,
            destination: None,
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            error_name: None,
            args: Vec::new(),
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self::new(MessageKind::Signal, path, interface, member)
    }

    pub fn method_call(
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Self, BusError> {
        let mut message = Self::new(MessageKind::MethodCall, path, interface, member);
        message.destination = Some(BusName::parse(destination)?);
        Ok(message)
    }

    /// A successful reply to `call`, addressed back to its sender.
    pub fn method_return(call: &BusMessage) -> Self {
        let mut message = Self::new(MessageKind::MethodReturn, &call.path, &call.interface, &call.member);
        message.reply_serial = Some(call.serial);
        message.destination = call.sender;
        message
    }

    /// An error reply to `call` carrying a human readable text.
    pub fn error(call: &BusMessage, error_name: &str, text: &str) -> Self {
        let mut message = Self::new(MessageKind::Error, &call.path, &call.interface, &call.member);
        message.reply_serial = Some(call.serial);
        message.destination = call.sender;
        message.error_name = Some(error_name.to_string());
        message.args.push(BusValue::from(text));
        message
    }

    pub fn with_arg(mut self, value: impl Into<BusValue>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_args(mut self, values: impl IntoIterator<Item = BusValue>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn with_destination(mut self, destination: BusName) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn sender(&self) -> Option<&BusName> {
        self.sender.as_ref()
    }

    pub fn destination(&self) -> Option<&BusName> {
        self.destination.as_ref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn args(&self) -> &[BusValue] {
        &self.args
    }

    /// Argument `index` converted to `T`.
    pub fn arg<T>(&self, index: usize) -> Result<T, BusError>
    where
        T: for<'a> TryFrom<&'a BusValue, Error = BusError>,
    {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| BusError::Handler(format!("{}.{} missing argument {index}", self.interface, self.member)))?;
        T::try_from(value)
    }

    /// Text of an error reply, empty if none was attached.
    pub fn error_text(&self) -> &str {
        self.args.first().and_then(BusValue::as_str).unwrap_or("")
    }

    pub(crate) fn stamp(&mut self, serial: u32, sender: BusName) {
        self.serial = serial;
        self.sender = Some(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_name_rules() {
        assert!(BusName::parse("org.satlink.Power").is_ok());
        assert!(BusName::parse(":1.42").unwrap().is_unique());
        assert!(BusName::parse("").is_err());
        assert!(BusName::parse("nodots").is_err());
        assert!(BusName::parse("org..satlink").is_err());
        assert!(BusName::parse("org.9lives").is_err());
        assert!(BusName::parse("org.sat link").is_err());
        assert!(BusName::parse(&"a.".repeat(200)).is_err());
    }

    #[test]
    fn test_reply_addresses_caller() {
        let mut call = BusMessage::method_call("org.satlink.Power", "/org/satlink/Power", "org.satlink.Power", "EnableLine")
            .unwrap()
            .with_arg(1i16);
        call.stamp(7, BusName::parse(":1.3").unwrap());

        let reply = BusMessage::method_return(&call);
        assert_eq!(reply.kind(), MessageKind::MethodReturn);
        assert_eq!(reply.reply_serial(), Some(7));
        assert_eq!(reply.destination().map(BusName::as_str), Some(":1.3"));

        let error = BusMessage::error(&call, ERROR_FAILED, "line stuck");
        assert_eq!(error.error_name(), Some(ERROR_FAILED));
        assert_eq!(error.error_text(), "line stuck");
    }

    #[test]
    fn test_typed_arguments() {
        let message = BusMessage::signal("/p", "org.satlink.Test", "Sample")
            .with_arg(-3i16)
            .with_arg("label")
            .with_arg(BusValue::Bytes(vec![1, 2, 3]));

        assert_eq!(message.arg::<i16>(0).unwrap(), -3);
        assert_eq!(message.arg::<String>(1).unwrap(), "label");
        assert_eq!(message.arg::<Vec<u8>>(2).unwrap(), vec![1, 2, 3]);
        assert!(message.arg::<u32>(0).is_err());
        assert!(message.arg::<i16>(5).is_err());
    }

    #[test]
    fn test_message_serializes_to_json() {
        let message = BusMessage::signal("/p", "org.satlink.Test", "Sample").with_arg(1u8);
        let json = serde_json::to_string(&message).unwrap();
        let back: BusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}
