//! Typed signals and calls carried on the bus.

use super::message::{BusMessage, BusValue};
use crate::error::BusError;
use serde::{Deserialize, Serialize};

/// A signal with a fixed path, interface and member and a typed body.
pub trait BusSignal: Sized {
    const PATH: &'static str;
    const INTERFACE: &'static str;
    const MEMBER: &'static str;

    fn to_args(&self) -> Vec<BusValue>;

    fn from_args(args: &[BusValue]) -> Result<Self, BusError>;

    fn to_message(&self) -> BusMessage {
        BusMessage::signal(Self::PATH, Self::INTERFACE, Self::MEMBER).with_args(self.to_args())
    }

    fn from_message(message: &BusMessage) -> Result<Self, BusError> {
        if message.interface() != Self::INTERFACE || message.member() != Self::MEMBER {
            return Err(BusError::Handler(format!(
                "{}.{} is not {}.{}",
                message.interface(),
                message.member(),
                Self::INTERFACE,
                Self::MEMBER
            )));
        }
        Self::from_args(message.args())
    }
}

pub const POWER_MANAGER_NAME: &str = "org.satlink.PowerManager";
pub const POWER_MANAGER_PATH: &str = "/org/satlink/PowerManager";
pub const POWER_MANAGER_INTERFACE: &str = "org.satlink.PowerManager";
pub const POWER_STATUS: &str = "PowerStatus";
pub const ENABLE_LINE: &str = "EnableLine";

/// State of the two switched power lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PowerStatus {
    pub line_one: i16,
    pub line_two: i16,
}

impl BusSignal for PowerStatus {
    const PATH: &'static str = POWER_MANAGER_PATH;
    const INTERFACE: &'static str = POWER_MANAGER_INTERFACE;
    const MEMBER: &'static str = POWER_STATUS;

    fn to_args(&self) -> Vec<BusValue> {
        vec![BusValue::Int16(self.line_one), BusValue::Int16(self.line_two)]
    }

    fn from_args(args: &[BusValue]) -> Result<Self, BusError> {
        match args {
            [line_one, line_two] => Ok(Self {
                line_one: i16::try_from(line_one)?,
                line_two: i16::try_from(line_two)?,
            }),
            _ => Err(BusError::Handler(format!(
                "PowerStatus takes 2 arguments, got {}",
                args.len()
            ))),
        }
    }
}

/// Method call asking the power manager to switch `line` on.
pub fn enable_line_call(line: i16) -> Result<BusMessage, BusError> {
    Ok(BusMessage::method_call(
        POWER_MANAGER_NAME,
        POWER_MANAGER_PATH,
        POWER_MANAGER_INTERFACE,
        ENABLE_LINE,
    )?
    .with_arg(line))
}

/// Line number carried by an `EnableLine` call.
pub fn enable_line_arg(call: &BusMessage) -> Result<i16, BusError> {
    call.arg(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_status_message() {
        let status = PowerStatus {
            line_one: 1,
            line_two: -1,
        };
        let message = status.to_message();
        assert_eq!(message.interface(), POWER_MANAGER_INTERFACE);
        assert_eq!(message.member(), POWER_STATUS);
        assert_eq!(PowerStatus::from_message(&message).unwrap(), status);
    }

    #[test]
    fn test_power_status_rejects_bad_body() {
        let short = BusMessage::signal(POWER_MANAGER_PATH, POWER_MANAGER_INTERFACE, POWER_STATUS).with_arg(1i16);
        assert!(PowerStatus::from_message(&short).is_err());

        let wrong_type = BusMessage::signal(POWER_MANAGER_PATH, POWER_MANAGER_INTERFACE, POWER_STATUS)
            .with_arg(1i32)
            .with_arg(2i32);
        assert!(PowerStatus::from_message(&wrong_type).is_err());

        let other = BusMessage::signal(POWER_MANAGER_PATH, POWER_MANAGER_INTERFACE, "Other")
            .with_arg(1i16)
            .with_arg(2i16);
        assert!(PowerStatus::from_message(&other).is_err());
    }

    #[test]
    fn test_enable_line_call() {
        let call = enable_line_call(2).unwrap();
        assert_eq!(call.destination().map(|d| d.as_str()), Some(POWER_MANAGER_NAME));
        assert_eq!(enable_line_arg(&call).unwrap(), 2);
    }
}
