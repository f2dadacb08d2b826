//! Drive lifecycle states.

use derive_more::Display;

/// Why a drive ended up in [`Status::Error`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[display("expired")]
    Expired,
    #[display("login failed")]
    LoginFailed,
    #[display("unreachable")]
    Unreachable,
    #[display("unknown")]
    Unknown,
}

/// Connection state of a drive.
///
/// ```text
/// Unknown → Connecting → Ready | Error(code)
/// Ready ⇄ Disabled
/// any → Disconnecting → Disconnected
/// ```
///
/// Only [`Ready`](Status::Ready) drives take part in chunk allocation.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    #[display("unknown")]
    Unknown,
    #[display("connecting")]
    Connecting,
    #[display("ready")]
    Ready,
    #[display("disabled")]
    Disabled,
    #[display("error ({_0})")]
    Error(ErrorCode),
    #[display("disconnecting")]
    Disconnecting,
    #[display("disconnected")]
    Disconnected,
}

impl Status {
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self, Status::Ready)
    }

    /// Whether a transition to `next` is permitted.
    pub fn can_become(&self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (_, Disconnecting) => !matches!(self, Disconnected),
            (Disconnecting, Disconnected) => true,
            (Unknown | Error(_) | Disconnected, Connecting) => true,
            (Connecting, Ready | Error(_)) => true,
            (Ready, Disabled) | (Disabled, Ready) => true,
            _ => false,
        }
    }
}
