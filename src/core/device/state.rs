use std::fmt;

/// Why a device machine halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Went through cleanup and shutdown after `finalizar`.
    Completed,
    /// The server answered the bind request with `status: "fail"`.
    BindRejected,
    /// No answer to the bind request within the bind timeout.
    BindTimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Aguarde,
    Bind,
    Medicao,
    DeepSleep,
    Cleanup,
    Shutdown,
    Stopped(StopReason),
}

impl DeviceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceState::Stopped(_))
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Aguarde => f.write_str("AGUARDE"),
            DeviceState::Bind => f.write_str("BIND"),
            DeviceState::Medicao => f.write_str("MEDICAO"),
            DeviceState::DeepSleep => f.write_str("DEEP_SLEEP"),
            DeviceState::Cleanup => f.write_str("CLEANUP"),
            DeviceState::Shutdown => f.write_str("SHUTDOWN"),
            DeviceState::Stopped(reason) => write!(f, "STOPPED({:?})", reason),
        }
    }
}
