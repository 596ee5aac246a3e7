mod error;
mod forward;
mod interception_gate;

pub use error::{GateError, GateResult};
pub use forward::{
    FailureCode, FailureReason, ForwardResolution, ForwardState, InterceptedForward,
    InterceptedPacket,
};
pub use interception_gate::{ForwardHandle, InterceptionGate, Interceptor};

#[cfg(test)]
mod tests;
