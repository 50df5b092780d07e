//! Exception classification, liveness watchdog and fault containment.
//!
//! ```text
//! VCPU exception ──► ExceptionHandler ──► RecoveryAction ──► SafeStateTransition
//! device fault   ──► FaultIsolation   ──► DeviceBus stops dispatching
//! stuck VCPU     ──► WatchdogTimer (polled)
//! ```

pub mod exception;
pub mod isolation;
pub mod transition;
pub mod validator;
pub mod watchdog;

pub use exception::{ErrorContext, ExceptionHandler, ExceptionInfo, RecoveryAction};
pub use isolation::FaultIsolation;
pub use transition::{SafeStateTransition, VmState};
pub use validator::{StateValidator, ValidationError};
pub use watchdog::{CycleCounter, ManualClock, MonotonicCycles, WatchdogTimer};
